// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Timer scheduling consumed by the session's idle handling

use core::time::Duration;

/// A one-shot timer scheduled through a [`Scheduler`]
pub trait Timer: Send + Sync {
    /// Attempts to cancel the timer
    ///
    /// Returns false when the callback already fired (or is firing); the
    /// caller must tolerate the callback running concurrently with a failed
    /// cancel.
    fn cancel(&self) -> bool;
}

/// The timer facility the session schedules idle deadlines on
///
/// Implementations deliver callbacks on a timer thread of their choosing;
/// the engine performs its own locking and never assumes a particular
/// thread.
pub trait Scheduler: Send + Sync + 'static {
    fn schedule(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> Box<dyn Timer>;
}
