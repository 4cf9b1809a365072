// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Completion callbacks with a declared invocation type

use crate::error::Error;
use core::fmt;

type Callback = Box<dyn FnOnce(Result<(), Error>) + Send>;

/// A one-shot completion callback attached to a submitted frame
///
/// The variant declares how the callback may be invoked: a
/// [`Task::NonBlocking`] callback promises to return promptly and may be
/// inlined on whichever engine thread completes the entry, while a
/// [`Task::Blocking`] callback may block and must only be invoked from a
/// context that tolerates that.
pub enum Task {
    Blocking(Callback),
    NonBlocking(Callback),
}

impl Task {
    #[inline]
    pub fn blocking(callback: impl FnOnce(Result<(), Error>) + Send + 'static) -> Self {
        Self::Blocking(Box::new(callback))
    }

    #[inline]
    pub fn non_blocking(callback: impl FnOnce(Result<(), Error>) + Send + 'static) -> Self {
        Self::NonBlocking(Box::new(callback))
    }

    /// A completion nobody is waiting on
    #[inline]
    pub fn noop() -> Self {
        Self::NonBlocking(Box::new(|_| ()))
    }

    #[inline]
    pub fn is_non_blocking(&self) -> bool {
        matches!(self, Self::NonBlocking(_))
    }

    /// Invokes the callback with the outcome of the entry
    #[inline]
    pub fn complete(self, result: Result<(), Error>) {
        match self {
            Self::Blocking(callback) | Self::NonBlocking(callback) => callback(result),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match self {
            Self::Blocking(_) => "Blocking",
            Self::NonBlocking(_) => "NonBlocking",
        };
        f.debug_tuple("Task").field(&kind).finish()
    }
}
