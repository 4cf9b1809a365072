// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Acquires a mutex, recovering the data if a previous holder panicked
///
/// Listener panics are caught at the notification boundary, so a poisoned
/// lock here can only come from an engine bug; the guarded state itself is
/// still consistent because every critical section completes its updates
/// before calling out.
#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
