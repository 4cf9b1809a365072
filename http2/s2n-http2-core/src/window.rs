// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Flow-control window arithmetic
//!
//! Windows are signed so that a SETTINGS_INITIAL_WINDOW_SIZE reduction can
//! push a stream's credit below zero without losing track of the deficit.

use crate::error::{Error, ErrorCode};

//= https://www.rfc-editor.org/rfc/rfc7540#section-6.9.1
//# When an HTTP/2 connection is first established, new streams are
//# created with an initial flow-control window size of 65,535 octets.

/// The initial window size for both the session and every new stream
pub const INITIAL_WINDOW_SIZE: i32 = 65_535;

//= https://www.rfc-editor.org/rfc/rfc7540#section-6.9.1
//# A sender MUST NOT allow a flow-control window to exceed 2^31-1
//# octets.

/// The largest legal flow-control window
pub const MAX_WINDOW_SIZE: i32 = i32::MAX;

/// A flow-control credit for one direction of one scope (session or stream)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Window(i32);

impl Window {
    #[inline]
    pub const fn new(size: i32) -> Self {
        Self(size)
    }

    #[inline]
    pub const fn size(self) -> i32 {
        self.0
    }

    /// Adds `increment` credits, failing if the window would exceed
    /// [`MAX_WINDOW_SIZE`]
    #[inline]
    pub fn credit(self, increment: u32) -> Result<Self, Error> {
        checked_credit(self.0, increment).map(Self)
    }

    /// Removes `amount` credits
    ///
    /// The result may be negative; the caller decides whether a deficit is a
    /// protocol violation for its scope.
    #[inline]
    pub fn debit(self, amount: u32) -> Self {
        Self(saturating_debit(self.0, amount))
    }

    /// Applies a signed adjustment (an initial-window-size delta), failing if
    /// the window would exceed [`MAX_WINDOW_SIZE`]
    #[inline]
    pub fn adjust(self, delta: i32) -> Result<Self, Error> {
        checked_adjust(self.0, delta).map(Self)
    }
}

impl Default for Window {
    #[inline]
    fn default() -> Self {
        Self(INITIAL_WINDOW_SIZE)
    }
}

/// Window growth past 2^31-1 is a FLOW_CONTROL_ERROR for the scope that
/// overflowed
#[inline]
pub fn checked_credit(window: i32, increment: u32) -> Result<i32, Error> {
    i64::from(window)
        .checked_add(i64::from(increment))
        .filter(|updated| *updated <= i64::from(MAX_WINDOW_SIZE))
        .map(|updated| updated as i32)
        .ok_or(Error::connection(
            ErrorCode::FLOW_CONTROL_ERROR,
            "flow control window overflow",
        ))
}

#[inline]
pub fn checked_adjust(window: i32, delta: i32) -> Result<i32, Error> {
    let updated = i64::from(window) + i64::from(delta);
    if updated > i64::from(MAX_WINDOW_SIZE) {
        return Err(Error::connection(
            ErrorCode::FLOW_CONTROL_ERROR,
            "initial window size adjustment overflow",
        ));
    }
    Ok(updated.max(i64::from(i32::MIN)) as i32)
}

/// Debits saturate at `i32::MIN` instead of wrapping; a deficit that large
/// has long since failed the connection
#[inline]
pub fn saturating_debit(window: i32, amount: u32) -> i32 {
    let updated = i64::from(window) - i64::from(amount);
    updated.max(i64::from(i32::MIN)) as i32
}
