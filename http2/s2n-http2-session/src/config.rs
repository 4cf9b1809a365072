// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::{fmt, time::Duration};
use s2n_http2_core::window;

/// The value meaning "no limit" for stream count caps
pub const UNLIMITED_STREAMS: i64 = -1;

/// A configuration value was out of range
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ValidationError(&'static str);

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl std::error::Error for ValidationError {}

macro_rules! validation_invariant {
    ($expr:expr, $message:expr) => {
        if !($expr) {
            return Err(ValidationError($message));
        }
    };
}

/// Tunable limits for a session
#[derive(Clone, Copy, Debug)]
pub struct Config {
    pub(crate) max_remote_streams: i64,
    pub(crate) initial_window_size: u32,
    pub(crate) session_idle_timeout: Option<Duration>,
    pub(crate) stream_idle_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! setter {
    ($(#[doc = $doc:literal])* $name:ident, $field:ident, $inner:ty $(, |$validate_value:ident| $validation:block)?) => {
        $(#[doc = $doc])*
        pub fn $name(mut self, value: $inner) -> Result<Self, ValidationError> {
            $(
                let $validate_value = value;
                $validation
            )?
            self.$field = value.into();
            Ok(self)
        }
    };
}

impl Config {
    pub const fn new() -> Self {
        Self {
            max_remote_streams: 128,
            initial_window_size: window::INITIAL_WINDOW_SIZE as u32,
            session_idle_timeout: Some(Duration::from_secs(30)),
            stream_idle_timeout: None,
        }
    }

    setter!(
        /// Caps the number of concurrently open peer-initiated streams
        ///
        /// Advertised to the peer as SETTINGS_MAX_CONCURRENT_STREAMS by the
        /// layer that emits the connection preface. Pass
        /// [`UNLIMITED_STREAMS`] to disable the cap.
        with_max_remote_streams,
        max_remote_streams,
        i64,
        |value| {
            validation_invariant!(
                value >= UNLIMITED_STREAMS,
                "max_remote_streams must be -1 (unlimited) or non-negative"
            );
        }
    );

    setter!(
        /// The receive window granted to the peer for each new stream
        ///
        /// Advertised as SETTINGS_INITIAL_WINDOW_SIZE.
        with_initial_window_size,
        initial_window_size,
        u32,
        |value| {
            validation_invariant!(
                value <= window::MAX_WINDOW_SIZE as u32,
                "initial_window_size must not exceed 2^31-1"
            );
        }
    );

    /// Aborts the session when no frame moves in either direction for this
    /// long
    pub fn with_session_idle_timeout(
        mut self,
        value: Option<Duration>,
    ) -> Result<Self, ValidationError> {
        validation_invariant!(
            value != Some(Duration::ZERO),
            "session_idle_timeout must be non-zero"
        );
        self.session_idle_timeout = value;
        Ok(self)
    }

    /// Resets a stream with CANCEL when it sees no activity for this long
    pub fn with_stream_idle_timeout(
        mut self,
        value: Option<Duration>,
    ) -> Result<Self, ValidationError> {
        validation_invariant!(
            value != Some(Duration::ZERO),
            "stream_idle_timeout must be non-zero"
        );
        self.stream_idle_timeout = value;
        Ok(self)
    }

    #[inline]
    pub fn max_remote_streams(&self) -> i64 {
        self.max_remote_streams
    }

    #[inline]
    pub fn initial_window_size(&self) -> u32 {
        self.initial_window_size
    }
}
