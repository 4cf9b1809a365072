// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Session events delivered to the application

use crate::{error::Error, stream::Stream};
use bytes::Bytes;
use s2n_http2_core::{
    error::ErrorCode,
    frame::{Headers, Settings},
    stream::StreamId,
};
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

/// Everything a session reports upward, as one tagged type
#[derive(Debug)]
#[non_exhaustive]
pub enum Event {
    /// The peer opened a new stream
    NewStream { stream: Arc<Stream> },

    /// A HEADERS frame arrived on a stream
    ///
    /// The fragment is still HPACK-encoded; decoding belongs to the codec
    /// layer above the engine.
    Headers {
        stream: Arc<Stream>,
        frame: Headers<Bytes>,
    },

    /// DATA arrived on a stream
    ///
    /// Flow-control credits are not returned to the peer until the
    /// application acknowledges the bytes with
    /// [`crate::session::Session::data_consumed`].
    Data {
        stream: Arc<Stream>,
        data: Bytes,
        end_stream: bool,
    },

    /// The peer's SETTINGS frame was applied and acknowledged
    Settings { frame: Settings },

    /// The peer answered a locally submitted PING
    PingReply { payload: [u8; 8] },

    /// A stream was reset
    Reset {
        stream_id: StreamId,
        error_code: ErrorCode,
        /// True when the reset originated locally (idle timeout, refusal)
        local: bool,
    },

    /// The peer announced shutdown with a GOAWAY
    GoAway {
        last_stream_id: StreamId,
        error_code: ErrorCode,
        debug_data: Bytes,
    },

    /// The session failed and is closing
    Failure { error: Error },
}

/// The application's view of a session
///
/// Implementations are invoked from engine threads (parser, flusher
/// completion, timer) and must not assume any particular one. A panic in a
/// callback is logged and swallowed; it never tears down the session or
/// affects other streams.
pub trait SessionListener: Send + Sync {
    fn on_event(&self, event: Event);

    /// The session was idle for the configured timeout while open
    ///
    /// Returning true (the default) lets the session close gracefully;
    /// returning false keeps it alive for another timeout period.
    fn on_idle_timeout(&self) -> bool {
        true
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

/// Wraps the listener so application exceptions stay out of the engine
pub(crate) struct Notifier {
    listener: Box<dyn SessionListener>,
}

impl Notifier {
    pub(crate) fn new(listener: Box<dyn SessionListener>) -> Self {
        Self { listener }
    }

    pub(crate) fn event(&self, event: Event) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| self.listener.on_event(event))) {
            tracing::warn!(panic = panic_message(&panic), "session listener panicked");
        }
    }

    pub(crate) fn idle_timeout(&self) -> bool {
        match catch_unwind(AssertUnwindSafe(|| self.listener.on_idle_timeout())) {
            Ok(close) => close,
            Err(panic) => {
                tracing::warn!(panic = panic_message(&panic), "session listener panicked");
                true
            }
        }
    }
}
