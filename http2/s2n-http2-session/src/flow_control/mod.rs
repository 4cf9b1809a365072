// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Credit accounting strategies
//!
//! The session calls into a [`FlowController`] at every point where
//! flow-control state changes hands: data arriving, the application
//! consuming it, data leaving, and window reconfiguration. The default
//! method bodies implement the canonical RFC 7540 arithmetic; strategies
//! override the refund policy.
//!
//! Send windows are only ever mutated from the flusher, which is the single
//! caller of [`FlowController::window_update`] and the `local = false` side
//! of [`FlowController::update_initial_stream_window`].

mod buffered;
mod simple;

pub use buffered::Buffered;
pub use simple::Simple;

use crate::{session::Session, stream::Stream};
use s2n_http2_core::{
    connection_error,
    error::{Error, Scope},
    frame::WindowUpdate,
    stream_error,
};
use std::sync::Arc;

/// Emit a WINDOW_UPDATE once the unadvertised refund crosses half the
/// window target
#[inline]
pub(crate) fn crossed_refund_threshold(pending: u32, target: u32) -> bool {
    u64::from(pending) * 2 > u64::from(target)
}

/// Debits both receive windows for an arriving DATA frame
///
/// The session window is debited even when the stream is gone; data in
/// flight behind a reset still consumed the peer's view of the session
/// window, and skipping the debit would desynchronize the two endpoints.
pub(crate) fn debit_receive_windows(
    session: &Session,
    stream: Option<&Arc<Stream>>,
    size: u32,
) -> Result<(), Error> {
    let session_window = session.debit_recv_window(size);

    let Some(stream) = stream else {
        return Ok(());
    };

    if session_window < 0 {
        return Err(connection_error!(
            FLOW_CONTROL_ERROR,
            "session receive window exceeded"
        ));
    }

    if stream.debit_recv_window(size) < 0 {
        return Err(stream_error!(
            FLOW_CONTROL_ERROR,
            "stream receive window exceeded"
        ));
    }

    Ok(())
}

/// Accumulates a session-scope refund, emitting a WINDOW_UPDATE at the
/// threshold
pub(crate) fn refund_session(session: &Arc<Session>, size: u32) {
    let pending = session.add_pending_refund(size);
    if crossed_refund_threshold(pending, session.local_initial_window() as u32) {
        let increment = session.take_pending_refund();
        if increment > 0 {
            session.submit_window_update(None, increment);
        }
    }
}

/// Accumulates a stream-scope refund, emitting a WINDOW_UPDATE at the
/// threshold
pub(crate) fn refund_stream(session: &Arc<Session>, stream: &Arc<Stream>, size: u32) {
    let pending = stream.add_pending_refund(size);
    if crossed_refund_threshold(pending, session.local_initial_window() as u32) {
        let increment = stream.take_pending_refund();
        // a reset or closed stream no longer needs stream-level credit
        if increment > 0 && !stream.is_reset() && !stream.is_remote_closed() {
            session.submit_window_update(Some(stream), increment);
        }
    }
}

pub trait FlowController: Send + Sync + 'static {
    /// A stream was registered
    fn on_stream_created(&self, stream: &Stream) {
        let _ = stream;
    }

    /// A stream was removed from the registry
    fn on_stream_destroyed(&self, session: &Arc<Session>, stream: &Stream) {
        let _ = (session, stream);
    }

    /// A DATA frame arrived; debit the receive windows
    ///
    /// `stream` is `None` when the frame raced a reset; the session window
    /// is debited regardless.
    fn on_data_received(
        &self,
        session: &Arc<Session>,
        stream: Option<&Arc<Stream>>,
        size: u32,
    ) -> Result<(), Error> {
        debit_receive_windows(session, stream, size)
    }

    /// DATA arrived for a stream that no longer exists and was dropped
    ///
    /// Nothing will ever consume those octets, so the session-scope credit
    /// is returned immediately.
    fn on_data_dropped(&self, session: &Arc<Session>, size: u32) {
        refund_session(session, size);
    }

    /// The application consumed `size` octets it received on `stream`
    fn on_data_consumed(&self, session: &Arc<Session>, stream: &Arc<Stream>, size: u32) {
        if size == 0 {
            return;
        }
        refund_stream(session, stream, size);
        refund_session(session, size);
    }

    /// A data chunk is about to be handed to the transport
    fn on_data_sending(&self, session: &Session, stream: &Stream, size: u32) {
        let _ = (session, stream, size);
    }

    /// The transport accepted a data chunk
    fn on_data_sent(&self, session: &Session, stream: &Stream, size: u32) {
        let _ = (session, stream, size);
    }

    /// An outbound WINDOW_UPDATE left the transport; the promised credit is
    /// now effective locally
    fn on_window_update_sent(&self, session: &Session, stream: Option<&Stream>, increment: u32) {
        let result = match stream {
            Some(stream) => stream.credit_recv_window(increment),
            None => session.credit_recv_window(increment),
        };
        debug_assert!(result.is_ok(), "local refunds never exceed the window");
        if result.is_err() {
            tracing::debug!(increment, "receive window refund overflowed");
        }
    }

    /// An inbound WINDOW_UPDATE is applied; flusher context only
    fn window_update(
        &self,
        session: &Session,
        stream: Option<&Stream>,
        frame: &WindowUpdate,
    ) -> Result<(), Error> {
        match stream {
            Some(stream) => {
                //= https://www.rfc-editor.org/rfc/rfc7540#section-6.9.1
                //# A sender MUST NOT allow a flow-control window to exceed 2^31-1
                //# octets.  If a sender receives a WINDOW_UPDATE that causes a
                //# flow-control window to exceed this maximum, it MUST terminate
                //# either the stream or the connection, as appropriate.
                stream.credit_send_window(frame.increment).map(drop).map_err(
                    |mut error| {
                        error.scope = Scope::Stream;
                        error
                    },
                )
            }
            None => session.credit_send_window(frame.increment).map(drop),
        }
    }

    /// SETTINGS_INITIAL_WINDOW_SIZE changed; adjust every stream's window
    ///
    /// `local = true` applies the locally announced value to receive
    /// windows and runs from the flusher's pre-write hook, atomically with
    /// the SETTINGS frame's emission. `local = false` applies the peer's
    /// value to send windows from the flush cycle.
    fn update_initial_stream_window(
        &self,
        session: &Session,
        new_initial: u32,
        local: bool,
    ) -> Result<(), Error> {
        let delta = session.swap_initial_window(new_initial, local);
        if delta == 0 {
            return Ok(());
        }

        let mut failure = None;
        session.for_each_stream(|stream| {
            if failure.is_some() {
                return;
            }
            let result = if local {
                stream.adjust_recv_window(delta)
            } else {
                stream.adjust_send_window(delta)
            };
            if let Err(error) = result {
                //= https://www.rfc-editor.org/rfc/rfc7540#section-6.9.2
                //# An endpoint MUST treat a change to SETTINGS_INITIAL_WINDOW_SIZE
                //# that causes any flow-control window to exceed the maximum size
                //# as a connection error (Section 5.4.1) of type
                //# FLOW_CONTROL_ERROR.
                if local {
                    // our own announced shrink/growth was validated up
                    // front; an overflow here only loses refund headroom
                    tracing::debug!(delta, "local initial window adjustment clamped");
                } else {
                    failure = Some(error.with_reason(
                        "initial window size adjustment overflowed a stream window",
                    ));
                }
            }
        });

        failure.map_or(Ok(()), Err)
    }
}
