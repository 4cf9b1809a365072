// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Per-stream state
//!
//! A [`Stream`] tracks the RFC 7540 lifecycle state machine, both
//! flow-control windows, and the idle deadline for one multiplexed stream.
//! Streams are shared between the session, the flusher, and the
//! application; the registry in [`map`] stays authoritative for which
//! streams exist.

pub(crate) mod map;

use crate::sync::lock;
use s2n_http2_core::{
    error::Error,
    state,
    stream::{State, StreamId},
    stream_error, window,
};
use std::sync::{
    atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, Ordering},
    Arc, Mutex,
};

pub struct Stream {
    id: StreamId,
    local: bool,
    state: Mutex<State>,

    /// Credits for data we may send; mutated only by the flusher
    send_window: AtomicI32,
    /// Credits for data the peer may send; debited on receipt, credited as
    /// WINDOW_UPDATE frames go out
    recv_window: AtomicI32,

    /// Octets the application consumed that have not been advertised back
    /// to the peer yet; owned by the flow-control strategy
    pending_refund: AtomicU32,
    /// Octets received but not yet consumed; owned by the buffer-aware
    /// flow-control strategy
    buffered: AtomicU32,

    /// Nanoseconds since the session epoch of the last observed activity
    last_activity: AtomicU64,

    reset: AtomicBool,
}

impl Stream {
    pub(crate) fn new(id: StreamId, local: bool, send_window: i32, recv_window: i32) -> Arc<Self> {
        Arc::new(Self {
            id,
            local,
            state: Mutex::new(State::Idle),
            send_window: AtomicI32::new(send_window),
            recv_window: AtomicI32::new(recv_window),
            pending_refund: AtomicU32::new(0),
            buffered: AtomicU32::new(0),
            last_activity: AtomicU64::new(0),
            reset: AtomicBool::new(false),
        })
    }

    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Whether the local endpoint initiated the stream
    #[inline]
    pub fn is_local(&self) -> bool {
        self.local
    }

    #[inline]
    pub fn send_window(&self) -> i32 {
        self.send_window.load(Ordering::Acquire)
    }

    #[inline]
    pub fn recv_window(&self) -> i32 {
        self.recv_window.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        lock(&self.state).is_closed()
    }

    #[inline]
    pub fn is_local_closed(&self) -> bool {
        lock(&self.state).is_local_closed()
    }

    #[inline]
    pub fn is_remote_closed(&self) -> bool {
        lock(&self.state).is_remote_closed()
    }

    #[inline]
    pub fn is_reset(&self) -> bool {
        self.reset.load(Ordering::Acquire)
    }

    pub(crate) fn state(&self) -> State {
        *lock(&self.state)
    }

    // ===== lifecycle transitions =====

    /// A HEADERS frame for this stream was handed to the transport
    ///
    /// Transition failures on the send half are engine bugs, not peer
    /// behavior, so they are asserted rather than propagated.
    pub(crate) fn on_headers_sent(&self, end_stream: bool) {
        let mut state = lock(&self.state);
        // trailers leave the state alone, so a failed transition out of an
        // open state is expected
        let _ = state.on_send_headers();
        if end_stream {
            let _ = state.on_send_end_stream();
        }
    }

    /// A PUSH_PROMISE reserving this stream was handed to the transport
    pub(crate) fn on_push_promise_sent(&self) {
        let _ = lock(&self.state).on_send_push_promise();
    }

    /// A PUSH_PROMISE reserving this stream arrived from the peer
    pub(crate) fn on_push_promise_received(&self) {
        let _ = lock(&self.state).on_recv_push_promise();
    }

    /// The final DATA chunk of a frame with END_STREAM was written
    pub(crate) fn on_end_stream_sent(&self) {
        let _ = lock(&self.state).on_send_end_stream();
    }

    /// A HEADERS frame arrived from the peer
    pub(crate) fn on_headers_received(&self, end_stream: bool) -> Result<(), Error> {
        let mut state = lock(&self.state);

        match state.on_recv_headers() {
            Ok(()) => {}
            // trailers on an open receive half
            Err(state::Error::InvalidTransition {
                current: State::Open | State::HalfClosedLocal,
                ..
            }) => {}
            Err(_) => return Err(stream_error!(STREAM_CLOSED, "headers on a closed stream")),
        }

        if end_stream {
            state
                .on_recv_end_stream()
                .map_err(|_| stream_error!(STREAM_CLOSED, "end of stream on a closed stream"))?;
        }

        Ok(())
    }

    /// A DATA frame arrived from the peer
    pub(crate) fn on_data_received(&self, end_stream: bool) -> Result<(), Error> {
        let mut state = lock(&self.state);

        //= https://www.rfc-editor.org/rfc/rfc7540#section-6.1
        //# If a DATA frame is received whose stream is not in "open" or
        //# "half-closed (local)" state, the recipient MUST respond with a
        //# stream error (Section 5.4.2) of type STREAM_CLOSED.
        if !matches!(*state, State::Open | State::HalfClosedLocal) {
            return Err(stream_error!(STREAM_CLOSED, "data on a closed stream"));
        }

        if end_stream {
            state
                .on_recv_end_stream()
                .map_err(|_| stream_error!(STREAM_CLOSED, "end of stream on a closed stream"))?;
        }

        Ok(())
    }

    /// The stream was reset, by either side
    pub(crate) fn on_reset(&self) {
        self.reset.store(true, Ordering::Release);
        let _ = lock(&self.state).on_reset();
    }

    // ===== flow-control accounting =====

    /// Debits the receive window for an arriving DATA frame
    ///
    /// Returns the updated window; a negative result means the peer
    /// overshot its credit.
    #[inline]
    pub fn debit_recv_window(&self, amount: u32) -> i32 {
        debit(&self.recv_window, amount)
    }

    /// Credits the receive window as a WINDOW_UPDATE goes out
    #[inline]
    pub fn credit_recv_window(&self, increment: u32) -> Result<i32, Error> {
        update(&self.recv_window, |window| {
            window::checked_credit(window, increment)
        })
    }

    /// Applies a signed initial-window delta to the receive window
    #[inline]
    pub fn adjust_recv_window(&self, delta: i32) -> Result<i32, Error> {
        update(&self.recv_window, |window| {
            window::checked_adjust(window, delta)
        })
    }

    /// Flusher only: debits the send window for emitted data
    #[inline]
    pub(crate) fn debit_send_window(&self, amount: u32) -> i32 {
        debit(&self.send_window, amount)
    }

    /// Flusher only: credits the send window for an inbound WINDOW_UPDATE
    #[inline]
    pub(crate) fn credit_send_window(&self, increment: u32) -> Result<i32, Error> {
        update(&self.send_window, |window| {
            window::checked_credit(window, increment)
        })
    }

    /// Flusher only: applies a signed initial-window delta to the send
    /// window
    #[inline]
    pub(crate) fn adjust_send_window(&self, delta: i32) -> Result<i32, Error> {
        update(&self.send_window, |window| {
            window::checked_adjust(window, delta)
        })
    }

    /// Strategy scratch: accumulates consumed octets awaiting a
    /// WINDOW_UPDATE
    #[inline]
    pub(crate) fn add_pending_refund(&self, amount: u32) -> u32 {
        self.pending_refund.fetch_add(amount, Ordering::AcqRel) + amount
    }

    #[inline]
    pub(crate) fn take_pending_refund(&self) -> u32 {
        self.pending_refund.swap(0, Ordering::AcqRel)
    }

    /// Strategy scratch: received-but-unconsumed octet accounting
    #[inline]
    pub(crate) fn add_buffered(&self, amount: u32) {
        self.buffered.fetch_add(amount, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn sub_buffered(&self, amount: u32) {
        self.buffered.fetch_sub(amount, Ordering::AcqRel);
    }

    #[inline]
    pub fn buffered(&self) -> u32 {
        self.buffered.load(Ordering::Acquire)
    }

    // ===== idle tracking =====

    #[inline]
    pub(crate) fn not_idle(&self, now_nanos: u64) {
        self.last_activity.store(now_nanos, Ordering::Release);
    }

    #[inline]
    pub(crate) fn last_activity(&self) -> u64 {
        self.last_activity.load(Ordering::Acquire)
    }
}

impl core::fmt::Debug for Stream {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("state", &self.state())
            .field("send_window", &self.send_window())
            .field("recv_window", &self.recv_window())
            .finish()
    }
}

/// CAS loop for fallible window arithmetic on an atomic cell
pub(crate) fn update(
    cell: &AtomicI32,
    mut apply: impl FnMut(i32) -> Result<i32, Error>,
) -> Result<i32, Error> {
    let mut current = cell.load(Ordering::Acquire);
    loop {
        let updated = apply(current)?;
        match cell.compare_exchange_weak(current, updated, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return Ok(updated),
            Err(observed) => current = observed,
        }
    }
}

/// CAS loop for the infallible, saturating debit
pub(crate) fn debit(cell: &AtomicI32, amount: u32) -> i32 {
    let mut current = cell.load(Ordering::Acquire);
    loop {
        let updated = window::saturating_debit(current, amount);
        match cell.compare_exchange_weak(current, updated, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return updated,
            Err(observed) => current = observed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> Arc<Stream> {
        Stream::new(StreamId::new_truncated(1), true, 65_535, 65_535)
    }

    #[test]
    fn windows_track_debits_and_credits() {
        let stream = stream();
        assert_eq!(stream.debit_recv_window(110), 65_425);
        assert_eq!(stream.credit_recv_window(110).unwrap(), 65_535);
        assert!(stream
            .credit_recv_window(window::MAX_WINDOW_SIZE as u32)
            .is_err());
    }

    #[test]
    fn trailers_do_not_close_the_stream() {
        let stream = stream();
        stream.on_headers_received(false).unwrap();
        stream.on_headers_received(false).unwrap();
        stream.on_headers_received(true).unwrap();
        assert!(stream.is_remote_closed());
        assert!(!stream.is_closed());
    }

    #[test]
    fn data_after_end_stream_is_a_stream_error() {
        let stream = stream();
        stream.on_headers_received(false).unwrap();
        stream.on_data_received(true).unwrap();

        let error = stream.on_data_received(false).unwrap_err();
        assert_eq!(
            error.code,
            s2n_http2_core::error::ErrorCode::STREAM_CLOSED
        );
        assert!(!error.is_connection_error());
    }
}
