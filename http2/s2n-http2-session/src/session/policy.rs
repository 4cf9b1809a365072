// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Role-specific strategies composed into a session
//!
//! The engine itself is symmetric. What a client and a server do
//! differently (which unknown stream ids they accept, how header fragments
//! are processed before the application sees them) is expressed through
//! these two strategies rather than through subclassing.

use crate::{session::Session, stream::Stream};
use bytes::Bytes;
use s2n_http2_core::{connection_error, endpoint, error::Error, frame::Headers, stream::StreamId};
use std::sync::Arc;

/// Decides how inbound HEADERS interact with stream creation
pub trait HeadersPolicy: Send + Sync + 'static {
    /// An inbound HEADERS names a peer-initiated stream id the session has
    /// never seen; may this open a stream?
    ///
    /// The session has already checked id monotonicity and the remote
    /// stream cap before asking.
    fn accept_remote_stream(&self, session: &Session, id: StreamId) -> Result<(), Error> {
        let _ = (session, id);
        Ok(())
    }

    /// Inspects a header fragment before the listener sees it
    ///
    /// This is where a role-specific layer hooks request/response
    /// validation; the engine forwards the fragment opaquely.
    fn on_headers(
        &self,
        session: &Session,
        stream: &Stream,
        frame: &Headers<Bytes>,
    ) -> Result<(), Error> {
        let _ = (session, stream, frame);
        Ok(())
    }
}

/// The symmetric default: every protocol-legal remote stream is accepted
#[derive(Clone, Copy, Debug, Default)]
pub struct SymmetricPolicy;

impl HeadersPolicy for SymmetricPolicy {}

/// The client-side policy: servers may only open streams they promised
///
/// A PUSH_PROMISE reserves the stream before its HEADERS arrive, so by the
/// time HEADERS shows up for an even id, the stream exists. HEADERS for an
/// unknown server-initiated id is therefore a protocol violation.
#[derive(Clone, Copy, Debug, Default)]
pub struct ClientPolicy;

impl HeadersPolicy for ClientPolicy {
    fn accept_remote_stream(&self, session: &Session, id: StreamId) -> Result<(), Error> {
        let _ = session;
        debug_assert_eq!(id.initiator(), endpoint::Type::Server);

        //= https://www.rfc-editor.org/rfc/rfc7540#section-5.1
        //# Receiving any frame other than HEADERS or PRIORITY on a stream in
        //# this state MUST be treated as a connection error (Section 5.4.1)
        //# of type PROTOCOL_ERROR.
        Err(connection_error!(
            PROTOCOL_ERROR,
            "server stream without a push promise"
        ))
    }
}

/// Constructs the stream objects a session registers
///
/// Override to interpose instrumentation or custom initial accounting on
/// every stream.
pub trait StreamFactory: Send + Sync + 'static {
    fn create(
        &self,
        id: StreamId,
        local: bool,
        send_window: i32,
        recv_window: i32,
    ) -> Arc<Stream> {
        Stream::new(id, local, send_window, recv_window)
    }
}

/// The default factory
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultStreamFactory;

impl StreamFactory for DefaultStreamFactory {}
