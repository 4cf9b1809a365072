// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The byte transport underneath a session
//!
//! The session engine never touches a socket. It hands fully encoded frame
//! batches to a [`Transport`] and is driven forward by the completion
//! callback, so any reliable, ordered byte sink (TCP, TLS, an in-memory
//! pipe in tests) can carry a session.

use bytes::Bytes;
use std::io;

/// Invoked exactly once per [`Transport::write`] submission
pub type WriteCompletion = Box<dyn FnOnce(io::Result<()>) + Send>;

pub trait Transport: Send + Sync + 'static {
    /// Submits a single gathered write of encoded frames
    ///
    /// Writes are submitted one at a time; the engine waits for the
    /// completion before submitting the next batch. The completion may be
    /// invoked inline when the transport can accept the bytes immediately.
    fn write(&self, data: Bytes, on_complete: WriteCompletion);

    /// Shuts down the output direction, leaving input readable
    ///
    /// Invoked after a locally initiated GOAWAY has been flushed; the peer
    /// keeps sending until it observes the shutdown.
    fn shutdown_output(&self);

    /// Closes the transport in both directions
    fn close(&self);
}
