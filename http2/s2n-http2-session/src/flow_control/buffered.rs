// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    flow_control::{debit_receive_windows, refund_session, refund_stream, FlowController},
    session::Session,
    stream::Stream,
};
use s2n_http2_core::error::Error;
use std::sync::Arc;

/// The buffer-aware strategy
///
/// Received octets sit in application-visible buffers until consumed, so
/// the session-scope credit is returned as soon as the data is accepted
/// off the wire; a slow stream then only stalls itself, never its
/// siblings. Stream-scope credit still waits for consumption, which is
/// what bounds the per-stream buffer.
#[derive(Clone, Copy, Debug, Default)]
pub struct Buffered;

impl FlowController for Buffered {
    fn on_data_received(
        &self,
        session: &Arc<Session>,
        stream: Option<&Arc<Stream>>,
        size: u32,
    ) -> Result<(), Error> {
        debit_receive_windows(session, stream, size)?;

        if let Some(stream) = stream {
            stream.add_buffered(size);
            refund_session(session, size);
        }

        Ok(())
    }

    fn on_data_consumed(&self, session: &Arc<Session>, stream: &Arc<Stream>, size: u32) {
        if size == 0 {
            return;
        }
        stream.sub_buffered(size);
        // the session scope was refunded on receipt
        refund_stream(session, stream, size);
    }

    fn on_stream_destroyed(&self, session: &Arc<Session>, stream: &Stream) {
        // clear the scratch counter; the session scope was refunded on
        // receipt, so octets buffered at destruction leak no connection
        // credit
        let orphaned = stream.buffered();
        if orphaned > 0 {
            stream.sub_buffered(orphaned);
        }
        let _ = session;
    }
}
