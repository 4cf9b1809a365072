// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    error::ErrorCode,
    frame::{Flags, FrameHeader, Tag},
    stream::StreamId,
};
use s2n_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc7540#section-6.8
//# The GOAWAY frame (type=0x7) is used to initiate shutdown of a
//# connection or to signal serious error conditions.  GOAWAY allows an
//# endpoint to gracefully stop accepting new streams while still
//# finishing processing of previously established streams.

macro_rules! go_away_tag {
    () => {
        0x7u8
    };
}

//= https://www.rfc-editor.org/rfc/rfc7540#section-6.8
//# +-+-------------------------------------------------------------+
//# |R|                  Last-Stream-ID (31)                        |
//# +-+-------------------------------------------------------------+
//# |                      Error Code (32)                          |
//# +---------------------------------------------------------------+
//# |                  Additional Debug Data (*)                    |
//# +---------------------------------------------------------------+

#[derive(Debug, PartialEq, Eq)]
pub struct GoAway<Payload> {
    /// The highest-numbered stream the sender might have acted on
    pub last_stream_id: StreamId,

    /// Why the connection is shutting down
    pub error_code: ErrorCode,

    /// Opaque diagnostic data; by convention a UTF-8 reason phrase
    pub debug_data: Payload,
}

impl<Payload> GoAway<Payload> {
    #[inline]
    pub fn tag(&self) -> Tag {
        go_away_tag!()
    }

    /// GOAWAY frames always apply to the connection
    #[inline]
    pub fn stream_id(&self) -> StreamId {
        StreamId::CONNECTION
    }

    /// Converts the debug data from one payload type to another
    #[inline]
    pub fn map_payload<F: FnOnce(Payload) -> Out, Out>(self, map: F) -> GoAway<Out> {
        GoAway {
            last_stream_id: self.last_stream_id,
            error_code: self.error_code,
            debug_data: map(self.debug_data),
        }
    }
}

decoder_parameterized_value!(
    impl<'a, Payload> GoAway<Payload> {
        fn decode(header: FrameHeader, buffer: Buffer) -> Result<Self> {
            let _ = header;
            let (last_stream_id, buffer) = buffer.decode()?;
            let (error_code, buffer) = buffer.decode()?;

            let (debug_data, buffer) = {
                let len = buffer.len();
                let (debug_data, buffer) = buffer.decode_slice(len)?;
                let (debug_data, remaining) = debug_data.decode()?;
                remaining.ensure_empty()?;
                (debug_data, buffer)
            };

            let frame = GoAway {
                last_stream_id,
                error_code,
                debug_data,
            };

            Ok((frame, buffer))
        }
    }
);

impl<Payload: EncoderValue> EncoderValue for GoAway<Payload> {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        let payload_len = 2 * core::mem::size_of::<u32>() + self.debug_data.encoding_size();

        let header = FrameHeader::new(payload_len, self.tag(), Flags::NONE, self.stream_id());
        buffer.encode(&header);
        buffer.encode(&self.last_stream_id);
        buffer.encode(&self.error_code);
        buffer.encode(&self.debug_data);
    }
}
