// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    frame::{Flags, FrameHeader, Tag},
    stream::StreamId,
};
use s2n_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc7540#section-6.6
//# The PUSH_PROMISE frame (type=0x5) is used to notify the peer endpoint
//# in advance of streams the sender intends to initiate.

macro_rules! push_promise_tag {
    () => {
        0x5u8
    };
}

//= https://www.rfc-editor.org/rfc/rfc7540#section-6.6
//# +---------------+
//# |Pad Length? (8)|
//# +-+-------------+-----------------------------------------------+
//# |R|                  Promised Stream ID (31)                    |
//# +-+-----------------------------+-------------------------------+
//# |                   Header Block Fragment (*)                 ...
//# +---------------------------------------------------------------+
//# |                           Padding (*)                       ...
//# +---------------------------------------------------------------+

#[derive(Debug, PartialEq, Eq)]
pub struct PushPromise<Payload> {
    /// The stream the promise is associated with
    pub stream_id: StreamId,

    /// The stream reserved by the promise
    pub promised_stream_id: StreamId,

    /// If true, no CONTINUATION frames follow
    pub end_headers: bool,

    /// The HPACK-encoded request headers of the promised stream
    pub fragment: Payload,
}

impl<Payload> PushPromise<Payload> {
    #[inline]
    pub fn tag(&self) -> Tag {
        push_promise_tag!()
    }

    #[inline]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    #[inline]
    pub fn flags(&self) -> Flags {
        Flags::NONE.with(Flags::END_HEADERS, self.end_headers)
    }

    /// Converts the fragment from one payload type to another
    #[inline]
    pub fn map_payload<F: FnOnce(Payload) -> Out, Out>(self, map: F) -> PushPromise<Out> {
        PushPromise {
            stream_id: self.stream_id,
            promised_stream_id: self.promised_stream_id,
            end_headers: self.end_headers,
            fragment: map(self.fragment),
        }
    }
}

decoder_parameterized_value!(
    impl<'a, Payload> PushPromise<Payload> {
        fn decode(header: FrameHeader, buffer: Buffer) -> Result<Self> {
            let (_padding, buffer) = strip_padding!(header.flags, buffer);

            let (promised_stream_id, buffer) = buffer.decode()?;

            let (fragment, buffer) = {
                let len = buffer.len();
                let (fragment, buffer) = buffer.decode_slice(len)?;
                let (fragment, remaining) = fragment.decode()?;
                remaining.ensure_empty()?;
                (fragment, buffer)
            };

            let frame = PushPromise {
                stream_id: header.stream_id,
                promised_stream_id,
                end_headers: header.flags.contains(Flags::END_HEADERS),
                fragment,
            };

            Ok((frame, buffer))
        }
    }
);

impl<Payload: EncoderValue> EncoderValue for PushPromise<Payload> {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        let payload_len = core::mem::size_of::<u32>() + self.fragment.encoding_size();

        let header = FrameHeader::new(payload_len, self.tag(), self.flags(), self.stream_id);
        buffer.encode(&header);
        buffer.encode(&self.promised_stream_id);
        buffer.encode(&self.fragment);
    }
}
