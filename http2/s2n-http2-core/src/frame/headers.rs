// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    frame::{
        priority::{Dependency, DEPENDENCY_LEN},
        Flags, FrameHeader, Tag,
    },
    stream::StreamId,
};
use s2n_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc7540#section-6.2
//# The HEADERS frame (type=0x1) is used to open a stream (Section 5.1),
//# and additionally carries a header block fragment.

macro_rules! headers_tag {
    () => {
        0x1u8
    };
}

//= https://www.rfc-editor.org/rfc/rfc7540#section-6.2
//# +---------------+
//# |Pad Length? (8)|
//# +-+-------------+-----------------------------------------------+
//# |E|                 Stream Dependency? (31)                     |
//# +-+-------------+-----------------------------------------------+
//# |  Weight? (8)  |
//# +-+-------------+-----------------------------------------------+
//# |                   Header Block Fragment (*)                 ...
//# +---------------------------------------------------------------+
//# |                           Padding (*)                       ...
//# +---------------------------------------------------------------+

/// A HEADERS frame
///
/// The header block fragment is opaque at this layer; HPACK coding is the
/// responsibility of the codec above the session engine.
#[derive(Debug, PartialEq, Eq)]
pub struct Headers<Payload> {
    /// The stream the headers open or continue
    pub stream_id: StreamId,

    /// If true, the frame closes the sender's half of the stream
    pub end_stream: bool,

    /// If true, no CONTINUATION frames follow
    pub end_headers: bool,

    /// The optional priority description carried with the headers
    pub dependency: Option<Dependency>,

    /// The HPACK-encoded header block fragment
    pub fragment: Payload,
}

impl<Payload> Headers<Payload> {
    #[inline]
    pub fn tag(&self) -> Tag {
        headers_tag!()
    }

    #[inline]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    #[inline]
    pub fn flags(&self) -> Flags {
        Flags::NONE
            .with(Flags::END_STREAM, self.end_stream)
            .with(Flags::END_HEADERS, self.end_headers)
            .with(Flags::PRIORITY, self.dependency.is_some())
    }

    /// Converts the fragment from one payload type to another
    #[inline]
    pub fn map_payload<F: FnOnce(Payload) -> Out, Out>(self, map: F) -> Headers<Out> {
        Headers {
            stream_id: self.stream_id,
            end_stream: self.end_stream,
            end_headers: self.end_headers,
            dependency: self.dependency,
            fragment: map(self.fragment),
        }
    }
}

decoder_parameterized_value!(
    impl<'a, Payload> Headers<Payload> {
        fn decode(header: FrameHeader, buffer: Buffer) -> Result<Self> {
            let (_padding, buffer) = strip_padding!(header.flags, buffer);

            let (dependency, buffer) = if header.flags.contains(Flags::PRIORITY) {
                let (dependency, buffer) = buffer.decode()?;
                (Some(dependency), buffer)
            } else {
                (None, buffer)
            };

            let (fragment, buffer) = {
                let len = buffer.len();
                let (fragment, buffer) = buffer.decode_slice(len)?;
                let (fragment, remaining) = fragment.decode()?;
                remaining.ensure_empty()?;
                (fragment, buffer)
            };

            let frame = Headers {
                stream_id: header.stream_id,
                end_stream: header.flags.contains(Flags::END_STREAM),
                end_headers: header.flags.contains(Flags::END_HEADERS),
                dependency,
                fragment,
            };

            Ok((frame, buffer))
        }
    }
);

impl<Payload: EncoderValue> EncoderValue for Headers<Payload> {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        let mut payload_len = self.fragment.encoding_size();
        if self.dependency.is_some() {
            payload_len += DEPENDENCY_LEN;
        }

        let header = FrameHeader::new(payload_len, self.tag(), self.flags(), self.stream_id);
        buffer.encode(&header);

        if let Some(dependency) = &self.dependency {
            buffer.encode(dependency);
        }
        buffer.encode(&self.fragment);
    }
}
