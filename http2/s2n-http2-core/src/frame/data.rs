// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    frame::{Flags, FrameHeader, Tag},
    stream::StreamId,
};
use s2n_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc7540#section-6.1
//# DATA frames (type=0x0) convey arbitrary, variable-length sequences of
//# octets associated with a stream.

macro_rules! data_tag {
    () => {
        0x0u8
    };
}

//= https://www.rfc-editor.org/rfc/rfc7540#section-6.1
//# +---------------+
//# |Pad Length? (8)|
//# +---------------+-----------------------------------------------+
//# |                            Data (*)                         ...
//# +---------------------------------------------------------------+
//# |                           Padding (*)                       ...
//# +---------------------------------------------------------------+

#[derive(Debug, PartialEq, Eq)]
pub struct Data<Payload> {
    /// The stream carrying the data
    pub stream_id: StreamId,

    /// If true, the frame closes the sender's half of the stream
    pub end_stream: bool,

    /// The declared padding, stripped from `data` on decode
    ///
    /// Padding still counts against flow-control windows, which is why the
    /// declaration is retained.
    pub padding: Option<u8>,

    /// The application octets
    pub data: Payload,
}

impl<Payload> Data<Payload> {
    #[inline]
    pub fn tag(&self) -> Tag {
        data_tag!()
    }

    #[inline]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    #[inline]
    pub fn flags(&self) -> Flags {
        Flags::NONE
            .with(Flags::END_STREAM, self.end_stream)
            .with(Flags::PADDED, self.padding.is_some())
    }

    /// Converts the data payload from one type to another
    #[inline]
    pub fn map_payload<F: FnOnce(Payload) -> Out, Out>(self, map: F) -> Data<Out> {
        Data {
            stream_id: self.stream_id,
            end_stream: self.end_stream,
            padding: self.padding,
            data: map(self.data),
        }
    }
}

impl<Payload: EncoderValue> Data<Payload> {
    //= https://www.rfc-editor.org/rfc/rfc7540#section-6.9.1
    //# The entire DATA frame payload is included in flow control,
    //# including the Pad Length and Padding fields if present.

    /// The number of octets this frame debits from flow-control windows
    #[inline]
    pub fn flow_controlled_size(&self) -> usize {
        let padding = self.padding.map_or(0, |pad| 1 + usize::from(pad));
        self.data.encoding_size() + padding
    }

    #[inline]
    fn payload_len(&self) -> usize {
        self.flow_controlled_size()
    }
}

decoder_parameterized_value!(
    impl<'a, Payload> Data<Payload> {
        fn decode(header: FrameHeader, buffer: Buffer) -> Result<Self> {
            let (padding, buffer) = strip_padding!(header.flags, buffer);

            let (data, buffer) = {
                let len = buffer.len();
                let (data, buffer) = buffer.decode_slice(len)?;
                let (data, remaining) = data.decode()?;
                remaining.ensure_empty()?;
                (data, buffer)
            };

            let frame = Data {
                stream_id: header.stream_id,
                end_stream: header.flags.contains(Flags::END_STREAM),
                padding,
                data,
            };

            Ok((frame, buffer))
        }
    }
);

impl<Payload: EncoderValue> EncoderValue for Data<Payload> {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        let header = FrameHeader::new(
            self.payload_len(),
            self.tag(),
            self.flags(),
            self.stream_id,
        );
        buffer.encode(&header);

        if let Some(pad_len) = self.padding {
            buffer.encode(&pad_len);
            buffer.encode(&self.data);
            buffer.write_repeated(usize::from(pad_len), 0);
        } else {
            buffer.encode(&self.data);
        }
    }
}
