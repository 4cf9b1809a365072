// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    error::ErrorCode,
    frame::{Flags, FrameHeader, Tag},
    stream::StreamId,
};
use s2n_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc7540#section-6.4
//# The RST_STREAM frame (type=0x3) allows for immediate termination of a
//# stream.  RST_STREAM is sent to request cancellation of a stream or to
//# indicate that an error condition has occurred.

macro_rules! rst_stream_tag {
    () => {
        0x3u8
    };
}

//= https://www.rfc-editor.org/rfc/rfc7540#section-6.4
//# +---------------------------------------------------------------+
//# |                        Error Code (32)                        |
//# +---------------------------------------------------------------+

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RstStream {
    /// The stream being terminated
    pub stream_id: StreamId,

    /// Why the stream is being terminated
    pub error_code: ErrorCode,
}

impl RstStream {
    #[inline]
    pub fn tag(&self) -> Tag {
        rst_stream_tag!()
    }

    #[inline]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }
}

decoder_parameterized_value!(
    impl<'a> RstStream {
        fn decode(header: FrameHeader, buffer: Buffer) -> Result<Self> {
            let (error_code, buffer) = buffer.decode()?;

            let frame = RstStream {
                stream_id: header.stream_id,
                error_code,
            };

            Ok((frame, buffer))
        }
    }
);

impl EncoderValue for RstStream {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        let header = FrameHeader::new(
            core::mem::size_of::<u32>(),
            self.tag(),
            Flags::NONE,
            self.stream_id,
        );
        buffer.encode(&header);
        buffer.encode(&self.error_code);
    }
}
