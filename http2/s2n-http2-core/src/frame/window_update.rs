// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    frame::{Flags, FrameHeader, Tag},
    stream::StreamId,
};
use s2n_codec::{decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc7540#section-6.9
//# The WINDOW_UPDATE frame (type=0x8) is used to implement flow control;
//# see Section 5.2 for an overview.

macro_rules! window_update_tag {
    () => {
        0x8u8
    };
}

//= https://www.rfc-editor.org/rfc/rfc7540#section-6.9
//# +-+-------------------------------------------------------------+
//# |R|              Window Size Increment (31)                     |
//# +-+-------------------------------------------------------------+

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowUpdate {
    /// The window being credited
    ///
    /// [`StreamId::CONNECTION`] credits the session window.
    pub stream_id: StreamId,

    /// The number of octets to add to the window
    ///
    /// A zero increment is a protocol violation, scoped to the carrying
    /// stream; that judgement belongs to the session, not the codec.
    pub increment: u32,
}

impl WindowUpdate {
    #[inline]
    pub fn tag(&self) -> Tag {
        window_update_tag!()
    }

    #[inline]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }
}

decoder_parameterized_value!(
    impl<'a> WindowUpdate {
        fn decode(header: FrameHeader, buffer: Buffer) -> Result<Self> {
            let (raw, buffer) = buffer.decode::<u32>()?;

            let frame = WindowUpdate {
                stream_id: header.stream_id,
                // the high bit is reserved, like the stream identifier's
                increment: raw & 0x7fff_ffff,
            };

            Ok((frame, buffer))
        }
    }
);

impl EncoderValue for WindowUpdate {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        let header = FrameHeader::new(
            core::mem::size_of::<u32>(),
            self.tag(),
            Flags::NONE,
            self.stream_id,
        );
        buffer.encode(&header);
        buffer.encode(&(self.increment & 0x7fff_ffff));
    }
}
