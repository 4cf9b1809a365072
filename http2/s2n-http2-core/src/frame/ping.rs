// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    frame::{Flags, FrameHeader, Tag},
    stream::StreamId,
};
use s2n_codec::{decoder_invariant, decoder_parameterized_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc7540#section-6.7
//# The PING frame (type=0x6) is a mechanism for measuring a minimal
//# round-trip time from the sender, as well as determining whether an
//# idle connection is still functional.

macro_rules! ping_tag {
    () => {
        0x6u8
    };
}

/// The fixed payload size of a PING frame
pub const PAYLOAD_LEN: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ping {
    /// If true, the frame is a response to a peer PING
    pub ack: bool,

    /// Opaque octets, echoed verbatim in the reply
    pub payload: [u8; PAYLOAD_LEN],
}

impl Ping {
    #[inline]
    pub const fn new(payload: [u8; PAYLOAD_LEN]) -> Self {
        Self {
            ack: false,
            payload,
        }
    }

    /// The acknowledgement echoing a received PING
    #[inline]
    pub const fn reply(payload: [u8; PAYLOAD_LEN]) -> Self {
        Self { ack: true, payload }
    }

    #[inline]
    pub fn tag(&self) -> Tag {
        ping_tag!()
    }

    /// PING frames always apply to the connection
    #[inline]
    pub fn stream_id(&self) -> StreamId {
        StreamId::CONNECTION
    }

    #[inline]
    pub fn flags(&self) -> Flags {
        Flags::NONE.with(Flags::ACK, self.ack)
    }
}

decoder_parameterized_value!(
    impl<'a> Ping {
        fn decode(header: FrameHeader, buffer: Buffer) -> Result<Self> {
            //= https://www.rfc-editor.org/rfc/rfc7540#section-6.7
            //# Receipt of a PING frame with a length field value other than 8
            //# MUST be treated as a connection error (Section 5.4.1) of type
            //# FRAME_SIZE_ERROR.
            decoder_invariant!(
                header.payload_len() == PAYLOAD_LEN,
                "ping payload must be exactly eight octets"
            );

            let (slice, buffer) = buffer.decode_slice(PAYLOAD_LEN)?;
            let mut payload = [0u8; PAYLOAD_LEN];
            payload.copy_from_slice(slice.into_less_safe_slice());

            let frame = Ping {
                ack: header.flags.contains(Flags::ACK),
                payload,
            };

            Ok((frame, buffer))
        }
    }
);

impl EncoderValue for Ping {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        let header = FrameHeader::new(PAYLOAD_LEN, self.tag(), self.flags(), self.stream_id());
        buffer.encode(&header);
        buffer.write_slice(&self.payload);
    }
}
