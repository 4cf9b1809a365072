// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    frame::{Flags, FrameHeader, Tag},
    stream::StreamId,
};
use s2n_codec::{decoder_parameterized_value, decoder_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc7540#section-6.3
//# The PRIORITY frame (type=0x2) specifies the sender-advised priority
//# of a stream (Section 5.3).  It can be sent in any stream state,
//# including idle or closed streams.

macro_rules! priority_tag {
    () => {
        0x2u8
    };
}

//= https://www.rfc-editor.org/rfc/rfc7540#section-6.3
//# +-+-------------------------------------------------------------+
//# |E|                  Stream Dependency (31)                     |
//# +-+-------------+-----------------------------------------------+
//# |   Weight (8)  |
//# +-+-------------+

/// The dependency description shared by PRIORITY frames and prioritized
/// HEADERS frames
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dependency {
    /// If true, the dependency is exclusive
    pub exclusive: bool,

    /// The stream this stream depends on
    pub dependency: StreamId,

    /// The priority weight, offset by one (0 encodes a weight of 1)
    pub weight: u8,
}

const EXCLUSIVE_BIT: u32 = 1 << 31;

decoder_value!(
    impl<'a> Dependency {
        fn decode(buffer: Buffer) -> Result<Self> {
            let (raw, buffer) = buffer.decode::<u32>()?;
            let (weight, buffer) = buffer.decode::<u8>()?;

            let dependency = Dependency {
                exclusive: raw & EXCLUSIVE_BIT == EXCLUSIVE_BIT,
                dependency: StreamId::new_truncated(raw),
                weight,
            };

            Ok((dependency, buffer))
        }
    }
);

impl EncoderValue for Dependency {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        let mut raw = self.dependency.as_u32();
        if self.exclusive {
            raw |= EXCLUSIVE_BIT;
        }
        buffer.encode(&raw);
        buffer.encode(&self.weight);
    }
}

/// The encoded length of a dependency description
pub(crate) const DEPENDENCY_LEN: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Priority {
    /// The stream being (re)prioritized
    pub stream_id: StreamId,

    pub dependency: Dependency,
}

impl Priority {
    #[inline]
    pub fn tag(&self) -> Tag {
        priority_tag!()
    }

    #[inline]
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }
}

decoder_parameterized_value!(
    impl<'a> Priority {
        fn decode(header: FrameHeader, buffer: Buffer) -> Result<Self> {
            let (dependency, buffer) = buffer.decode()?;

            let frame = Priority {
                stream_id: header.stream_id,
                dependency,
            };

            Ok((frame, buffer))
        }
    }
);

impl EncoderValue for Priority {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        let header = FrameHeader::new(DEPENDENCY_LEN, self.tag(), Flags::NONE, self.stream_id);
        buffer.encode(&header);
        buffer.encode(&self.dependency);
    }
}
