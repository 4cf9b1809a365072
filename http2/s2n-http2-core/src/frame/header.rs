// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::stream::StreamId;
use core::{fmt, ops};
use s2n_codec::{decoder_value, u24, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc7540#section-4.1
//# All frames begin with a fixed 9-octet header followed by a variable-
//# length payload.
//#
//# +-----------------------------------------------+
//# |                 Length (24)                   |
//# +---------------+---------------+---------------+
//# |   Type (8)    |   Flags (8)   |
//# +-+-------------+---------------+-------------------------------+
//# |R|                 Stream Identifier (31)                      |
//# +=+=============================================================+
//# |                   Frame Payload (0...)                      ...
//# +---------------------------------------------------------------+

pub type Tag = u8;

/// The encoded length of a frame header
pub const FRAME_HEADER_LEN: usize = 9;

/// The 8-bit flags field of a frame header
///
/// Flag positions are reused between frame types, so the constants below
/// only have meaning in the context of the type that defines them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const END_STREAM: Flags = Flags(0x01);
    pub const ACK: Flags = Flags(0x01);
    pub const END_HEADERS: Flags = Flags(0x04);
    pub const PADDED: Flags = Flags(0x08);
    pub const PRIORITY: Flags = Flags(0x20);

    #[inline]
    pub const fn new(flags: u8) -> Self {
        Self(flags)
    }

    #[inline]
    pub const fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Sets `other` when `enabled` is true
    #[inline]
    pub const fn with(self, other: Flags, enabled: bool) -> Self {
        if enabled {
            Self(self.0 | other.0)
        } else {
            self
        }
    }
}

impl ops::BitOr for Flags {
    type Output = Flags;

    #[inline]
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl From<Flags> for u8 {
    #[inline]
    fn from(flags: Flags) -> u8 {
        flags.0
    }
}

impl fmt::Display for Flags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// The fixed 9-octet header preceding every frame payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u24,
    pub frame_type: Tag,
    pub flags: Flags,
    pub stream_id: StreamId,
}

impl FrameHeader {
    #[inline]
    pub fn new(length: usize, frame_type: Tag, flags: Flags, stream_id: StreamId) -> Self {
        debug_assert!(length < (1 << 24), "frame payload exceeds the u24 length");
        Self {
            length: u24::new_truncated(length as u32),
            frame_type,
            flags,
            stream_id,
        }
    }

    /// The payload length declared by the header
    #[inline]
    pub fn payload_len(&self) -> usize {
        u32::from(self.length) as usize
    }
}

decoder_value!(
    impl<'a> FrameHeader {
        fn decode(buffer: Buffer) -> Result<Self> {
            let (length, buffer) = buffer.decode::<u24>()?;
            let (frame_type, buffer) = buffer.decode::<u8>()?;
            let (flags, buffer) = buffer.decode::<u8>()?;
            let (stream_id, buffer) = buffer.decode::<StreamId>()?;

            let header = FrameHeader {
                length,
                frame_type,
                flags: Flags::new(flags),
                stream_id,
            };

            Ok((header, buffer))
        }
    }
);

impl EncoderValue for FrameHeader {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.length);
        buffer.encode(&self.frame_type);
        buffer.encode(&u8::from(self.flags));
        buffer.encode(&self.stream_id);
    }
}
