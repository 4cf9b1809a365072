// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::{
    error::{Error, ErrorCode},
    frame::{Flags, FrameHeader, Tag},
    stream::StreamId,
};
use alloc::vec::Vec;
use core::fmt;
use s2n_codec::{
    decoder_invariant, decoder_parameterized_value, decoder_value, Encoder, EncoderValue,
};

//= https://www.rfc-editor.org/rfc/rfc7540#section-6.5
//# The SETTINGS frame (type=0x4) conveys configuration parameters that
//# affect how endpoints communicate, such as preferences and constraints
//# on peer behavior.

macro_rules! settings_tag {
    () => {
        0x4u8
    };
}

//= https://www.rfc-editor.org/rfc/rfc7540#section-6.5.1
//# +-------------------------------+
//# |       Identifier (16)         |
//# +-------------------------------+-------------------------------+
//# |                        Value (32)                             |
//# +---------------------------------------------------------------+

/// A setting identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(u16);

impl Id {
    pub const HEADER_TABLE_SIZE: Id = Id(0x1);
    pub const ENABLE_PUSH: Id = Id(0x2);
    pub const MAX_CONCURRENT_STREAMS: Id = Id(0x3);
    pub const INITIAL_WINDOW_SIZE: Id = Id(0x4);
    pub const MAX_FRAME_SIZE: Id = Id(0x5);
    pub const MAX_HEADER_LIST_SIZE: Id = Id(0x6);

    #[inline]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            Self::HEADER_TABLE_SIZE => "HEADER_TABLE_SIZE",
            Self::ENABLE_PUSH => "ENABLE_PUSH",
            Self::MAX_CONCURRENT_STREAMS => "MAX_CONCURRENT_STREAMS",
            Self::INITIAL_WINDOW_SIZE => "INITIAL_WINDOW_SIZE",
            Self::MAX_FRAME_SIZE => "MAX_FRAME_SIZE",
            Self::MAX_HEADER_LIST_SIZE => "MAX_HEADER_LIST_SIZE",
            _ => return write!(f, "Setting({})", self.0),
        };
        f.write_str(name)
    }
}

//= https://www.rfc-editor.org/rfc/rfc7540#section-6.5.2
//# The initial value of SETTINGS_MAX_FRAME_SIZE is 2^14 (16,384)
//# octets.  The value advertised by an endpoint MUST be between this
//# initial value and the maximum allowed frame size (2^24-1 or
//# 16,777,215 octets), inclusive.

/// The frame size every connection starts out with
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 1 << 14;

/// The largest frame size an endpoint may advertise
pub const MAX_ALLOWED_FRAME_SIZE: u32 = (1 << 24) - 1;

/// A single (identifier, value) pair from a SETTINGS frame
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Setting {
    pub id: Id,
    pub value: u32,
}

impl Setting {
    #[inline]
    pub const fn new(id: Id, value: u32) -> Self {
        Self { id, value }
    }

    /// Checks the value constraints RFC 7540 places on recognized settings
    ///
    /// Unknown identifiers validate successfully; they must be ignored, not
    /// rejected.
    pub fn validate(&self) -> Result<(), Error> {
        match self.id {
            //= https://www.rfc-editor.org/rfc/rfc7540#section-6.5.2
            //# Any value other than 0 or 1 MUST be treated as a
            //# connection error (Section 5.4.1) of type PROTOCOL_ERROR.
            Id::ENABLE_PUSH if self.value > 1 => Err(Error::connection(
                ErrorCode::PROTOCOL_ERROR,
                "invalid_settings_enable_push",
            )),

            //= https://www.rfc-editor.org/rfc/rfc7540#section-6.5.2
            //# Values above the maximum flow-control window size of 2^31-1
            //# MUST be treated as a connection error (Section 5.4.1) of
            //# type FLOW_CONTROL_ERROR.
            Id::INITIAL_WINDOW_SIZE if self.value > i32::MAX as u32 => Err(Error::connection(
                ErrorCode::FLOW_CONTROL_ERROR,
                "invalid_settings_initial_window_size",
            )),

            Id::MAX_FRAME_SIZE
                if !(DEFAULT_MAX_FRAME_SIZE..=MAX_ALLOWED_FRAME_SIZE).contains(&self.value) =>
            {
                Err(Error::connection(
                    ErrorCode::PROTOCOL_ERROR,
                    "invalid_settings_max_frame_size",
                ))
            }

            _ => Ok(()),
        }
    }
}

const SETTING_LEN: usize = 6;

decoder_value!(
    impl<'a> Setting {
        fn decode(buffer: Buffer) -> Result<Self> {
            let (id, buffer) = buffer.decode::<u16>()?;
            let (value, buffer) = buffer.decode::<u32>()?;

            Ok((Setting::new(Id::new(id), value), buffer))
        }
    }
);

impl EncoderValue for Setting {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.id.as_u16());
        buffer.encode(&self.value);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Settings {
    /// If true, the frame acknowledges the peer's settings and carries no
    /// body
    pub ack: bool,

    pub settings: Vec<Setting>,
}

impl Settings {
    /// The empty acknowledgement emitted in response to the peer's SETTINGS
    #[inline]
    pub fn ack() -> Self {
        Self {
            ack: true,
            settings: Vec::new(),
        }
    }

    #[inline]
    pub fn tag(&self) -> Tag {
        settings_tag!()
    }

    /// SETTINGS frames always apply to the connection
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
    impl<'a> Settings {
        fn decode(header: FrameHeader, buffer: Buffer) -> Result<Self> {
            //= https://www.rfc-editor.org/rfc/rfc7540#section-6.5
            //# If an endpoint receives a SETTINGS frame whose stream
            //# identifier field is anything other than 0x0, the endpoint MUST
            //# respond with a connection error (Section 5.4.1) of type
            //# PROTOCOL_ERROR.
            decoder_invariant!(
                header.stream_id.is_connection(),
                "settings on a non-zero stream"
            );

            let ack = header.flags.contains(Flags::ACK);

            //= https://www.rfc-editor.org/rfc/rfc7540#section-6.5
            //# Receipt of a SETTINGS frame with the ACK flag set and a length
            //# field value other than 0 MUST be treated as a connection error
            //# (Section 5.4.1) of type FRAME_SIZE_ERROR.
            decoder_invariant!(!ack || buffer.is_empty(), "settings ack with a body");

            decoder_invariant!(
                buffer.len() % SETTING_LEN == 0,
                "settings payload is not a multiple of six octets"
            );

            let mut settings = Vec::with_capacity(buffer.len() / SETTING_LEN);
            let mut buffer = buffer;
            while !buffer.is_empty() {
                let (setting, remaining) = buffer.decode()?;
                settings.push(setting);
                buffer = remaining;
            }

            Ok((Settings { ack, settings }, buffer))
        }
    }
);

impl EncoderValue for Settings {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        let header = FrameHeader::new(
            self.settings.len() * SETTING_LEN,
            self.tag(),
            self.flags(),
            self.stream_id(),
        );
        buffer.encode(&header);

        for setting in &self.settings {
            buffer.encode(setting);
        }
    }
}
