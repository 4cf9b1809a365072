// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::endpoint;
use s2n_codec::{decoder_value, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc7540#section-5.1.1
//# Streams are identified with an unsigned 31-bit integer.  Streams
//# initiated by a client MUST use odd-numbered stream identifiers; those
//# initiated by the server MUST use even-numbered stream identifiers.

/// The ID of a stream
///
/// A stream ID is a 31-bit integer that is unique for all streams on a
/// connection. Identifier `0` addresses the connection itself.
#[derive(PartialEq, Eq, PartialOrd, Ord, Debug, Copy, Clone, Hash, Default)]
pub struct StreamId(u32);

/// The highest representable stream identifier
pub const MAX_STREAM_ID: u32 = (1 << 31) - 1;

impl StreamId {
    /// The identifier addressing the connection as a whole
    pub const CONNECTION: StreamId = StreamId(0);

    /// Creates a stream ID, masking the reserved high bit
    #[inline]
    pub const fn new_truncated(id: u32) -> Self {
        Self(id & MAX_STREAM_ID)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the initial stream ID issued by the given endpoint
    ///
    /// Example:
    ///
    /// ```
    /// # use s2n_http2_core::{endpoint, stream::StreamId};
    /// assert_eq!(StreamId::initial(endpoint::Type::Client).as_u32(), 1);
    /// assert_eq!(StreamId::initial(endpoint::Type::Server).as_u32(), 2);
    /// ```
    #[inline]
    pub fn initial(initiator: endpoint::Type) -> StreamId {
        match initiator {
            endpoint::Type::Client => StreamId(1),
            endpoint::Type::Server => StreamId(2),
        }
    }

    /// Returns the next stream ID of the same parity
    ///
    /// Returns `None` once the 31-bit identifier space is exhausted.
    #[inline]
    pub fn next_of_parity(self) -> Option<StreamId> {
        // ids of one initiator are spaced apart by 2
        let id = self.0.checked_add(2)?;
        if id > MAX_STREAM_ID {
            return None;
        }
        Some(StreamId(id))
    }

    /// Returns whether the client or the server initiated the stream
    ///
    /// The identifier must not be [`StreamId::CONNECTION`], which addresses
    /// no stream.
    #[inline]
    pub fn initiator(self) -> endpoint::Type {
        debug_assert!(!self.is_connection(), "stream 0 has no initiator");
        if self.0 & 0x1 == 0x1 {
            endpoint::Type::Client
        } else {
            endpoint::Type::Server
        }
    }

    /// Returns true if the identifier addresses the connection rather than a
    /// stream
    #[inline]
    pub const fn is_connection(self) -> bool {
        self.0 == 0
    }
}

impl From<StreamId> for u32 {
    #[inline]
    fn from(id: StreamId) -> Self {
        id.0
    }
}

decoder_value!(
    impl<'a> StreamId {
        fn decode(buffer: Buffer) -> Result<Self> {
            //= https://www.rfc-editor.org/rfc/rfc7540#section-4.1
            //# A reserved 1-bit field.  The semantics of this bit are undefined,
            //# and the bit MUST remain unset (0x0) when sending and MUST be
            //# ignored when receiving.
            let (id, buffer) = buffer.decode::<u32>()?;
            Ok((Self::new_truncated(id), buffer))
        }
    }
);

impl EncoderValue for StreamId {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.0);
    }
}

#[cfg(any(test, feature = "generator"))]
impl bolero_generator::TypeGenerator for StreamId {
    fn generate<D: bolero_generator::Driver>(driver: &mut D) -> Option<Self> {
        let id = <u32 as bolero_generator::TypeGenerator>::generate(driver)?;
        Some(Self::new_truncated(id))
    }
}
