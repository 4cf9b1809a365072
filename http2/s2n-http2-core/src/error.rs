// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;
use s2n_codec::{decoder_value, DecoderError, Encoder, EncoderValue};

//= https://www.rfc-editor.org/rfc/rfc7540#section-7
//# Error codes are 32-bit fields that are used in RST_STREAM and GOAWAY
//# frames to convey the reasons for the stream or connection error.

/// An HTTP/2 error code as carried on the wire
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(any(feature = "generator", test), derive(bolero_generator::TypeGenerator))]
pub struct ErrorCode(u32);

impl ErrorCode {
    #[inline]
    pub const fn new(code: u32) -> Self {
        Self(code)
    }

    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl From<u32> for ErrorCode {
    #[inline]
    fn from(code: u32) -> Self {
        Self(code)
    }
}

impl From<ErrorCode> for u32 {
    #[inline]
    fn from(code: ErrorCode) -> Self {
        code.0
    }
}

decoder_value!(
    impl<'a> ErrorCode {
        fn decode(buffer: Buffer) -> Result<Self> {
            let (code, buffer) = buffer.decode::<u32>()?;
            Ok((Self(code), buffer))
        }
    }
);

impl EncoderValue for ErrorCode {
    #[inline]
    fn encode<E: Encoder>(&self, buffer: &mut E) {
        buffer.encode(&self.0);
    }
}

/// Internal convenience macro for defining the standard error codes
macro_rules! def_error {
    ($doc:expr, $name:ident, $code:expr) => {
        impl ErrorCode {
            #[doc = $doc]
            pub const $name: ErrorCode = ErrorCode::new($code);
        }
    };
}

//# The following error codes are defined:

def_error!(
    "The associated condition is not a result of an error.",
    NO_ERROR,
    0x0
);
def_error!(
    "The endpoint detected an unspecific protocol error.",
    PROTOCOL_ERROR,
    0x1
);
def_error!(
    "The endpoint encountered an unexpected internal error.",
    INTERNAL_ERROR,
    0x2
);
def_error!(
    "The endpoint detected that its peer violated the flow-control protocol.",
    FLOW_CONTROL_ERROR,
    0x3
);
def_error!(
    "The endpoint sent a SETTINGS frame but did not receive a response in a timely manner.",
    SETTINGS_TIMEOUT,
    0x4
);
def_error!(
    "The endpoint received a frame after a stream was half-closed.",
    STREAM_CLOSED,
    0x5
);
def_error!(
    "The endpoint received a frame with an invalid size.",
    FRAME_SIZE_ERROR,
    0x6
);
def_error!(
    "The endpoint refused the stream prior to performing any application processing.",
    REFUSED_STREAM,
    0x7
);
def_error!(
    "Used by the endpoint to indicate that the stream is no longer needed.",
    CANCEL,
    0x8
);
def_error!(
    "The endpoint is unable to maintain the header compression context for the connection.",
    COMPRESSION_ERROR,
    0x9
);
def_error!(
    "The connection established in response to a CONNECT request was reset or abnormally closed.",
    CONNECT_ERROR,
    0xA
);
def_error!(
    "The endpoint detected that its peer is exhibiting a behavior that might be generating excessive load.",
    ENHANCE_YOUR_CALM,
    0xB
);
def_error!(
    "The underlying transport has properties that do not meet minimum security requirements.",
    INADEQUATE_SECURITY,
    0xC
);
def_error!(
    "The endpoint requires that HTTP/1.1 be used instead of HTTP/2.",
    HTTP_1_1_REQUIRED,
    0xD
);

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            Self::NO_ERROR => "NO_ERROR",
            Self::PROTOCOL_ERROR => "PROTOCOL_ERROR",
            Self::INTERNAL_ERROR => "INTERNAL_ERROR",
            Self::FLOW_CONTROL_ERROR => "FLOW_CONTROL_ERROR",
            Self::SETTINGS_TIMEOUT => "SETTINGS_TIMEOUT",
            Self::STREAM_CLOSED => "STREAM_CLOSED",
            Self::FRAME_SIZE_ERROR => "FRAME_SIZE_ERROR",
            Self::REFUSED_STREAM => "REFUSED_STREAM",
            Self::CANCEL => "CANCEL",
            Self::COMPRESSION_ERROR => "COMPRESSION_ERROR",
            Self::CONNECT_ERROR => "CONNECT_ERROR",
            Self::ENHANCE_YOUR_CALM => "ENHANCE_YOUR_CALM",
            Self::INADEQUATE_SECURITY => "INADEQUATE_SECURITY",
            Self::HTTP_1_1_REQUIRED => "HTTP_1_1_REQUIRED",
            _ => return write!(f, "ErrorCode({})", self.0),
        };
        f.write_str(name)
    }
}

//= https://www.rfc-editor.org/rfc/rfc7540#section-5.4
//# Error handling in HTTP/2 distinguishes errors that affect the entire
//# connection from those that affect an individual stream.

/// Whether a protocol violation is fatal to the connection or scoped to a
/// single stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    Connection,
    Stream,
}

/// A protocol failure with an error code, a static reason, and a scope
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Error {
    pub scope: Scope,
    pub code: ErrorCode,
    pub reason: &'static str,
}

impl Error {
    /// Creates a connection-scoped `Error`
    #[inline]
    pub const fn connection(code: ErrorCode, reason: &'static str) -> Self {
        Self {
            scope: Scope::Connection,
            code,
            reason,
        }
    }

    /// Creates a stream-scoped `Error`
    #[inline]
    pub const fn stream(code: ErrorCode, reason: &'static str) -> Self {
        Self {
            scope: Scope::Stream,
            code,
            reason,
        }
    }

    /// Updates the `Error` with the specified `reason`
    #[inline]
    pub const fn with_reason(mut self, reason: &'static str) -> Self {
        self.reason = reason;
        self
    }

    #[inline]
    pub const fn is_connection_error(&self) -> bool {
        matches!(self.scope, Scope::Connection)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.reason)
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Creates a connection-scoped [`Error`] with variable arguments
#[macro_export]
macro_rules! connection_error {
    ($code:ident) => {
        $crate::error::Error::connection($crate::error::ErrorCode::$code, "")
    };
    ($code:ident, $reason:expr) => {
        $crate::error::Error::connection($crate::error::ErrorCode::$code, $reason)
    };
}

/// Creates a stream-scoped [`Error`] with variable arguments
#[macro_export]
macro_rules! stream_error {
    ($code:ident) => {
        $crate::error::Error::stream($crate::error::ErrorCode::$code, "")
    };
    ($code:ident, $reason:expr) => {
        $crate::error::Error::stream($crate::error::ErrorCode::$code, $reason)
    };
}

/// Implements conversion from decoder errors
impl From<DecoderError> for Error {
    fn from(decoder_error: DecoderError) -> Self {
        match decoder_error {
            DecoderError::UnexpectedEof(_) | DecoderError::UnexpectedBytes(_) => {
                connection_error!(FRAME_SIZE_ERROR, "malformed frame length")
            }
            DecoderError::InvariantViolation(reason) => {
                Error::connection(ErrorCode::PROTOCOL_ERROR, reason)
            }
            _ => connection_error!(PROTOCOL_ERROR, "malformed frame"),
        }
    }
}
