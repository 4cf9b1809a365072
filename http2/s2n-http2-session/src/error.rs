// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use core::fmt;
use s2n_http2_core::error as h2;
use std::{io, sync::Arc};

/// Errors that end a session or fail a submission
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The peer or the local endpoint violated the protocol
    Protocol(h2::Error),

    /// The underlying transport failed
    Io(Arc<io::Error>),

    /// The transport was closed by the peer without a GOAWAY
    Disconnected,

    /// The idle timer expired while the session was shutting down
    IdleTimeout,

    /// The session is closed and no longer accepts submissions
    Closed,
}

impl Error {
    /// The code this error would carry in a GOAWAY or RST_STREAM frame
    #[inline]
    pub fn error_code(&self) -> h2::ErrorCode {
        match self {
            Self::Protocol(error) => error.code,
            Self::Io(_) | Self::Disconnected => h2::ErrorCode::INTERNAL_ERROR,
            Self::IdleTimeout | Self::Closed => h2::ErrorCode::NO_ERROR,
        }
    }

    #[inline]
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}

impl From<h2::Error> for Error {
    #[inline]
    fn from(error: h2::Error) -> Self {
        Self::Protocol(error)
    }
}

impl From<io::Error> for Error {
    #[inline]
    fn from(error: io::Error) -> Self {
        Self::Io(Arc::new(error))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Protocol(error) => error.fmt(f),
            Self::Io(error) => write!(f, "transport failure: {error}"),
            Self::Disconnected => f.write_str("transport closed without a GOAWAY"),
            Self::IdleTimeout => f.write_str("session idle timeout expired"),
            Self::Closed => f.write_str("session is closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(error) => Some(error.as_ref()),
            _ => None,
        }
    }
}
