// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Typed HTTP/2 frame records
//!
//! Each frame type lives in its own module; the [`frames!`] invocation at
//! the bottom ties them into the [`Frame`] enum together with the decode
//! dispatch and encode forwarding. Frames decode zero-copy out of a
//! [`DecoderBufferMut`] and are converted into owned records with
//! [`Frame::into_owned`] when they outlive the parse buffer.

use s2n_codec::{
    DecoderBufferMut, DecoderBufferMutResult, DecoderError, DecoderValueMut, Encoder, EncoderValue,
};

pub mod header;

pub use header::{Flags, FrameHeader, Tag, FRAME_HEADER_LEN};

use crate::stream::StreamId;

#[cfg(feature = "alloc")]
use bytes::Bytes;

// Decodes the optional pad length octet and splits padding off the back of
// the payload, evaluating to `(declared padding, unpadded contents)`.
//
// This is a macro rather than a function so one body serves both the
// mutable and immutable decoder impls the codec macros generate.
macro_rules! strip_padding {
    ($flags:expr, $buffer:ident) => {{
        if !$flags.contains($crate::frame::Flags::PADDED) {
            (None, $buffer)
        } else {
            let (pad_len, buffer) = $buffer.decode::<u8>()?;

            //= https://www.rfc-editor.org/rfc/rfc7540#section-6.1
            //# If the length of the padding is the length of the
            //# frame payload or greater, the recipient MUST treat this as a
            //# connection error (Section 5.4.1) of type PROTOCOL_ERROR.
            let content_len = buffer.len().checked_sub(usize::from(pad_len)).ok_or(
                s2n_codec::DecoderError::InvariantViolation("padding exceeds payload"),
            )?;

            let (content, padding) = buffer.decode_slice(content_len)?;
            // the padding octets themselves carry no semantics
            let _ = padding.skip(usize::from(pad_len))?;

            (Some(pad_len), content)
        }
    }};
}

macro_rules! frames {
    ($payload:ident |
     $($tag_macro:ident => $module:ident, $handler:ident, $ty:ident $([$($generics:tt)+])?;)*) => {
        $(
            #[macro_use]
            pub mod $module;
            pub use $module::$ty;
        )*

        /// An HTTP/2 frame
        ///
        /// `Payload` is the representation of variable-length frame contents:
        /// a borrowed [`DecoderBufferMut`] straight off the parser, or
        /// [`bytes::Bytes`] for frames owned by the outbound queue.
        #[derive(Debug, PartialEq, Eq)]
        pub enum Frame<$payload> {
            $(
                $ty($module::$ty $(<$($generics)+>)?),
            )*
        }

        impl<$payload> Frame<$payload> {
            /// Returns the frame type tag
            pub fn tag(&self) -> Tag {
                match self {
                    $(
                        Frame::$ty(frame) => frame.tag(),
                    )*
                }
            }

            /// Returns the stream the frame applies to
            ///
            /// Connection-scoped frames return [`StreamId::CONNECTION`].
            pub fn stream_id(&self) -> StreamId {
                match self {
                    $(
                        Frame::$ty(frame) => frame.stream_id(),
                    )*
                }
            }
        }

        $(
            impl<$payload> From<$module::$ty $(<$($generics)+>)?> for Frame<$payload> {
                #[inline]
                fn from(frame: $module::$ty $(<$($generics)+>)?) -> Self {
                    Frame::$ty(frame)
                }
            }
        )*

        impl<$payload: EncoderValue> EncoderValue for Frame<$payload> {
            fn encode<E: Encoder>(&self, buffer: &mut E) {
                match self {
                    $(
                        Frame::$ty(frame) => buffer.encode(frame),
                    )*
                }
            }
        }

        struct BasicFrameDecoder;

        impl<'a, $payload: DecoderValueMut<'a>> FrameDecoder<'a, $payload> for BasicFrameDecoder {
            type Output = Frame<$payload>;

            $(
                fn $handler(
                    &mut self,
                    frame: $module::$ty $(<$($generics)+>)?,
                ) -> Result<Self::Output, DecoderError> {
                    Ok(Frame::$ty(frame))
                }
            )*
        }

        /// Dispatches the decode of a single frame payload by its header
        pub trait FrameDecoder<'a, $payload: DecoderValueMut<'a>> {
            type Output;

            $(
                fn $handler(
                    &mut self,
                    frame: $module::$ty $(<$($generics)+>)?,
                ) -> Result<Self::Output, DecoderError>;
            )*

            /// Called for a frame type this decoder does not recognize
            ///
            /// At the top level of a connection this is a protocol
            /// violation, which is the default.
            fn handle_unknown_frame(
                &mut self,
                header: FrameHeader,
                buffer: DecoderBufferMut<'a>,
            ) -> DecoderBufferMutResult<'a, Self::Output> {
                let _ = header;
                let _ = buffer;

                Err(DecoderError::InvariantViolation("unknown frame type"))
            }

            /// Decodes the payload of the frame described by `header`
            ///
            /// `buffer` must hold exactly the `header.payload_len()` payload
            /// octets.
            fn decode_frame(
                &mut self,
                header: FrameHeader,
                buffer: DecoderBufferMut<'a>,
            ) -> DecoderBufferMutResult<'a, Self::Output> {
                match header.frame_type {
                    $(
                        $tag_macro!() => {
                            let (frame, buffer) = buffer.decode_parameterized(header)?;
                            let output = self.$handler(frame)?;
                            Ok((output, buffer))
                        }
                    )*
                    _ => self.handle_unknown_frame(header, buffer),
                }
            }
        }
    };
}

frames! {
    Payload |
    data_tag => data, handle_data_frame, Data[Payload];
    headers_tag => headers, handle_headers_frame, Headers[Payload];
    priority_tag => priority, handle_priority_frame, Priority;
    rst_stream_tag => rst_stream, handle_rst_stream_frame, RstStream;
    settings_tag => settings, handle_settings_frame, Settings;
    push_promise_tag => push_promise, handle_push_promise_frame, PushPromise[Payload];
    ping_tag => ping, handle_ping_frame, Ping;
    go_away_tag => go_away, handle_go_away_frame, GoAway[Payload];
    window_update_tag => window_update, handle_window_update_frame, WindowUpdate;
}

pub type FrameMut<'a> = Frame<DecoderBufferMut<'a>>;

#[cfg(feature = "alloc")]
pub type FrameBytes = Frame<Bytes>;

impl<'a> FrameMut<'a> {
    /// Decodes a single frame from its header and payload buffer
    pub fn decode(
        header: FrameHeader,
        buffer: DecoderBufferMut<'a>,
    ) -> DecoderBufferMutResult<'a, Self> {
        BasicFrameDecoder.decode_frame(header, buffer)
    }

    /// Copies the frame out of the parse buffer
    #[cfg(feature = "alloc")]
    pub fn into_owned(self) -> FrameBytes {
        let copy = |payload: DecoderBufferMut<'a>| {
            Bytes::copy_from_slice(payload.into_less_safe_slice())
        };

        match self {
            Frame::Data(frame) => Frame::Data(frame.map_payload(copy)),
            Frame::Headers(frame) => Frame::Headers(frame.map_payload(copy)),
            Frame::Priority(frame) => Frame::Priority(frame),
            Frame::RstStream(frame) => Frame::RstStream(frame),
            Frame::Settings(frame) => Frame::Settings(frame),
            Frame::PushPromise(frame) => Frame::PushPromise(frame.map_payload(copy)),
            Frame::Ping(frame) => Frame::Ping(frame),
            Frame::GoAway(frame) => Frame::GoAway(frame.map_payload(copy)),
            Frame::WindowUpdate(frame) => Frame::WindowUpdate(frame),
        }
    }
}
