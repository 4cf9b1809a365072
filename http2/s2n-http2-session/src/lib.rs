// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The s2n-http2 session engine
//!
//! A [`session::Session`] multiplexes many concurrent streams over one
//! reliable byte transport, enforcing RFC 7540 framing, per-stream and
//! per-session flow control, and orderly shutdown. The engine is symmetric:
//! client and server behavior differ only in the strategies composed into
//! the [`session::Builder`].
//!
//! The engine performs no I/O of its own. Decoded frames are pushed in
//! through [`session::Session::on_frame`]; outbound bytes leave through the
//! [`transport::Transport`] the session was built with, serialized by a
//! single-writer flusher.

pub mod codec;
pub mod config;
mod error;
pub mod event;
pub mod flow_control;
mod flusher;
pub mod scheduler;
pub mod session;
pub mod stream;
mod sync;
pub mod task;
pub mod transport;

pub use error::Error;
pub use event::{Event, SessionListener};
pub use session::{Builder, Session};
pub use stream::Stream;
pub use task::Task;
