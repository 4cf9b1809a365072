// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Core types for the s2n-http2 session engine
//!
//! This crate contains the wire-level data model of RFC 7540 (frame records,
//! error codes, settings, stream identifiers) together with the small pieces
//! of shared machinery (state transition macros, flow-control window
//! arithmetic) the session engine is built on. It performs no I/O.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

#[cfg(feature = "alloc")]
extern crate alloc;

#[macro_use]
pub mod error;
pub mod endpoint;
#[cfg(feature = "alloc")]
pub mod frame;
pub mod state;
pub mod stream;
pub mod window;
