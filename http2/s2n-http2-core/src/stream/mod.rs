// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Types and utilities around the HTTP/2 stream identifier and stream
//! lifecycle

pub mod id;
pub mod state;

pub use id::StreamId;
pub use state::State;
