// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::flow_control::FlowController;

/// The eager strategy: every consumed octet moves toward a WINDOW_UPDATE
/// at both scopes as soon as the application acknowledges it
///
/// This is the canonical accounting implemented by the trait defaults.
#[derive(Clone, Copy, Debug, Default)]
pub struct Simple;

impl FlowController for Simple {}
