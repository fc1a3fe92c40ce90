// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Vision backbones built on the adaptive-computation blocks of `st-act`.

pub mod models;

pub use models::resnet_act::{
    Bottleneck, BottleneckArgs, ResNetAct, ResNetActConfig, ResNetActOutput,
};
