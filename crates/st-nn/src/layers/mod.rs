// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

pub mod activation;
pub mod conv;
pub mod normalization;
pub mod pool;

pub use activation::Relu;
pub use conv::Conv2d;
pub use normalization::{BatchNorm2d, BatchNormSettings};
pub use pool::MaxPool2d;
