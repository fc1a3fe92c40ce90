//! Module API for the SpiralACT stack.
//!
//! Layers here are inference-first: every convolution reports the FLOPs it
//! spent per image so that adaptive-computation blocks can meter the work
//! done for each example.

pub mod flops;
pub mod io;
pub mod layers;
pub mod module;
pub mod registry;

pub use flops::{
    accumulate_flops, conv2d_flops, resize_mask, zero_flops, Flops, MaskedFlopPolicy, OutputMask,
};
pub use io::{load_bincode, load_json, save_bincode, save_json};
pub use layers::{BatchNorm2d, BatchNormSettings, Conv2d, MaxPool2d, Relu};
pub use module::{Module, Parameter};
pub use registry::{ParameterEntry, ParameterRegistry};

pub use st_tensor::{PureResult, Shape, Tensor, TensorError};
