// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Pure Rust activation tensors for the adaptive-computation stack.
//!
//! Every activation flowing through SpiralACT is a rank-4
//! `batch × height × width × channels` array of `f32`. Operations never
//! mutate their receiver; they return fresh tensors so that the outputs of a
//! residual unit can be kept alive in the end-points record while the next
//! unit runs.

pub mod spatial;

use core::fmt;
use ndarray::{concatenate, s, Array3, Array4, ArrayView3, ArrayView4, Axis};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};
use spiral_config::determinism;
use std::error::Error;
use std::ops::Range;

use self::spatial::nearest_index;

/// Result alias used throughout the pure module.
pub type PureResult<T> = Result<T, TensorError>;

/// `[batch, height, width, channels]`.
pub type Shape = [usize; 4];

/// Errors emitted by tensor utilities.
#[derive(Clone, Debug, PartialEq)]
pub enum TensorError {
    /// A tensor constructor received a shape with a zero extent.
    InvalidShape { shape: Vec<usize> },
    /// Data provided to a constructor does not match the tensor shape.
    DataLength { expected: usize, got: usize },
    /// An operator was asked to combine tensors of incompatible shapes.
    ShapeMismatch { left: Vec<usize>, right: Vec<usize> },
    /// Computation received an empty input which would otherwise trigger a panic.
    EmptyInput(&'static str),
    /// Numeric guard detected a non-finite value that would otherwise propagate NaNs.
    NonFiniteValue { label: &'static str, value: f32 },
    /// Generic configuration violation.
    InvalidValue { label: &'static str },
    /// Attempted to load or update a parameter that was missing from the state dict.
    MissingParameter { name: String },
    /// Wrapper around I/O failures when persisting or restoring tensors.
    IoError { message: String },
    /// Wrapper around serde failures when deserialising tensors.
    SerializationError { message: String },
    /// Failure raised by a model built on top of tensors, such as a rejected
    /// configuration or a non-finite halting probability.
    ModelError { message: String },
}

impl fmt::Display for TensorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TensorError::InvalidShape { shape } => {
                write!(f, "invalid tensor shape {shape:?}; every extent must be positive")
            }
            TensorError::DataLength { expected, got } => {
                write!(f, "data length mismatch: expected {expected}, got {got}")
            }
            TensorError::ShapeMismatch { left, right } => {
                write!(f, "shape mismatch: left={left:?}, right={right:?}")
            }
            TensorError::EmptyInput(label) => write!(f, "empty input for {label}"),
            TensorError::NonFiniteValue { label, value } => {
                write!(f, "non-finite value {value} encountered in {label}")
            }
            TensorError::InvalidValue { label } => write!(f, "invalid value for {label}"),
            TensorError::MissingParameter { name } => {
                write!(f, "missing parameter '{name}' in state dict")
            }
            TensorError::IoError { message } => write!(f, "i/o error: {message}"),
            TensorError::SerializationError { message } => {
                write!(f, "serialization error: {message}")
            }
            TensorError::ModelError { message } => write!(f, "model error: {message}"),
        }
    }
}

impl Error for TensorError {}

fn validate_shape(shape: Shape) -> PureResult<()> {
    if shape.iter().any(|&extent| extent == 0) {
        return Err(TensorError::InvalidShape {
            shape: shape.to_vec(),
        });
    }
    Ok(())
}

fn mismatch(left: Shape, right: &[usize]) -> TensorError {
    TensorError::ShapeMismatch {
        left: left.to_vec(),
        right: right.to_vec(),
    }
}

/// Rank-4 NHWC activation tensor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    data: Array4<f32>,
}

impl Tensor {
    /// Create a tensor filled with zeros.
    pub fn zeros(shape: Shape) -> PureResult<Self> {
        Self::full(shape, 0.0)
    }

    /// Create a tensor filled with `value`.
    pub fn full(shape: Shape, value: f32) -> PureResult<Self> {
        validate_shape(shape)?;
        Ok(Self {
            data: Array4::from_elem(shape, value),
        })
    }

    /// Create a tensor from row-major (NHWC) data.
    pub fn from_vec(shape: Shape, data: Vec<f32>) -> PureResult<Self> {
        validate_shape(shape)?;
        let expected = shape.iter().product::<usize>();
        if expected != data.len() {
            return Err(TensorError::DataLength {
                expected,
                got: data.len(),
            });
        }
        let data = Array4::from_shape_vec(shape, data).map_err(|_| TensorError::InvalidShape {
            shape: shape.to_vec(),
        })?;
        Ok(Self { data })
    }

    /// Wrap an owned array, normalising it to standard layout.
    pub fn from_array(data: Array4<f32>) -> PureResult<Self> {
        let dim = data.dim();
        validate_shape([dim.0, dim.1, dim.2, dim.3])?;
        let data = if data.is_standard_layout() {
            data
        } else {
            data.as_standard_layout().into_owned()
        };
        Ok(Self { data })
    }

    /// Construct a tensor by applying a generator function to each coordinate.
    pub fn from_fn<F>(shape: Shape, mut f: F) -> PureResult<Self>
    where
        F: FnMut([usize; 4]) -> f32,
    {
        validate_shape(shape)?;
        Ok(Self {
            data: Array4::from_shape_fn(shape, |(n, y, x, c)| f([n, y, x, c])),
        })
    }

    /// Lift a `batch × h × w` map into a single-channel tensor.
    pub fn from_map(map: Array3<f32>) -> PureResult<Self> {
        Self::from_array(map.insert_axis(Axis(3)))
    }

    /// Sample a tensor from `U(min, max)`.
    pub fn random_uniform(shape: Shape, min: f32, max: f32, seed: Option<u64>) -> PureResult<Self> {
        validate_shape(shape)?;
        if !min.is_finite() || !max.is_finite() || min >= max {
            return Err(TensorError::InvalidValue {
                label: "random_uniform_bounds",
            });
        }
        let mut rng: StdRng = determinism::rng_from_optional(seed, "st-tensor/tensor/uniform");
        let distribution = Uniform::new(min, max);
        Ok(Self {
            data: Array4::from_shape_simple_fn(shape, || distribution.sample(&mut rng)),
        })
    }

    /// Sample a tensor from `N(mean, std²)`.
    pub fn random_normal(shape: Shape, mean: f32, std: f32, seed: Option<u64>) -> PureResult<Self> {
        Self::random_normal_labelled(shape, mean, std, seed, "st-tensor/tensor/normal")
    }

    /// Like [`Tensor::random_normal`] but draws from the stream named `label`,
    /// so that layers sharing one model seed receive distinct weights.
    pub fn random_normal_labelled(
        shape: Shape,
        mean: f32,
        std: f32,
        seed: Option<u64>,
        label: &str,
    ) -> PureResult<Self> {
        validate_shape(shape)?;
        if std <= 0.0 || !std.is_finite() {
            return Err(TensorError::InvalidValue {
                label: "random_normal_std",
            });
        }
        let mut rng: StdRng = determinism::rng_from_optional(seed, label);
        Ok(Self {
            data: Array4::from_shape_simple_fn(shape, || {
                let sample: f64 = StandardNormal.sample(&mut rng);
                mean + std * sample as f32
            }),
        })
    }

    pub fn shape(&self) -> Shape {
        let (n, h, w, c) = self.data.dim();
        [n, h, w, c]
    }

    pub fn batch(&self) -> usize {
        self.data.dim().0
    }

    /// `(height, width)`.
    pub fn spatial(&self) -> (usize, usize) {
        let (_, h, w, _) = self.data.dim();
        (h, w)
    }

    pub fn channels(&self) -> usize {
        self.data.dim().3
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn array(&self) -> &Array4<f32> {
        &self.data
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }

    pub fn into_array(self) -> Array4<f32> {
        self.data
    }

    /// Contiguous NHWC view of the values.
    pub fn data(&self) -> &[f32] {
        self.data.as_slice().unwrap_or(&[])
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }

    /// Collapse a single-channel tensor into a `batch × h × w` map.
    pub fn to_map(&self) -> PureResult<Array3<f32>> {
        if self.channels() != 1 {
            return Err(mismatch(self.shape(), &[self.batch(), 0, 0, 1]));
        }
        Ok(self.data.index_axis(Axis(3), 0).to_owned())
    }

    fn ensure_same_shape(&self, other: &Tensor) -> PureResult<()> {
        if self.shape() != other.shape() {
            return Err(mismatch(self.shape(), &other.shape()));
        }
        Ok(())
    }

    pub fn add(&self, other: &Tensor) -> PureResult<Tensor> {
        self.ensure_same_shape(other)?;
        Ok(Self {
            data: &self.data + &other.data,
        })
    }

    pub fn scale(&self, factor: f32) -> Tensor {
        Self {
            data: &self.data * factor,
        }
    }

    pub fn map<F>(&self, f: F) -> Tensor
    where
        F: Fn(f32) -> f32,
    {
        Self {
            data: self.data.mapv(f),
        }
    }

    pub fn relu(&self) -> Tensor {
        self.map(|v| v.max(0.0))
    }

    pub fn sigmoid(&self) -> Tensor {
        self.map(|v| 1.0 / (1.0 + (-v).exp()))
    }

    /// Adds `other` broadcast to `self`'s shape (e.g. `n × 1 × 1 × c`).
    pub fn broadcast_add(&self, other: &Tensor) -> PureResult<Tensor> {
        let target = self.data.raw_dim();
        let view = other
            .data
            .broadcast(target)
            .ok_or_else(|| mismatch(self.shape(), &other.shape()))?;
        Ok(Self {
            data: &self.data + &view,
        })
    }

    /// Multiplies every channel by a `batch × h × w` map, which may also be
    /// `batch × 1 × 1`.
    pub fn mul_map(&self, map: &ArrayView3<'_, f32>) -> PureResult<Tensor> {
        let (n, h, w) = map.dim();
        let shape = self.shape();
        if n != shape[0] || !((h, w) == (shape[1], shape[2]) || (h, w) == (1, 1)) {
            return Err(mismatch(shape, &[n, h, w, 1]));
        }
        let expanded = map.view().insert_axis(Axis(3));
        let view = expanded
            .broadcast(self.data.raw_dim())
            .ok_or_else(|| mismatch(shape, &[n, h, w, 1]))?;
        Ok(Self {
            data: &self.data * &view,
        })
    }

    /// Global average pool to `batch × 1 × 1 × channels`.
    pub fn mean_spatial(&self) -> PureResult<Tensor> {
        let [n, h, w, c] = self.shape();
        let area = (h * w) as f32;
        if area == 0.0 {
            return Err(TensorError::EmptyInput("mean_spatial"));
        }
        let mut out = Array4::<f32>::zeros((n, 1, 1, c));
        for ((b, _, _, ch), slot) in out.indexed_iter_mut() {
            let sum: f32 = self.data.slice(s![b, .., .., ch]).sum();
            *slot = sum / area;
        }
        Ok(Self { data: out })
    }

    /// Keeps every `stride`-th row and column starting at zero.
    pub fn subsample(&self, stride: usize) -> PureResult<Tensor> {
        if stride == 0 {
            return Err(TensorError::InvalidValue {
                label: "subsample_stride",
            });
        }
        if stride == 1 {
            return Ok(self.clone());
        }
        let step = stride as isize;
        Self::from_array(self.data.slice(s![.., ..;step, ..;step, ..]).to_owned())
    }

    /// Zero padding (or `value` padding) on the spatial axes.
    pub fn pad_spatial(
        &self,
        top: usize,
        bottom: usize,
        left: usize,
        right: usize,
        value: f32,
    ) -> Tensor {
        if top + bottom + left + right == 0 {
            return self.clone();
        }
        let [n, h, w, c] = self.shape();
        let mut out = Array4::from_elem((n, h + top + bottom, w + left + right, c), value);
        out.slice_mut(s![.., top..top + h, left..left + w, ..])
            .assign(&self.data);
        Self { data: out }
    }

    /// Nearest-neighbour resize of the spatial axes.
    pub fn resize_nearest(&self, out_h: usize, out_w: usize) -> PureResult<Tensor> {
        let [n, h, w, c] = self.shape();
        validate_shape([n, out_h, out_w, c])?;
        if (h, w) == (out_h, out_w) {
            return Ok(self.clone());
        }
        let data = Array4::from_shape_fn((n, out_h, out_w, c), |(b, y, x, ch)| {
            self.data[[b, nearest_index(y, h, out_h), nearest_index(x, w, out_w), ch]]
        });
        Ok(Self { data })
    }

    /// Copy the images in `range` into a new tensor.
    pub fn slice_batch(&self, range: Range<usize>) -> PureResult<Tensor> {
        if range.start >= range.end || range.end > self.batch() {
            return Err(TensorError::InvalidValue {
                label: "slice_batch_range",
            });
        }
        Self::from_array(self.data.slice(s![range, .., .., ..]).to_owned())
    }

    /// Concatenate tensors along `axis` (0 = batch, 2 = width, 3 = channels).
    pub fn concat(axis: usize, parts: &[&Tensor]) -> PureResult<Tensor> {
        let first = parts.first().ok_or(TensorError::EmptyInput("concat"))?;
        if axis > 3 {
            return Err(TensorError::InvalidValue {
                label: "concat_axis",
            });
        }
        let views: Vec<ArrayView4<'_, f32>> = parts.iter().map(|t| t.view()).collect();
        let data = concatenate(Axis(axis), &views).map_err(|_| {
            let offender = parts
                .iter()
                .find(|t| {
                    let (a, b) = (t.shape(), first.shape());
                    (0..4).any(|i| i != axis && a[i] != b[i])
                })
                .map(|t| t.shape())
                .unwrap_or_else(|| first.shape());
            mismatch(first.shape(), &offender)
        })?;
        Self::from_array(data)
    }

    /// Per-image min-max normalisation to `[0, 1]`; constant images map to zero.
    pub fn min_max_normalize(&self) -> Tensor {
        let mut data = self.data.clone();
        for mut image in data.axis_iter_mut(Axis(0)) {
            let (lo, hi) = image
                .iter()
                .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), &v| {
                    (lo.min(v), hi.max(v))
                });
            let range = hi - lo;
            if range > 0.0 && range.is_finite() {
                image.mapv_inplace(|v| (v - lo) / range);
            } else {
                image.fill(0.0);
            }
        }
        Self { data }
    }

    pub fn mean(&self) -> f32 {
        self.data.mean().unwrap_or(0.0)
    }

    /// Returns an error naming `label` if any value is NaN or infinite.
    pub fn ensure_finite(&self, label: &'static str) -> PureResult<()> {
        match self.data.iter().find(|v| !v.is_finite()) {
            Some(&value) => Err(TensorError::NonFiniteValue { label, value }),
            None => Ok(()),
        }
    }
}

impl From<Tensor> for Array4<f32> {
    fn from(tensor: Tensor) -> Self {
        tensor.data
    }
}
