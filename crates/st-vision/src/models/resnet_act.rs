// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! ResNet v1 with bottleneck units grouped into four adaptive blocks.
//!
//! Layout: 7×7/2 stem convolution, 3×3/2 max pool, `block1..block4` and a
//! 1×1 convolution head over globally pooled features. Every convolution uses
//! `SAME` padding; the stride of blocks 2–4 sits on their first unit so that a
//! block keeps a single feature resolution after that unit, which is the
//! resolution SACT halts at.

use ndarray::{Array2, Array3, Axis};
use serde::{Deserialize, Serialize};
use st_act::{
    build_estimator, ActConfig, ActError, ActResult, Block, BlockAssembler, EndPoints,
    ResidualUnit,
};
use st_nn::{
    accumulate_flops, conv2d_flops, io, resize_mask, BatchNorm2d, BatchNormSettings, Conv2d, Flops, MaxPool2d,
    Module, OutputMask, Parameter, Relu,
};
use st_tensor::{PureResult, SamePadding, Tensor, TensorError};
use std::fs;
use std::path::Path;
use tracing::debug;

/// Static arguments of one bottleneck unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BottleneckArgs {
    /// Output channels.
    pub depth: usize,
    /// Channels of the inner 3×3 convolution.
    pub depth_bottleneck: usize,
    pub stride: usize,
}

#[derive(Debug)]
enum Shortcut {
    Identity,
    Subsample(usize),
    Projection { conv: Conv2d, bn: BatchNorm2d },
}

/// Mask values resampled to `hw` when the mask lives at another resolution.
fn mask_values_at(
    mask: Option<&OutputMask<'_>>,
    hw: (usize, usize),
) -> PureResult<Option<Array3<f32>>> {
    match mask {
        Some(mask) => resize_mask(mask, hw.0, hw.1),
        None => Ok(None),
    }
}

fn rebind<'a, 'm: 'a>(
    mask: Option<&OutputMask<'m>>,
    resized: Option<&'a Array3<f32>>,
) -> Option<OutputMask<'a>> {
    match (mask, resized) {
        (Some(mask), Some(values)) => Some(OutputMask::new(values.view(), mask.policy())),
        (Some(mask), None) => Some(OutputMask::new(mask.values().reborrow(), mask.policy())),
        (None, _) => None,
    }
}

/// `relu(shortcut(x) + mask · residual(x))` with a 1×1 → 3×3 → 1×1 residual
/// path. Parameters live under `{unit_scope}/bottleneck`.
#[derive(Debug)]
pub struct Bottleneck {
    in_channels: usize,
    args: BottleneckArgs,
    shortcut: Shortcut,
    conv1: Conv2d,
    bn1: BatchNorm2d,
    conv2: Conv2d,
    bn2: BatchNorm2d,
    conv3: Conv2d,
    bn3: BatchNorm2d,
    relu: Relu,
}

impl Bottleneck {
    pub fn new(
        unit_scope: &str,
        in_channels: usize,
        args: BottleneckArgs,
        bn: BatchNormSettings,
        seed: Option<u64>,
    ) -> PureResult<Self> {
        let scope = format!("{unit_scope}/bottleneck");
        let BottleneckArgs {
            depth,
            depth_bottleneck,
            stride,
        } = args;
        let shortcut = if in_channels != depth {
            Shortcut::Projection {
                conv: Conv2d::new(format!("{scope}/shortcut"), in_channels, depth, (1, 1), stride, seed)?,
                bn: BatchNorm2d::from_settings(format!("{scope}/shortcut/bn"), depth, bn)?,
            }
        } else if stride > 1 {
            Shortcut::Subsample(stride)
        } else {
            Shortcut::Identity
        };
        Ok(Self {
            in_channels,
            args,
            shortcut,
            conv1: Conv2d::new(format!("{scope}/conv1"), in_channels, depth_bottleneck, (1, 1), 1, seed)?,
            bn1: BatchNorm2d::from_settings(format!("{scope}/conv1/bn"), depth_bottleneck, bn)?,
            conv2: Conv2d::new(
                format!("{scope}/conv2"),
                depth_bottleneck,
                depth_bottleneck,
                (3, 3),
                stride,
                seed,
            )?,
            bn2: BatchNorm2d::from_settings(format!("{scope}/conv2/bn"), depth_bottleneck, bn)?,
            conv3: Conv2d::new(format!("{scope}/conv3"), depth_bottleneck, depth, (1, 1), 1, seed)?,
            bn3: BatchNorm2d::from_settings(format!("{scope}/conv3/bn"), depth, bn)?,
            relu: Relu::new(),
        })
    }

    pub fn args(&self) -> BottleneckArgs {
        self.args
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn has_projection(&self) -> bool {
        matches!(self.shortcut, Shortcut::Projection { .. })
    }

    fn shortcut(&self, input: &Tensor, mask: Option<&OutputMask<'_>>) -> PureResult<(Tensor, Option<Flops>)> {
        match &self.shortcut {
            Shortcut::Identity => Ok((input.clone(), None)),
            Shortcut::Subsample(stride) => Ok((input.subsample(*stride)?, None)),
            Shortcut::Projection { conv, bn } => {
                let (projected, flops) = conv.forward_masked(input, mask)?;
                Ok((bn.forward(&projected)?, Some(flops)))
            }
        }
    }
}

impl ResidualUnit for Bottleneck {
    fn forward_masked(
        &self,
        input: &Tensor,
        mask: Option<&OutputMask<'_>>,
    ) -> PureResult<(Tensor, Flops)> {
        let input_hw = input.spatial();
        let output_hw = self.conv2.output_hw(input_hw)?;
        let input_values = mask_values_at(mask, input_hw)?;
        let output_values = mask_values_at(mask, output_hw)?;
        let input_mask = rebind(mask, input_values.as_ref());
        let output_mask = rebind(mask, output_values.as_ref());

        let (net, mut flops) = self.conv1.forward_masked(input, input_mask.as_ref())?;
        let net = self.relu.forward(&self.bn1.forward(&net)?)?;
        let (net, conv2_flops) = self.conv2.forward_masked(&net, output_mask.as_ref())?;
        let net = self.relu.forward(&self.bn2.forward(&net)?)?;
        let (net, conv3_flops) = self.conv3.forward_masked(&net, output_mask.as_ref())?;
        let mut residual = self.bn3.forward(&net)?;
        accumulate_flops(&mut flops, &conv2_flops)?;
        accumulate_flops(&mut flops, &conv3_flops)?;

        if let Some(mask) = &output_mask {
            residual = residual.mul_map(&mask.values())?;
        }
        let (shortcut, shortcut_flops) = self.shortcut(input, output_mask.as_ref())?;
        if let Some(shortcut_flops) = shortcut_flops {
            accumulate_flops(&mut flops, &shortcut_flops)?;
        }
        Ok((self.relu.forward(&shortcut.add(&residual)?)?, flops))
    }

    fn output_channels(&self) -> usize {
        self.args.depth
    }
}

impl Module for Bottleneck {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        self.forward_masked(input, None).map(|(output, _)| output)
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        if let Shortcut::Projection { conv, bn } = &self.shortcut {
            conv.visit_parameters(visitor)?;
            bn.visit_parameters(visitor)?;
        }
        self.conv1.visit_parameters(visitor)?;
        self.bn1.visit_parameters(visitor)?;
        self.conv2.visit_parameters(visitor)?;
        self.bn2.visit_parameters(visitor)?;
        self.conv3.visit_parameters(visitor)?;
        self.bn3.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        if let Shortcut::Projection { conv, bn } = &mut self.shortcut {
            conv.visit_parameters_mut(visitor)?;
            bn.visit_parameters_mut(visitor)?;
        }
        self.conv1.visit_parameters_mut(visitor)?;
        self.bn1.visit_parameters_mut(visitor)?;
        self.conv2.visit_parameters_mut(visitor)?;
        self.bn2.visit_parameters_mut(visitor)?;
        self.conv3.visit_parameters_mut(visitor)?;
        self.bn3.visit_parameters_mut(visitor)
    }

    fn set_training(&self, training: bool) {
        if let Shortcut::Projection { bn, .. } = &self.shortcut {
            bn.set_training(training);
        }
        self.bn1.set_training(training);
        self.bn2.set_training(training);
        self.bn3.set_training(training);
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ActError {
    ActError::InvalidConfig {
        field,
        reason: reason.into(),
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResNetActConfig {
    /// `[50]`, `[101]`, `[152]`, `[200]` or four explicit unit counts.
    pub num_layers: Vec<usize>,
    pub num_classes: usize,
    pub input_hw: (usize, usize),
    pub input_channels: usize,
    /// Stem width; block `i` has bottleneck width `base_width · 2^i` and
    /// four times as many output channels.
    pub base_width: usize,
    pub batch_norm: BatchNormSettings,
    pub seed: Option<u64>,
    pub act: ActConfig,
}

impl Default for ResNetActConfig {
    fn default() -> Self {
        Self {
            num_layers: vec![50],
            num_classes: 1001,
            input_hw: (224, 224),
            input_channels: 3,
            base_width: 64,
            batch_norm: BatchNormSettings::default(),
            seed: None,
            act: ActConfig::default(),
        }
    }
}

impl ResNetActConfig {
    /// Parses `"101"` or `"3_4_6_3"`.
    pub fn parse_num_layers(text: &str) -> ActResult<Vec<usize>> {
        text.split('_')
            .map(|part| {
                part.trim()
                    .parse::<usize>()
                    .map_err(|err| invalid("num_layers", format!("`{text}`: {err}")))
            })
            .collect()
    }

    /// Units per block.
    pub fn block_depths(&self) -> ActResult<[usize; 4]> {
        match self.num_layers.as_slice() {
            [50] => Ok([3, 4, 6, 3]),
            [101] => Ok([3, 4, 23, 3]),
            [152] => Ok([3, 8, 36, 3]),
            [200] => Ok([3, 24, 36, 3]),
            &[a, b, c, d] if a > 0 && b > 0 && c > 0 && d > 0 => Ok([a, b, c, d]),
            other => Err(invalid(
                "num_layers",
                format!("{other:?} is neither a known depth nor four positive unit counts"),
            )),
        }
    }

    pub fn validate(&self) -> ActResult<()> {
        self.act.validate()?;
        self.block_depths()?;
        if self.num_classes == 0 {
            return Err(invalid("num_classes", "must be positive"));
        }
        if self.input_hw.0 == 0 || self.input_hw.1 == 0 || self.input_channels == 0 {
            return Err(invalid("input_hw", "input extents must be positive"));
        }
        if self.base_width == 0 {
            return Err(invalid("base_width", "must be positive"));
        }
        Ok(())
    }

    /// Scope and unit arguments of every block.
    pub fn block_args(&self) -> ActResult<Vec<(String, Vec<BottleneckArgs>)>> {
        let depths = self.block_depths()?;
        Ok(depths
            .iter()
            .enumerate()
            .map(|(index, &units)| {
                let width = self.base_width << index;
                let args = (0..units)
                    .map(|unit| BottleneckArgs {
                        depth: 4 * width,
                        depth_bottleneck: width,
                        stride: if index > 0 && unit == 0 { 2 } else { 1 },
                    })
                    .collect();
                (format!("block{}", index + 1), args)
            })
            .collect())
    }

    /// Per-image FLOPs of a static forward pass, computed from shapes alone.
    pub fn static_flops(&self) -> ActResult<f64> {
        self.validate()?;
        let same = |input: usize, kernel: usize, stride: usize| -> PureResult<usize> {
            Ok(SamePadding::new(input, kernel, stride)?.output)
        };
        let (h, w) = self.input_hw;
        let (mut h, mut w) = (same(h, 7, 2)?, same(w, 7, 2)?);
        let mut total = conv2d_flops((7, 7), self.input_channels, self.base_width, (h * w) as f64);
        (h, w) = (same(h, 3, 2)?, same(w, 3, 2)?);

        let mut channels = self.base_width;
        for (_, args) in self.block_args()? {
            for unit in args {
                let (oh, ow) = (same(h, 3, unit.stride)?, same(w, 3, unit.stride)?);
                let (input_positions, output_positions) = ((h * w) as f64, (oh * ow) as f64);
                if channels != unit.depth {
                    total += conv2d_flops((1, 1), channels, unit.depth, output_positions);
                }
                total += conv2d_flops((1, 1), channels, unit.depth_bottleneck, input_positions);
                total += conv2d_flops(
                    (3, 3),
                    unit.depth_bottleneck,
                    unit.depth_bottleneck,
                    output_positions,
                );
                total += conv2d_flops((1, 1), unit.depth_bottleneck, unit.depth, output_positions);
                channels = unit.depth;
                (h, w) = (oh, ow);
            }
        }
        Ok(total + conv2d_flops((1, 1), channels, self.num_classes, 1.0))
    }

    pub fn from_json_path(path: impl AsRef<Path>) -> ActResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ActError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ActError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }
}

/// Logits and the end points of one forward pass.
#[derive(Clone, Debug)]
pub struct ResNetActOutput {
    /// `batch × num_classes`.
    pub logits: Array2<f32>,
    pub end_points: EndPoints,
}

#[derive(Debug)]
pub struct ResNetAct {
    config: ResNetActConfig,
    stem_conv: Conv2d,
    stem_bn: BatchNorm2d,
    stem_pool: MaxPool2d,
    relu: Relu,
    blocks: Vec<Block>,
    logits: Conv2d,
    assembler: BlockAssembler,
}

impl ResNetAct {
    pub fn new(config: ResNetActConfig) -> ActResult<Self> {
        config.validate()?;
        let bn = config.batch_norm;
        let seed = config.seed;
        let width = config.base_width;

        let mut channels = width;
        let mut blocks = Vec::with_capacity(4);
        for (scope, args) in config.block_args()? {
            let block = Block::new(scope, &args, |unit_scope, args| {
                let unit = Bottleneck::new(unit_scope, channels, *args, bn, seed)?;
                channels = args.depth;
                Ok(Box::new(unit) as Box<dyn ResidualUnit>)
            })?
            .attach_estimators(|unit_scope, unit_channels| {
                build_estimator(unit_scope, unit_channels, &config.act, bn, seed)
            })?;
            blocks.push(block);
        }

        Ok(Self {
            stem_conv: Conv2d::new("conv1", config.input_channels, width, (7, 7), 2, seed)?,
            stem_bn: BatchNorm2d::from_settings("conv1/bn", width, bn)?,
            stem_pool: MaxPool2d::new(3, 2)?,
            relu: Relu::new(),
            logits: Conv2d::new("logits", channels, config.num_classes, (1, 1), 1, seed)?
                .with_bias(0.0)?,
            assembler: BlockAssembler::from_config(&config.act),
            blocks,
            config,
        })
    }

    pub fn config(&self) -> &ResNetActConfig {
        &self.config
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Runs the network on `batch × h × w × c` images.
    pub fn forward_with_end_points(&self, images: &Tensor) -> ActResult<ResNetActOutput> {
        if images.channels() != self.config.input_channels {
            return Err(TensorError::ShapeMismatch {
                left: images.shape().to_vec(),
                right: vec![images.batch(), 0, 0, self.config.input_channels],
            }
            .into());
        }
        images.ensure_finite("resnet_act_images")?;
        let mut end_points = EndPoints::new(images.batch()).with_inputs(images.clone());

        let (net, stem_flops) = self.stem_conv.forward_masked(images, None)?;
        end_points.add_flops(&stem_flops)?;
        let net = self.relu.forward(&self.stem_bn.forward(&net)?)?;
        let net = self.stem_pool.forward(&net)?;

        let net = self.assembler.stack(&net, &self.blocks, &mut end_points)?;

        let (logits, head_flops) = self.logits.forward_masked(&net.mean_spatial()?, None)?;
        end_points.add_flops(&head_flops)?;
        let logits = logits
            .into_array()
            .index_axis_move(Axis(1), 0)
            .index_axis_move(Axis(1), 0);
        debug!(
            mode = %self.assembler.mode(),
            batch = images.batch(),
            mean_flops = end_points.flops().mean().unwrap_or(0.0),
            "forward pass"
        );
        Ok(ResNetActOutput { logits, end_points })
    }

    /// Ponder-cost loss term of a forward pass.
    pub fn ponder_loss(&self, end_points: &EndPoints) -> f64 {
        end_points.total_ponder_cost(self.config.act.ponder_cost_weight)
    }

    /// Saves every parameter and buffer; the format follows the extension.
    pub fn save_checkpoint(&self, path: impl AsRef<Path>) -> ActResult<()> {
        Ok(io::save_state_dict(&self.state_dict()?, path)?)
    }

    pub fn load_checkpoint(&mut self, path: impl AsRef<Path>) -> ActResult<()> {
        let state = io::load_state_dict(path)?;
        Ok(self.load_state_dict(&state)?)
    }
}

impl Module for ResNetAct {
    fn forward(&self, input: &Tensor) -> PureResult<Tensor> {
        let output = self.forward_with_end_points(input).map_err(|err| match err {
            ActError::Tensor(err) => err,
            other => TensorError::ModelError {
                message: other.to_string(),
            },
        })?;
        let (batch, classes) = output.logits.dim();
        Tensor::from_vec([batch, 1, 1, classes], output.logits.into_raw_vec())
    }

    fn visit_parameters(
        &self,
        visitor: &mut dyn FnMut(&Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.stem_conv.visit_parameters(visitor)?;
        self.stem_bn.visit_parameters(visitor)?;
        for block in &self.blocks {
            block.visit_parameters(visitor)?;
        }
        self.logits.visit_parameters(visitor)
    }

    fn visit_parameters_mut(
        &mut self,
        visitor: &mut dyn FnMut(&mut Parameter) -> PureResult<()>,
    ) -> PureResult<()> {
        self.stem_conv.visit_parameters_mut(visitor)?;
        self.stem_bn.visit_parameters_mut(visitor)?;
        for block in &mut self.blocks {
            block.visit_parameters_mut(visitor)?;
        }
        self.logits.visit_parameters_mut(visitor)
    }

    fn set_training(&self, training: bool) {
        self.stem_bn.set_training(training);
        for block in &self.blocks {
            block.set_training(training);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use st_act::AdaptationMode;
    use st_nn::MaskedFlopPolicy;

    fn tiny(mode: AdaptationMode) -> ResNetActConfig {
        ResNetActConfig {
            num_layers: vec![2, 1, 2, 1],
            num_classes: 5,
            input_hw: (32, 32),
            base_width: 4,
            seed: Some(7),
            act: ActConfig::default().with_mode(mode),
            ..ResNetActConfig::default()
        }
    }

    fn images(batch: usize) -> Tensor {
        Tensor::random_uniform([batch, 32, 32, 3], 0.0, 1.0, Some(3)).unwrap()
    }

    #[test]
    fn reference_flop_counts() {
        let resnet_101 = ResNetActConfig {
            num_layers: vec![101],
            ..ResNetActConfig::default()
        };
        assert_eq!(resnet_101.static_flops().unwrap(), 15_602_814_976.0);
        assert_eq!(ResNetActConfig::default().static_flops().unwrap(), 8_178_372_608.0);
    }

    #[test]
    #[ignore = "full ResNet-50 forward on the reference convolution takes minutes"]
    fn resnet_50_forward_reports_reference_flops() {
        let config = ResNetActConfig {
            seed: Some(1),
            act: ActConfig::default().with_mode(AdaptationMode::Static),
            ..ResNetActConfig::default()
        };
        let model = ResNetAct::new(config).unwrap();
        let images = Tensor::random_uniform([3, 224, 224, 3], 0.0, 1.0, Some(5)).unwrap();
        let output = model.forward_with_end_points(&images).unwrap();
        assert_eq!(output.logits.dim(), (3, 1001));
        assert_eq!(output.end_points.flops().to_vec(), vec![8_178_372_608.0; 3]);
    }

    #[test]
    fn num_layers_accepts_known_depths_and_explicit_counts() {
        let config = ResNetActConfig {
            num_layers: ResNetActConfig::parse_num_layers("3_4_6_3").unwrap(),
            ..ResNetActConfig::default()
        };
        assert_eq!(config.block_depths().unwrap(), [3, 4, 6, 3]);
        assert_eq!(ResNetActConfig::parse_num_layers("152").unwrap(), vec![152]);
        assert!(ResNetActConfig::parse_num_layers("3_x").is_err());
        let config = ResNetActConfig {
            num_layers: vec![34],
            ..ResNetActConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ActError::InvalidConfig { field: "num_layers", .. })
        ));
    }

    #[test]
    fn strides_sit_on_the_first_unit_of_later_blocks() {
        let args = tiny(AdaptationMode::Static).block_args().unwrap();
        let strides: Vec<Vec<usize>> = args
            .iter()
            .map(|(_, units)| units.iter().map(|unit| unit.stride).collect())
            .collect();
        assert_eq!(strides, vec![vec![1, 1], vec![2], vec![2, 1], vec![2]]);
        assert_eq!(args[3].1[0].depth, 128);
        assert_eq!(args[0].0, "block1");
    }

    #[test]
    fn static_forward_matches_analytic_flops() {
        let config = tiny(AdaptationMode::Static);
        let expected = config.static_flops().unwrap();
        let model = ResNetAct::new(config).unwrap();
        let output = model.forward_with_end_points(&images(2)).unwrap();
        assert_eq!(output.logits.dim(), (2, 5));
        for &flops in output.end_points.flops() {
            assert!((flops - expected).abs() <= expected * 1e-12);
        }
        assert!(output.end_points.blocks().iter().all(|b| b.ponder_cost.is_none()));
        assert_eq!(model.ponder_loss(&output.end_points), 0.0);
    }

    #[test]
    fn every_mode_produces_consistent_end_points() {
        for mode in [
            AdaptationMode::Act,
            AdaptationMode::ActEarlyStopping,
            AdaptationMode::Sact,
        ] {
            let model = ResNetAct::new(tiny(mode)).unwrap();
            let output = model.forward_with_end_points(&images(2)).unwrap();
            assert_eq!(output.logits.dim(), (2, 5));
            assert!(output.logits.iter().all(|v| v.is_finite()));
            let end_points = &output.end_points;
            assert_eq!(end_points.block_scopes(), ["block1", "block2", "block3", "block4"]);
            assert_eq!(end_points.block_num_units(), vec![2, 1, 2, 1]);
            for block in end_points.blocks() {
                let n = block.max_units as u32;
                assert!(block.num_units.iter().all(|&units| (1..=n).contains(&units)));
                let distribution = block.halting_distribution.as_ref().unwrap();
                for weights in distribution.lanes(Axis(3)) {
                    assert!((weights.sum() - 1.0).abs() < 1e-5);
                }
            }
            assert!(model.ponder_loss(end_points) >= 4.0);
        }
    }

    #[test]
    fn sact_maps_follow_block_resolution() {
        let model = ResNetAct::new(tiny(AdaptationMode::Sact)).unwrap();
        let output = model.forward_with_end_points(&images(1)).unwrap();
        let dims: Vec<(usize, usize, usize)> = output
            .end_points
            .blocks()
            .iter()
            .map(|block| block.num_units.dim())
            .collect();
        assert_eq!(dims, vec![(1, 8, 8), (1, 4, 4), (1, 2, 2), (1, 1, 1)]);
    }

    #[test]
    fn parameters_are_scoped_by_unit() {
        let model = ResNetAct::new(tiny(AdaptationMode::Act)).unwrap();
        let state = model.state_dict().unwrap();
        assert!(state.contains_key("block1/unit_2/bottleneck/conv1::weight"));
        assert!(state.contains_key("block1/unit_1/bottleneck/shortcut::weight"));
        assert!(state.contains_key("block1/unit_1/halting_proba/global_conv::bias"));
        assert!(!state.contains_key("block1/unit_2/halting_proba/global_conv::bias"));
        assert!(state.contains_key("logits::bias"));

        let static_model = ResNetAct::new(tiny(AdaptationMode::Static)).unwrap();
        let static_state = static_model.state_dict().unwrap();
        assert!(static_state.keys().all(|name| !name.contains("/halting_proba/")));
    }

    #[test]
    fn masked_bottleneck_charges_only_active_positions() {
        let args = BottleneckArgs {
            depth: 8,
            depth_bottleneck: 2,
            stride: 1,
        };
        let unit = Bottleneck::new("b/unit_2", 8, args, BatchNormSettings::default(), Some(1)).unwrap();
        assert!(!unit.has_projection());
        let input = Tensor::random_uniform([1, 2, 2, 8], 0.0, 1.0, Some(2)).unwrap();
        let zeros = Array3::<f32>::zeros((1, 2, 2));
        let mask = OutputMask::new(zeros.view(), MaskedFlopPolicy::ActivePositions);
        let (output, flops) = unit.forward_masked(&input, Some(&mask)).unwrap();
        assert_eq!(flops[0], 0.0);
        assert_eq!(output, input.relu());

        let (_, dense) = unit.forward_masked(&input, None).unwrap();
        let per_position = 2.0 * (8.0 * 2.0 + 9.0 * 2.0 * 2.0 + 2.0 * 8.0);
        assert_eq!(dense[0], 4.0 * per_position);
    }

    #[test]
    fn strided_bottleneck_resamples_an_output_mask_for_conv1() {
        let args = BottleneckArgs {
            depth: 8,
            depth_bottleneck: 2,
            stride: 2,
        };
        let unit = Bottleneck::new("b/unit_1", 8, args, BatchNormSettings::default(), Some(4)).unwrap();
        let input = Tensor::random_uniform([1, 4, 4, 8], 0.0, 1.0, Some(6)).unwrap();
        let mut values = Array3::<f32>::zeros((1, 2, 2));
        values[[0, 0, 0]] = 1.0;
        let mask = OutputMask::new(values.view(), MaskedFlopPolicy::ActivePositions);
        let (output, flops) = unit.forward_masked(&input, Some(&mask)).unwrap();
        assert_eq!(output.shape(), [1, 2, 2, 8]);
        // conv1 sees the top-left 2×2 input patch; conv2 and conv3 one output.
        let conv1 = 2.0 * 8.0 * 2.0 * 4.0;
        let conv2 = 2.0 * 9.0 * 2.0 * 2.0;
        let conv3 = 2.0 * 2.0 * 8.0;
        assert_eq!(flops[0], conv1 + conv2 + conv3);
    }

    #[test]
    fn sact_runs_with_a_coarser_halting_resolution() {
        let mut config = tiny(AdaptationMode::Sact);
        config.act.sact_resolution = Some((3, 3));
        let model = ResNetAct::new(config).unwrap();
        let output = model.forward_with_end_points(&images(2)).unwrap();
        let block1 = &output.end_points.blocks()[0];
        assert_eq!(block1.num_units.dim(), (2, 8, 8));
        assert!(block1.num_units.iter().all(|&n| (1..=2).contains(&n)));
    }

    #[test]
    fn module_forward_reports_halting_failures_as_model_errors() {
        let mut model = ResNetAct::new(tiny(AdaptationMode::Act)).unwrap();
        let name = "block1/unit_1/halting_proba/global_conv::bias";
        let mut state = model.state_dict().unwrap();
        let shape = state[name].shape();
        state.insert(name.to_string(), Tensor::full(shape, f32::NAN).unwrap());
        model.load_state_dict(&state).unwrap();

        let direct = model.forward_with_end_points(&images(1)).unwrap_err();
        assert!(matches!(direct, ActError::NonFiniteProbability { unit: 0, .. }), "{direct}");
        let err = Module::forward(&model, &images(1)).unwrap_err();
        match err {
            TensorError::ModelError { message } => assert!(message.contains("block1"), "{message}"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn checkpoints_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        let model = ResNetAct::new(tiny(AdaptationMode::Sact)).unwrap();
        model.save_checkpoint(&path).unwrap();
        let mut other = ResNetAct::new(ResNetActConfig {
            seed: Some(99),
            ..tiny(AdaptationMode::Sact)
        })
        .unwrap();
        assert_ne!(other.state_dict().unwrap(), model.state_dict().unwrap());
        other.load_checkpoint(&path).unwrap();
        assert_eq!(other.state_dict().unwrap(), model.state_dict().unwrap());
    }
}
