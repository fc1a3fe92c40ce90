// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Evaluation export.
//!
//! Every dataset has `num_samples` rows; batch `i` fills rows
//! `[i · batch_size, (i + 1) · batch_size)`. The record is written with
//! bincode once every batch has arrived.

use crate::end_points::EndPoints;
use crate::error::{ActError, ActResult};
use crate::visualization::{sact_map, HeatmapMetric};
use ndarray::{ArrayBase, Data, Dimension};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Dense row-major `f32` array.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl Dataset {
    pub fn zeros(shape: Vec<usize>) -> Self {
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![0.0; len],
        }
    }

    fn from_array<S, D, F>(array: &ArrayBase<S, D>, cast: F) -> Self
    where
        S: Data,
        D: Dimension,
        F: Fn(&S::Elem) -> f32,
    {
        Self {
            shape: array.shape().to_vec(),
            data: array.iter().map(cast).collect(),
        }
    }

    pub fn rows(&self) -> usize {
        self.shape.first().copied().unwrap_or(0)
    }

    /// Elements per row.
    pub fn row_len(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    pub fn row(&self, index: usize) -> Option<&[f32]> {
        let len = self.row_len();
        self.data.get(index * len..(index + 1) * len)
    }
}

/// Everything exported for one evaluation run.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub block_scopes: Vec<String>,
    pub datasets: BTreeMap<String, Dataset>,
}

impl EvaluationRecord {
    pub fn dataset(&self, name: &str) -> Option<&Dataset> {
        self.datasets.get(name)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> ActResult<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|source| ActError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        bincode::serialize_into(BufWriter::new(file), self).map_err(|source| ActError::Bincode {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> ActResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| ActError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        bincode::deserialize_from(BufReader::new(file)).map_err(|source| ActError::Bincode {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Per-batch values of every exported dataset. Values absent from the end
/// points, such as the ponder cost of static blocks, are skipped.
fn batch_datasets(end_points: &EndPoints, sact: bool) -> ActResult<BTreeMap<String, Dataset>> {
    let mut datasets = BTreeMap::new();
    for block in end_points.blocks() {
        let scope = &block.scope;
        if let Some(cost) = &block.ponder_cost {
            datasets.insert(format!("{scope}/ponder_cost"), Dataset::from_array(cost, |&v| v));
        }
        datasets.insert(
            format!("{scope}/num_units"),
            Dataset::from_array(&block.num_units, |&v| v as f32),
        );
        if let Some(distribution) = &block.halting_distribution {
            datasets.insert(
                format!("{scope}/halting_distribution"),
                Dataset::from_array(distribution, |&v| v),
            );
        }
        datasets.insert(
            format!("{scope}/flops"),
            Dataset::from_array(&block.flops, |&v| v as f32),
        );
    }
    datasets.insert(
        "images".to_string(),
        Dataset::from_array(end_points.inputs()?.array(), |&v| v),
    );
    datasets.insert(
        "flops".to_string(),
        Dataset::from_array(end_points.flops(), |&v| v as f32),
    );
    if sact {
        for (name, metric) in [
            ("ponder_cost_map", HeatmapMetric::PonderCost),
            ("num_units_map", HeatmapMetric::NumUnits),
        ] {
            let map = sact_map(end_points, metric)?;
            datasets.insert(name.to_string(), Dataset::from_array(&map, |&v| v));
        }
    }
    Ok(datasets)
}

/// Number of batches covering `num_samples`; the batch size must divide it.
pub fn num_batches(num_samples: usize, batch_size: usize) -> ActResult<usize> {
    if batch_size == 0 || num_samples % batch_size != 0 {
        return Err(ActError::IndivisibleBatches {
            num_samples,
            batch_size,
        });
    }
    Ok(num_samples / batch_size)
}

/// Fills an [`EvaluationRecord`] batch by batch. Dataset shapes are taken
/// from the first batch written.
#[derive(Debug)]
pub struct EvaluationWriter {
    path: PathBuf,
    num_samples: usize,
    batch_size: usize,
    sact: bool,
    record: EvaluationRecord,
    written: Vec<bool>,
}

impl EvaluationWriter {
    pub fn new(
        path: impl Into<PathBuf>,
        num_samples: usize,
        batch_size: usize,
        sact: bool,
    ) -> ActResult<Self> {
        let num_batches = num_batches(num_samples, batch_size)?;
        Ok(Self {
            path: path.into(),
            num_samples,
            batch_size,
            sact,
            record: EvaluationRecord::default(),
            written: vec![false; num_batches],
        })
    }

    pub fn num_batches(&self) -> usize {
        self.written.len()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_batch(&mut self, index: usize, end_points: &EndPoints) -> ActResult<()> {
        let num_batches = self.num_batches();
        if index >= num_batches {
            return Err(ActError::BatchOutOfRange { index, num_batches });
        }
        let batch = batch_datasets(end_points, self.sact)?;
        if self.record.datasets.is_empty() {
            self.record.block_scopes = end_points.block_scopes();
            for (name, values) in &batch {
                let mut shape = values.shape.clone();
                if let Some(rows) = shape.first_mut() {
                    *rows = self.num_samples;
                }
                debug!(dataset = name.as_str(), ?shape, "creating dataset");
                self.record
                    .datasets
                    .insert(name.clone(), Dataset::zeros(shape));
            }
        }

        for (name, values) in batch {
            let dataset = self.record.datasets.get_mut(&name).ok_or_else(|| {
                ActError::DatasetShape {
                    name: name.clone(),
                    expected: Vec::new(),
                    found: values.shape.clone(),
                }
            })?;
            let mut expected = dataset.shape.clone();
            if let Some(rows) = expected.first_mut() {
                *rows = self.batch_size;
            }
            if values.shape != expected {
                return Err(ActError::DatasetShape {
                    name,
                    expected,
                    found: values.shape,
                });
            }
            let start = index * self.batch_size * dataset.row_len();
            dataset.data[start..start + values.data.len()].copy_from_slice(&values.data);
        }
        self.written[index] = true;
        Ok(())
    }

    /// Writes the record once every batch is in and returns it.
    pub fn finish(self) -> ActResult<EvaluationRecord> {
        let written = self.written.iter().filter(|&&done| done).count();
        if written != self.written.len() {
            return Err(ActError::IncompleteExport {
                written,
                expected: self.written.len(),
            });
        }
        self.record.save(&self.path)?;
        Ok(self.record)
    }
}

/// Evaluates `num_samples / batch_size` batches with `evaluate` and exports
/// them to `path`.
pub fn export_evaluation<F>(
    path: impl Into<PathBuf>,
    num_samples: usize,
    batch_size: usize,
    sact: bool,
    mut evaluate: F,
) -> ActResult<EvaluationRecord>
where
    F: FnMut(usize) -> ActResult<EndPoints>,
{
    let mut writer = EvaluationWriter::new(path, num_samples, batch_size, sact)?;
    let num_batches = writer.num_batches();
    for index in 0..num_batches {
        info!("Evaluating batch {}/{}", index + 1, num_batches);
        let end_points = evaluate(index)?;
        writer.write_batch(index, &end_points)?;
    }
    let path = writer.path().to_path_buf();
    let record = writer.finish()?;
    info!(?path, datasets = record.datasets.len(), "evaluation export written");
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::end_points::BlockEndPoints;
    use ndarray::{Array1, Array3, Array4};
    use st_tensor::Tensor;
    use tempfile::tempdir;

    fn end_points(offset: f32, adaptive: bool) -> EndPoints {
        let inputs = Tensor::full([2, 2, 2, 3], offset).unwrap();
        let mut end_points = EndPoints::new(2).with_inputs(inputs);
        end_points.push_block(BlockEndPoints {
            scope: "block1".into(),
            max_units: 2,
            ponder_cost: adaptive.then(|| Array3::from_elem((2, 1, 1), offset + 1.0)),
            num_units: Array3::from_elem((2, 1, 1), 2),
            flops: Array1::from_elem(2, 100.0),
            halting_distribution: adaptive.then(|| Array4::from_elem((2, 1, 1, 2), 0.5)),
            output: Tensor::zeros([2, 1, 1, 1]).unwrap(),
        })
        .unwrap();
        end_points
    }

    #[test]
    fn batches_fill_consecutive_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("eval.bin");
        let record = export_evaluation(&path, 4, 2, false, |index| {
            Ok(end_points(index as f32, true))
        })
        .unwrap();
        let cost = record.dataset("block1/ponder_cost").unwrap();
        assert_eq!(cost.shape, vec![4, 1, 1]);
        assert_eq!(cost.data, vec![1.0, 1.0, 2.0, 2.0]);
        let images = record.dataset("images").unwrap();
        assert_eq!(images.shape, vec![4, 2, 2, 3]);
        assert!(images.row(3).unwrap().iter().all(|&v| v == 1.0));
        assert_eq!(record.block_scopes, vec!["block1"]);
        assert!(record.dataset("ponder_cost_map").is_none());

        let loaded = EvaluationRecord::load(&path).unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn sact_exports_input_resolution_maps() {
        let dir = tempdir().unwrap();
        let record = export_evaluation(dir.path().join("sact.bin"), 2, 2, true, |_| {
            Ok(end_points(0.0, true))
        })
        .unwrap();
        let map = record.dataset("num_units_map").unwrap();
        assert_eq!(map.shape, vec![2, 2, 2]);
        assert!(map.data.iter().all(|&v| v == 2.0));
        assert_eq!(
            record.dataset("block1/halting_distribution").unwrap().shape,
            vec![2, 1, 1, 2]
        );
    }

    #[test]
    fn static_runs_skip_absent_values() {
        let dir = tempdir().unwrap();
        let record = export_evaluation(dir.path().join("static.bin"), 2, 2, false, |_| {
            Ok(end_points(0.0, false))
        })
        .unwrap();
        assert!(record.dataset("block1/ponder_cost").is_none());
        assert!(record.dataset("block1/num_units").is_some());
        assert_eq!(record.dataset("flops").unwrap().data, vec![100.0, 100.0]);
    }

    #[test]
    fn sample_count_must_divide_into_batches() {
        let dir = tempdir().unwrap();
        let err = EvaluationWriter::new(dir.path().join("x.bin"), 5, 2, false).unwrap_err();
        assert!(matches!(
            err,
            ActError::IndivisibleBatches {
                num_samples: 5,
                batch_size: 2
            }
        ));
        assert!(EvaluationWriter::new(dir.path().join("x.bin"), 4, 0, false).is_err());
    }

    #[test]
    fn unfinished_exports_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        let mut writer = EvaluationWriter::new(&path, 4, 2, false).unwrap();
        writer.write_batch(1, &end_points(0.0, true)).unwrap();
        assert!(matches!(
            writer.write_batch(2, &end_points(0.0, true)),
            Err(ActError::BatchOutOfRange { index: 2, num_batches: 2 })
        ));
        assert!(matches!(
            writer.finish(),
            Err(ActError::IncompleteExport { written: 1, expected: 2 })
        ));
        assert!(!path.exists());
    }
}
