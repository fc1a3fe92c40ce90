// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

//! Explicit parameter listing used by fine-tuning and checkpoint tooling.

use crate::module::Module;
use crate::{PureResult, Shape};

/// Name, shape and trainability of one parameter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParameterEntry {
    pub name: String,
    pub shape: Shape,
    pub trainable: bool,
}

/// Snapshot of a module's parameters in visit order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParameterRegistry {
    entries: Vec<ParameterEntry>,
}

impl ParameterRegistry {
    pub fn from_module<M: Module + ?Sized>(module: &M) -> PureResult<Self> {
        let mut entries = Vec::new();
        module.visit_parameters(&mut |param| {
            entries.push(ParameterEntry {
                name: param.name().to_string(),
                shape: param.value().shape(),
                trainable: param.is_trainable(),
            });
            Ok(())
        })?;
        Ok(Self { entries })
    }

    pub fn from_entries(entries: Vec<ParameterEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[ParameterEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|entry| entry.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    /// Trainable parameters only; buffers are skipped.
    pub fn trainable(&self) -> impl Iterator<Item = &ParameterEntry> {
        self.entries.iter().filter(|entry| entry.trainable)
    }

    /// Splits the registry into `(matching, rest)` by name.
    pub fn partition<F>(&self, predicate: F) -> (ParameterRegistry, ParameterRegistry)
    where
        F: Fn(&str) -> bool,
    {
        let (matching, rest) = self
            .entries
            .iter()
            .cloned()
            .partition(|entry| predicate(&entry.name));
        (Self { entries: matching }, Self { entries: rest })
    }
}
