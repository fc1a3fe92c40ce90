//! Process-wide runtime configuration for SpiralACT.
//!
//! Two concerns live here: installing the global `tracing` subscriber and
//! deriving reproducible random generators for parameter initialisation.

pub mod determinism;
pub mod tracing;
