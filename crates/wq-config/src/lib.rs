//! Process-wide runtime configuration for WaveQ.
//!
//! [`tracing`] installs the global subscriber used by every crate in the
//! workspace and [`determinism`] derives reproducible RNG streams for
//! parameter initialisation and dropout masks.

pub mod determinism;
pub mod tracing;
