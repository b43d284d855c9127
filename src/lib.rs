//! Pore-scale reactive transport on voxelized geometries.
//!
//! This crate couples five numerical subsystems on one shared 3D lattice:
//! a D3Q19 lattice-Boltzmann flow solver, one D3Q7 advection-diffusion
//! lattice per dissolved species, per-voxel Monod (or user-supplied)
//! reaction kinetics, an equilibrium speciation solver, and a
//! cellular-automaton biofilm spreading rule that feeds geometry changes
//! back into the flow.
//!
//! # Architecture
//!
//! The crate is split into three modules:
//!
//! - `schema`: configuration types and validation
//! - `compute`: lattice solvers, reaction operators and the time-step engine
//! - `output`: geometry ingestion, VTI field dumps and checkpoints
//!
//! # Example
//!
//! ```rust,no_run
//! use porelab::{Engine, SimulationConfig};
//!
//! let config = SimulationConfig::load(std::path::Path::new("config.json"))?;
//! let mut engine = Engine::from_config(config)?;
//! let summary = engine.run()?;
//! println!("{}", summary);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod compute;
pub mod output;
pub mod schema;

// Re-export commonly used types
pub use compute::{Engine, RunSummary, SimulationError};
pub use schema::{ConfigError, SimulationConfig};
