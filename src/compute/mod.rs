//! Compute module - lattice solvers, reaction operators and the time-step
//! engine.

mod distance;
mod dynamics;
mod engine;
mod equilibrium;
mod flow;
mod grid;
mod kinetics;
mod spread;
mod state;
mod stencil;
mod transport;

pub use distance::*;
pub use dynamics::*;
pub use engine::*;
pub use equilibrium::*;
pub use flow::*;
pub use grid::*;
pub use kinetics::*;
pub use spread::*;
pub use state::*;
pub use stencil::*;
pub use transport::*;

use crate::output::GeometryError;
use crate::schema::ConfigError;

/// Fatal simulation failures.
///
/// Soft conditions (per-voxel equilibrium non-convergence, percolation
/// collapse) are counters and warnings, not variants here.
#[derive(Debug, thiserror::Error)]
pub enum SimulationError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Geometry(#[from] GeometryError),
    #[error("stability gate failed: {what} = {value}")]
    Stability { what: &'static str, value: f64 },
    #[error("biomass redistribution did not settle within {passes} passes")]
    SpreaderStuck { passes: u32 },
    #[error("distance field BFS exceeded {levels} levels")]
    DistanceOverflow { levels: u32 },
    #[error("non-finite {field} at voxel ({i},{j},{k}) in iteration {iter}")]
    NonFinite {
        field: &'static str,
        i: usize,
        j: usize,
        k: usize,
        iter: u64,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
