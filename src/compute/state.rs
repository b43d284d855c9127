//! Per-voxel simulation state: distributions, scalar fields, mask, deltas.
//!
//! All fields are flat structure-of-arrays vectors indexed by `Grid::idx`.
//! Each solver stage owns its writes; delta buffers decouple the kinetics
//! sweep from the update that applies it.

use rayon::prelude::*;

use super::grid::{Grid, VoxelClass};
use super::stencil::{Q7, Q19, W7, W19, feq, geq};

/// One D3Q7 advected scalar: distributions, macroscopic cache, kinetics
/// delta and per-voxel relaxation frequency.
pub struct ScalarLattice {
    /// Distribution values, `Q7` per voxel.
    pub g: Vec<f64>,
    /// Macroscopic concentration (zeroth moment), refreshed after streaming.
    pub conc: Vec<f64>,
    /// Source-term buffer filled by kinetics, consumed by the apply step.
    pub delta: Vec<f64>,
    /// Installed relaxation frequency per voxel (pore vs biofilm).
    pub omega: Vec<f64>,
}

impl ScalarLattice {
    /// Allocate a lattice at rest with uniform concentration `c0`.
    pub fn uniform(grid: &Grid, mask: &[VoxelClass], c0: f64) -> Self {
        let n = grid.len();
        let mut g = vec![0.0; n * Q7];
        for (idx, class) in mask.iter().enumerate() {
            if class.is_fluid() {
                for q in 0..Q7 {
                    g[idx * Q7 + q] = W7[q] * c0;
                }
            }
        }
        let conc = mask
            .iter()
            .map(|c| if c.is_fluid() { c0 } else { 0.0 })
            .collect();
        Self {
            g,
            conc,
            delta: vec![0.0; n],
            omega: vec![0.0; n],
        }
    }

    /// Refresh the concentration cache from the distributions.
    pub fn refresh_conc(&mut self, mask: &[VoxelClass]) {
        let g = &self.g;
        self.conc.par_iter_mut().enumerate().for_each(|(idx, c)| {
            if mask[idx].is_fluid() {
                *c = g[idx * Q7..idx * Q7 + Q7].iter().sum();
            } else {
                *c = 0.0;
            }
        });
    }

    /// Overwrite one voxel's distributions with the equilibrium at `conc`.
    #[inline]
    pub fn set_equilibrium(&mut self, idx: usize, conc: f64, ux: f64, uy: f64, uz: f64) {
        for q in 0..Q7 {
            self.g[idx * Q7 + q] = geq(q, conc, ux, uy, uz);
        }
        self.conc[idx] = conc;
    }

    /// Shift one voxel's zeroth moment by `dc` without touching higher moments.
    #[inline]
    pub fn inject(&mut self, idx: usize, dc: f64) {
        for q in 0..Q7 {
            self.g[idx * Q7 + q] += W7[q] * dc;
        }
        self.conc[idx] += dc;
    }
}

/// The full per-voxel state shared by every solver stage.
pub struct State {
    pub grid: Grid,
    /// Voxel classification, written only by the dynamics updater after setup.
    pub mask: Vec<VoxelClass>,
    /// Original material tag of each voxel, kept for initial-density mapping.
    pub tags: Vec<i32>,
    /// Face-metric distance to the nearest wall voxel.
    pub distance: Vec<u32>,
    /// Iterations since the voxel last changed class.
    pub age: Vec<u64>,

    /// Flow distributions, `Q19` per voxel.
    pub f: Vec<f64>,
    /// Streaming scratch, swapped with `f` each flow step.
    pub f_tmp: Vec<f64>,
    /// Installed flow relaxation frequency per voxel.
    pub omega_ns: Vec<f64>,
    /// Macroscopic density.
    pub rho: Vec<f64>,
    /// Macroscopic velocity components.
    pub ux: Vec<f64>,
    pub uy: Vec<f64>,
    pub uz: Vec<f64>,

    /// One advected lattice per dissolved species.
    pub species: Vec<ScalarLattice>,
    /// Per-microbe biomass density. For mobile microbes this mirrors the
    /// zeroth moment of the matching lattice in `biomass_lattices`.
    pub biomass: Vec<Vec<f64>>,
    /// Kinetics delta per microbe.
    pub biomass_delta: Vec<Vec<f64>>,
    /// D3Q7 lattice for mobile (advected or diffusive) microbes; `None` for
    /// sessile ones.
    pub biomass_lattices: Vec<Option<ScalarLattice>>,
    /// Push-then-pull buffers used by the biofilm spreader, one per microbe.
    pub shove: Vec<Vec<f64>>,
}

impl State {
    /// Allocate all fields for a masked grid. Lattices start at rest.
    pub fn new(grid: Grid, mask: Vec<VoxelClass>, tags: Vec<i32>, n_species: usize, n_microbes: usize) -> Self {
        let n = grid.len();
        assert_eq!(mask.len(), n, "mask length does not match grid");

        let mut f = vec![0.0; n * Q19];
        for (idx, class) in mask.iter().enumerate() {
            if class.is_fluid() {
                for q in 0..Q19 {
                    f[idx * Q19 + q] = W19[q];
                }
            }
        }

        let species = (0..n_species)
            .map(|_| ScalarLattice::uniform(&grid, &mask, 0.0))
            .collect();

        Self {
            grid,
            mask,
            tags,
            distance: vec![0; n],
            age: vec![0; n],
            f,
            f_tmp: vec![0.0; n * Q19],
            omega_ns: vec![0.0; n],
            rho: vec![1.0; n],
            ux: vec![0.0; n],
            uy: vec![0.0; n],
            uz: vec![0.0; n],
            species,
            biomass: vec![vec![0.0; n]; n_microbes],
            biomass_delta: vec![vec![0.0; n]; n_microbes],
            biomass_lattices: (0..n_microbes).map(|_| None).collect(),
            shove: vec![vec![0.0; n]; n_microbes],
        }
    }

    /// Recompute density and velocity from the flow distributions.
    pub fn refresh_flow_moments(&mut self) {
        let f = &self.f;
        let mask = &self.mask;
        let n = self.grid.len();
        (
            &mut self.rho,
            &mut self.ux,
            &mut self.uy,
            &mut self.uz,
        )
            .into_par_iter()
            .enumerate()
            .for_each(|(idx, (rho, ux, uy, uz))| {
                if !mask[idx].is_fluid() {
                    *rho = 1.0;
                    *ux = 0.0;
                    *uy = 0.0;
                    *uz = 0.0;
                    return;
                }
                let fs = &f[idx * Q19..idx * Q19 + Q19];
                let r: f64 = fs.iter().sum();
                let mut m = [0.0f64; 3];
                for q in 0..Q19 {
                    let c = super::stencil::C19[q];
                    m[0] += fs[q] * c[0] as f64;
                    m[1] += fs[q] * c[1] as f64;
                    m[2] += fs[q] * c[2] as f64;
                }
                *rho = r;
                if r > 0.0 {
                    *ux = m[0] / r;
                    *uy = m[1] / r;
                    *uz = m[2] / r;
                } else {
                    *ux = 0.0;
                    *uy = 0.0;
                    *uz = 0.0;
                }
            });
        debug_assert_eq!(self.rho.len(), n);
    }

    /// Zero the velocity field; transport then runs diffusion-only.
    pub fn zero_velocity(&mut self) {
        self.ux.fill(0.0);
        self.uy.fill(0.0);
        self.uz.fill(0.0);
    }

    /// Reset one fluid voxel's flow distributions to equilibrium.
    #[inline]
    pub fn set_flow_equilibrium(&mut self, idx: usize, rho: f64, ux: f64, uy: f64, uz: f64) {
        for q in 0..Q19 {
            self.f[idx * Q19 + q] = feq(q, rho, ux, uy, uz);
        }
        self.rho[idx] = rho;
        self.ux[idx] = ux;
        self.uy[idx] = uy;
        self.uz[idx] = uz;
    }

    /// Total sessile-plus-mobile biomass at one voxel.
    #[inline]
    pub fn biomass_total_at(&self, idx: usize) -> f64 {
        self.biomass.iter().map(|b| b[idx]).sum()
    }

    /// Number of fluid voxels.
    pub fn fluid_count(&self) -> usize {
        self.mask.iter().filter(|c| c.is_fluid()).count()
    }
}

/// Maximum over a field (rayon reduction).
pub fn reduce_max(field: &[f64]) -> f64 {
    field
        .par_iter()
        .copied()
        .reduce(|| f64::NEG_INFINITY, f64::max)
}

/// Sum over a field (rayon reduction).
pub fn reduce_sum(field: &[f64]) -> f64 {
    field.par_iter().sum()
}

/// Index of the first non-finite entry, if any.
pub fn find_non_finite(field: &[f64]) -> Option<usize> {
    field.iter().position(|v| !v.is_finite())
}
