//! Per-voxel reaction kinetics.
//!
//! The rate law is the only externally supplied code in the engine: a pure
//! function from local concentrations and biomass to rates. The operator
//! sweeps fluid voxels, applies the non-negativity clamp, accumulates
//! deltas, and later folds them into the lattices in one apply step.

use rayon::prelude::*;

use super::grid::VoxelClass;
use super::state::{ScalarLattice, State};

/// User-facing reaction kinetics.
///
/// Implementations must be pure: no I/O, no interior mutability, rates
/// fully determined by the arguments. Outputs are rates per unit time;
/// `growth` and `decay` are split so the clamp can rescale uptake-coupled
/// growth without touching first-order decay.
pub trait RateLaw: Send + Sync {
    /// Evaluate rates at one voxel.
    ///
    /// # Arguments
    /// * `conc` - concentration of every dissolved species
    /// * `biomass` - density of every microbe
    /// * `class` - the voxel's current classification
    /// * `rc` - out: concentration rate per species (negative = consumption)
    /// * `growth` - out: biomass production rate per microbe (>= 0)
    /// * `decay` - out: biomass loss rate per microbe (>= 0)
    fn rates(
        &self,
        conc: &[f64],
        biomass: &[f64],
        class: VoxelClass,
        rc: &mut [f64],
        growth: &mut [f64],
        decay: &mut [f64],
    );
}

/// Monod parameters for one microbe.
#[derive(Debug, Clone)]
pub struct MonodParams {
    /// Maximum specific growth rate, 1/s.
    pub mu_max: f64,
    /// Biomass produced per unit substrate consumed.
    pub yield_coeff: f64,
    /// First-order decay rate, 1/s.
    pub k_decay: f64,
    /// Half-saturation constant per species; zero disables the species as
    /// a growth substrate.
    pub half_saturation: Vec<f64>,
    /// Uptake flux weight per species.
    pub uptake: Vec<f64>,
    /// False for microbes configured without a reaction term.
    pub active: bool,
}

/// Multi-substrate multiplicative Monod kinetics.
pub struct MonodLaw {
    pub microbes: Vec<MonodParams>,
}

impl RateLaw for MonodLaw {
    fn rates(
        &self,
        conc: &[f64],
        biomass: &[f64],
        _class: VoxelClass,
        rc: &mut [f64],
        growth: &mut [f64],
        decay: &mut [f64],
    ) {
        for (m, p) in self.microbes.iter().enumerate() {
            let b = biomass[m];
            if !p.active || b <= 0.0 {
                continue;
            }
            let mut mu = p.mu_max;
            for (s, &ks) in p.half_saturation.iter().enumerate() {
                if ks > 0.0 {
                    let c = conc[s].max(0.0);
                    mu *= c / (ks + c);
                }
            }
            let g = mu * b;
            growth[m] += g;
            decay[m] += p.k_decay * b;
            if p.yield_coeff > 0.0 {
                for (s, &w) in p.uptake.iter().enumerate() {
                    rc[s] -= w * g / p.yield_coeff;
                }
            }
        }
    }
}

/// Sweeps the rate law over fluid voxels and manages the delta buffers.
pub struct KineticsOperator {
    law: Box<dyn RateLaw>,
    /// Largest fraction of a species a single step may consume.
    f_max: f64,
    /// Voxel-major rate scratch: `n_species` entries per voxel, times dt.
    rc: Vec<f64>,
    /// Voxel-major biomass delta scratch: `n_microbes` entries per voxel.
    rb: Vec<f64>,
    n_species: usize,
    n_microbes: usize,
}

impl KineticsOperator {
    pub fn new(law: Box<dyn RateLaw>, f_max: f64, n_voxels: usize, n_species: usize, n_microbes: usize) -> Self {
        Self {
            law,
            f_max,
            rc: vec![0.0; n_voxels * n_species],
            rb: vec![0.0; n_voxels * n_microbes],
            n_species,
            n_microbes,
        }
    }

    /// Evaluate and clamp rates at every fluid voxel, writing the results
    /// into the per-field delta buffers.
    pub fn sweep(&mut self, state: &mut State, dt: f64) {
        let ns = self.n_species;
        let nm = self.n_microbes;
        let mask = &state.mask;
        let species = &state.species;
        let biomass = &state.biomass;
        let law = &*self.law;
        let f_max = self.f_max;

        // Per-voxel evaluation into voxel-major scratch.
        self.rc
            .par_chunks_mut(ns.max(1))
            .zip(self.rb.par_chunks_mut(nm.max(1)))
            .enumerate()
            .for_each_init(
                || (vec![0.0; ns], vec![0.0; nm], vec![0.0; nm], vec![0.0; ns], vec![0.0; nm]),
                |(rc, growth, decay, conc, bio), (idx, (rc_out, rb_out))| {
                    rc_out.fill(0.0);
                    rb_out.fill(0.0);
                    let class = mask[idx];
                    if !class.is_fluid() {
                        return;
                    }
                    for s in 0..ns {
                        conc[s] = species[s].conc[idx];
                    }
                    for m in 0..nm {
                        bio[m] = biomass[m][idx];
                    }
                    rc.fill(0.0);
                    growth.fill(0.0);
                    decay.fill(0.0);
                    law.rates(conc, bio, class, rc, growth, decay);

                    // Clamp: no species may lose more than f_max of itself
                    // in one step. Growth scales with the actual uptake.
                    let mut lambda = 1.0f64;
                    for s in 0..ns {
                        if rc[s] < 0.0 {
                            let allowed = f_max * conc[s].max(0.0) / dt;
                            if -rc[s] > allowed {
                                lambda = lambda.min(allowed / -rc[s]);
                            }
                        }
                    }
                    for s in 0..ns {
                        let scaled = if rc[s] < 0.0 { rc[s] * lambda } else { rc[s] };
                        rc_out[s] = scaled * dt;
                    }
                    for m in 0..nm {
                        let mut db = (growth[m] * lambda - decay[m]) * dt;
                        // Decay may not drive biomass negative.
                        if db < -bio[m] {
                            db = -bio[m];
                        }
                        rb_out[m] = db;
                    }
                },
            );

        // Transpose into the per-field delta buffers.
        let rc = &self.rc;
        for (s, lat) in state.species.iter_mut().enumerate() {
            lat.delta
                .par_iter_mut()
                .enumerate()
                .for_each(|(idx, d)| *d += rc[idx * ns + s]);
        }
        let rb = &self.rb;
        for (m, delta) in state.biomass_delta.iter_mut().enumerate() {
            delta
                .par_iter_mut()
                .enumerate()
                .for_each(|(idx, d)| *d += rb[idx * nm + m]);
        }
    }

    /// Fold every delta buffer into its field and zero it.
    pub fn apply(&self, state: &mut State) {
        for lat in state.species.iter_mut() {
            apply_scalar_delta(lat);
        }
        let nm = state.biomass.len();
        for m in 0..nm {
            if let Some(lat) = state.biomass_lattices[m].as_mut() {
                // Mobile biomass lives on a lattice; inject and mirror.
                let delta = &mut state.biomass_delta[m];
                for idx in 0..delta.len() {
                    if delta[idx] != 0.0 {
                        lat.inject(idx, delta[idx]);
                    }
                }
                let density = &mut state.biomass[m];
                density.copy_from_slice(&lat.conc);
                delta.fill(0.0);
            } else {
                let delta = &mut state.biomass_delta[m];
                let density = &mut state.biomass[m];
                density
                    .par_iter_mut()
                    .zip(delta.par_iter_mut())
                    .for_each(|(b, d)| {
                        *b += *d;
                        *d = 0.0;
                    });
            }
        }
    }
}

fn apply_scalar_delta(lat: &mut ScalarLattice) {
    let delta = &mut lat.delta;
    let g = &mut lat.g;
    let conc = &mut lat.conc;
    g.par_chunks_mut(super::stencil::Q7)
        .zip(conc.par_iter_mut())
        .zip(delta.par_iter_mut())
        .for_each(|((gs, c), d)| {
            if *d != 0.0 {
                for q in 0..super::stencil::Q7 {
                    gs[q] += super::stencil::W7[q] * *d;
                }
                *c += *d;
                *d = 0.0;
            }
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::grid::Grid;

    fn single_voxel_state(c0: f64, b0: f64) -> State {
        let grid = Grid::new(1, 1, 1, 1.0);
        let mask = vec![VoxelClass::Biofilm(0)];
        let mut state = State::new(grid, mask.clone(), vec![0], 1, 1);
        state.species[0] = ScalarLattice::uniform(&grid, &mask, c0);
        state.biomass[0][0] = b0;
        state
    }

    fn monod(mu_max: f64, ks: f64, y: f64, kd: f64) -> Box<MonodLaw> {
        Box::new(MonodLaw {
            microbes: vec![MonodParams {
                mu_max,
                yield_coeff: y,
                k_decay: kd,
                half_saturation: vec![ks],
                uptake: vec![1.0],
                active: true,
            }],
        })
    }

    #[test]
    fn test_monod_mass_balance() {
        // Closed single voxel: dC * Y + dB stays within 5% of dB while the
        // clamp is inactive.
        let mut state = single_voxel_state(1e-2, 1.0);
        let y = 0.4;
        let mut op = KineticsOperator::new(monod(1e-4, 1e-5, y, 0.0), 0.5, 1, 1, 1);
        let dt = 1.0;
        for _ in 0..100 {
            let c_before = state.species[0].conc[0];
            let b_before = state.biomass[0][0];
            op.sweep(&mut state, dt);
            op.apply(&mut state);
            let dc = state.species[0].conc[0] - c_before;
            let db = state.biomass[0][0] - b_before;
            if db.abs() > 0.0 {
                assert!(
                    (dc * y + db).abs() <= 0.05 * db.abs() + 1e-18,
                    "mass balance broken: dc = {:e}, db = {:e}",
                    dc,
                    db
                );
            }
        }
    }

    #[test]
    fn test_clamp_prevents_negative_concentration() {
        // Enormous uptake with almost no substrate: the clamp must keep the
        // concentration positive and shrink growth in proportion.
        let mut state = single_voxel_state(1e-8, 50.0);
        let mut op = KineticsOperator::new(monod(10.0, 1e-12, 0.4, 0.0), 0.5, 1, 1, 1);
        for _ in 0..50 {
            op.sweep(&mut state, 1.0);
            op.apply(&mut state);
            let c = state.species[0].conc[0];
            assert!(c >= 0.0, "clamp failed, concentration {}", c);
        }
        // Half of the substrate survives each step, so some must remain.
        assert!(state.species[0].conc[0] > 0.0);
    }

    #[test]
    fn test_decay_floors_at_zero_biomass() {
        let mut state = single_voxel_state(0.0, 1e-9);
        // Decay rate large enough to wipe the biomass in one step.
        let mut op = KineticsOperator::new(monod(0.0, 1e-5, 0.4, 10.0), 0.5, 1, 1, 1);
        op.sweep(&mut state, 1.0);
        op.apply(&mut state);
        assert!(
            state.biomass[0][0] >= 0.0,
            "decay drove biomass negative: {}",
            state.biomass[0][0]
        );
    }

    #[test]
    fn test_inactive_microbe_produces_no_rates() {
        let mut state = single_voxel_state(1.0, 1.0);
        let mut law = monod(1e-2, 1e-3, 0.4, 1e-3);
        law.microbes[0].active = false;
        let mut op = KineticsOperator::new(law, 0.5, 1, 1, 1);
        op.sweep(&mut state, 1.0);
        op.apply(&mut state);
        assert_eq!(state.species[0].conc[0], 1.0);
        assert_eq!(state.biomass[0][0], 1.0);
    }

    #[test]
    fn test_growth_consumes_substrate() {
        let mut state = single_voxel_state(1e-2, 1.0);
        let mut op = KineticsOperator::new(monod(1e-4, 1e-5, 0.4, 1e-7), 0.5, 1, 1, 1);
        for _ in 0..10 {
            op.sweep(&mut state, 1.0);
            op.apply(&mut state);
        }
        assert!(state.species[0].conc[0] < 1e-2, "substrate not consumed");
        assert!(state.biomass[0][0] > 1.0, "biomass did not grow");
    }
}
