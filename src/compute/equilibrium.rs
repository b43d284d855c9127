//! Instantaneous aqueous speciation.
//!
//! Tableau formulation: every dissolved species is a row of the
//! stoichiometry matrix over the chosen components, with its mass-action
//! log-constant; component species themselves are identity rows with
//! logK = 0. Given per-voxel component totals, the solver finds component
//! activities such that every mass balance closes, iterating the
//! positive-continued-fraction map in log space with optional Anderson
//! acceleration.

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use super::state::State;

/// The speciation problem: stoichiometry, constants and solver knobs.
#[derive(Debug, Clone)]
pub struct EquilibriumSystem {
    /// Component names, defining column order.
    pub components: Vec<String>,
    /// Row-major stoichiometry, one row per species, one column per component.
    pub stoich: Vec<Vec<f64>>,
    /// log10 formation constant per species.
    pub log_k: Vec<f64>,
    pub max_iter: usize,
    pub tolerance: f64,
    /// Anderson history depth; 0 runs the plain fixed point.
    pub depth: usize,
}

/// Per-voxel solve failure: the voxel is left untouched and counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotConverged;

/// Largest log10 move of one component per sweep; keeps the early
/// iterations from overshooting when the initial guess is decades off.
const MAX_LOG_STEP: f64 = 2.0;

impl EquilibriumSystem {
    pub fn n_components(&self) -> usize {
        self.components.len()
    }

    pub fn n_species(&self) -> usize {
        self.log_k.len()
    }

    /// Component totals implied by a species concentration vector.
    pub fn totals(&self, conc: &[f64]) -> Vec<f64> {
        let nc = self.n_components();
        let mut t = vec![0.0; nc];
        for (i, row) in self.stoich.iter().enumerate() {
            for j in 0..nc {
                t[j] += row[j] * conc[i];
            }
        }
        t
    }

    /// Species concentrations at component log-activities `omega`.
    fn speciate(&self, omega: &[f64], conc: &mut [f64]) {
        for (i, row) in self.stoich.iter().enumerate() {
            let mut lg = self.log_k[i];
            for (j, &nu) in row.iter().enumerate() {
                lg += nu * omega[j];
            }
            conc[i] = 10f64.powf(lg);
        }
    }

    /// One PCF pass: `g` receives the updated log-activities.
    fn pcf_step(&self, omega: &[f64], conc: &[f64], totals: &[f64], g: &mut [f64]) {
        let nc = self.n_components();
        for j in 0..nc {
            let mut pos = 0.0;
            let mut neg = 0.0;
            let mut mu_min = f64::INFINITY;
            for (i, row) in self.stoich.iter().enumerate() {
                let nu = row[j];
                if nu > 0.0 {
                    pos += nu * conc[i];
                    mu_min = mu_min.min(nu);
                } else if nu < 0.0 {
                    neg += -nu * conc[i];
                    mu_min = mu_min.min(-nu);
                }
            }
            let num = totals[j] + neg;
            g[j] = omega[j];
            if num > 0.0 && pos > 0.0 && mu_min.is_finite() {
                let step = ((num / pos).log10() / mu_min).clamp(-MAX_LOG_STEP, MAX_LOG_STEP);
                g[j] += step;
            }
        }
    }

    /// Log-activity start point: the component species' own concentrations
    /// when the input carries a previous solution, the totals otherwise.
    fn initial_guess(&self, conc: &[f64], totals: &[f64]) -> Vec<f64> {
        let nc = self.n_components();
        let mut omega = vec![f64::NAN; nc];
        for (i, row) in self.stoich.iter().enumerate() {
            if self.log_k[i] != 0.0 {
                continue;
            }
            let nonzero: Vec<usize> = (0..nc).filter(|&j| row[j] != 0.0).collect();
            if nonzero.len() == 1 {
                let j = nonzero[0];
                if row[j] == 1.0 && conc[i] > 0.0 {
                    omega[j] = conc[i].log10();
                }
            }
        }
        for j in 0..nc {
            if !omega[j].is_finite() {
                omega[j] = totals[j].abs().max(1e-10).log10();
            }
        }
        omega
    }

    /// Solve one voxel. `conc` holds the current species concentrations on
    /// entry and the speciated result on success.
    ///
    /// Returns the number of iterations used. An input already at
    /// equilibrium returns without taking a step.
    pub fn solve(&self, totals: &[f64], conc: &mut [f64]) -> Result<usize, NotConverged> {
        let mut omega = self.initial_guess(conc, totals);

        let mut g = vec![0.0; self.n_components()];
        let mut xs: Vec<Vec<f64>> = Vec::new();
        let mut gs: Vec<Vec<f64>> = Vec::new();
        let mut trial = vec![0.0; self.n_species()];

        for it in 0..self.max_iter {
            self.speciate(&omega, &mut trial);
            let calc = self.totals(&trial);
            let residual = calc
                .iter()
                .zip(totals.iter())
                .map(|(c, t)| (c - t).abs())
                .fold(0.0f64, f64::max);
            if residual < self.tolerance {
                conc.copy_from_slice(&trial);
                return Ok(it);
            }

            self.pcf_step(&omega, &trial, totals, &mut g);

            xs.push(omega.clone());
            gs.push(g.clone());
            if xs.len() > self.depth + 1 {
                xs.remove(0);
                gs.remove(0);
            }

            omega = anderson_mix(&xs, &gs).unwrap_or_else(|| g.clone());
        }
        Err(NotConverged)
    }
}

/// Anderson type-II mixing over the stored history.
///
/// With fewer than two history pairs (or depth 0 setups, which keep the
/// history at length one) this returns `None` and the caller falls back to
/// the plain fixed-point iterate.
fn anderson_mix(xs: &[Vec<f64>], gs: &[Vec<f64>]) -> Option<Vec<f64>> {
    let m = xs.len().checked_sub(1)?;
    if m == 0 {
        return None;
    }
    let n = xs[0].len();

    // Residuals r_l = g_l - x_l.
    let res: Vec<Vec<f64>> = xs
        .iter()
        .zip(gs.iter())
        .map(|(x, g)| x.iter().zip(g.iter()).map(|(a, b)| b - a).collect())
        .collect();

    let dr = DMatrix::from_fn(n, m, |r, l| res[l + 1][r] - res[l][r]);
    let rhs = DVector::from_fn(n, |r, _| res[m][r]);
    let gamma = dr.svd(true, true).solve(&rhs, 1e-12).ok()?;

    let mut next = gs[m].clone();
    for l in 0..m {
        let c = gamma[l];
        for r in 0..n {
            next[r] -= c * (gs[l + 1][r] - gs[l][r]);
        }
    }
    // A wild extrapolation means the least-squares system was degenerate;
    // the plain step is safer.
    if next.iter().any(|v| !v.is_finite()) {
        return None;
    }
    Some(next)
}

/// Sweep outcome for one equilibrium pass over the domain.
#[derive(Debug, Clone, Copy, Default)]
pub struct EquilibriumReport {
    pub solved: u64,
    pub failed: u64,
}

/// Applies the speciation solve voxel-by-voxel across the domain.
pub struct EquilibriumStage {
    pub system: EquilibriumSystem,
    /// Voxel-major concentration deltas produced by the last sweep.
    scratch: Vec<f64>,
    /// 1 where the voxel solve failed and was left untouched.
    failed: Vec<u8>,
    /// Running total of per-voxel failures over the whole run.
    pub total_failures: u64,
}

impl EquilibriumStage {
    pub fn new(system: EquilibriumSystem, n_voxels: usize) -> Self {
        let ns = system.n_species();
        Self {
            system,
            scratch: vec![0.0; n_voxels * ns],
            failed: vec![0; n_voxels],
            total_failures: 0,
        }
    }

    /// Re-speciate every fluid voxel; failed voxels keep their previous
    /// concentrations (soft failure).
    pub fn run(&mut self, state: &mut State) -> EquilibriumReport {
        let ns = self.system.n_species();
        debug_assert!(ns <= state.species.len());
        let mask = &state.mask;
        let species = &state.species;
        let system = &self.system;

        self.scratch
            .par_chunks_mut(ns)
            .zip(self.failed.par_iter_mut())
            .enumerate()
            .for_each(|(idx, (delta, flag))| {
                delta.fill(0.0);
                *flag = 0;
                if !mask[idx].is_fluid() {
                    return;
                }
                let mut conc: Vec<f64> = (0..ns).map(|s| species[s].conc[idx].max(0.0)).collect();
                let totals = system.totals(&conc);
                match system.solve(&totals, &mut conc) {
                    Ok(_) => {
                        for s in 0..ns {
                            delta[s] = conc[s] - species[s].conc[idx];
                        }
                    }
                    Err(NotConverged) => *flag = 1,
                }
            });

        let scratch = &self.scratch;
        for (s, lat) in state.species.iter_mut().enumerate().take(ns) {
            let g = &mut lat.g;
            let conc = &mut lat.conc;
            g.par_chunks_mut(super::stencil::Q7)
                .zip(conc.par_iter_mut())
                .enumerate()
                .for_each(|(idx, (gs, c))| {
                    let d = scratch[idx * ns + s];
                    if d != 0.0 {
                        for q in 0..super::stencil::Q7 {
                            gs[q] += super::stencil::W7[q] * d;
                        }
                        *c += d;
                    }
                });
        }

        let failed: u64 = self.failed.iter().map(|&f| f as u64).sum();
        let solved = self.failed.len() as u64 - failed;
        self.total_failures += failed;
        EquilibriumReport { solved, failed }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Carbonate system over components (CO2*, H+): CO2, H+ as identity
    /// rows, HCO3- and CO3-- as mass-action rows.
    fn carbonate() -> EquilibriumSystem {
        EquilibriumSystem {
            components: vec!["CO2".into(), "H".into()],
            stoich: vec![
                vec![1.0, 0.0],
                vec![0.0, 1.0],
                vec![1.0, -1.0],
                vec![1.0, -2.0],
            ],
            log_k: vec![0.0, 0.0, -6.35, -16.68],
            max_iter: 200,
            tolerance: 1e-10,
            depth: 4,
        }
    }

    #[test]
    fn test_carbonate_speciation_closes_mass_action() {
        let sys = carbonate();
        let mut conc = vec![1e-3, 1e-7, 0.0, 0.0];
        let totals = sys.totals(&conc);
        let iters = sys.solve(&totals, &mut conc).expect("carbonate must converge");
        assert!(iters < 200);

        // All concentrations positive.
        for (i, &c) in conc.iter().enumerate() {
            assert!(c > 0.0, "species {} non-positive: {}", i, c);
        }

        // Mass-action residuals in log space.
        let co2 = conc[0];
        let h = conc[1];
        let hco3 = conc[2];
        let co3 = conc[3];
        assert!(
            ((hco3 * h / co2).log10() + 6.35).abs() < 1e-6,
            "first dissociation violated"
        );
        assert!(
            ((co3 * h * h / co2).log10() + 16.68).abs() < 1e-6,
            "second dissociation violated"
        );

        // Carbon is conserved.
        let carbon = co2 + hco3 + co3;
        assert!(
            (carbon - totals[0]).abs() < 1e-8,
            "carbon total drifted: {} vs {}",
            carbon,
            totals[0]
        );
    }

    #[test]
    fn test_solver_is_idempotent() {
        let sys = carbonate();
        let mut conc = vec![1e-3, 1e-7, 0.0, 0.0];
        let totals = sys.totals(&conc);
        sys.solve(&totals, &mut conc).unwrap();

        // Feeding the solution back in converges without taking a step.
        let totals2 = sys.totals(&conc);
        let mut conc2 = conc.clone();
        let iters = sys.solve(&totals2, &mut conc2).unwrap();
        assert!(iters <= 1, "re-solve took {} iterations", iters);
        for (a, b) in conc.iter().zip(conc2.iter()) {
            assert!((a - b).abs() <= 1e-12 * a.abs().max(1e-12));
        }
    }

    #[test]
    fn test_plain_pcf_matches_accelerated() {
        let mut plain = carbonate();
        plain.depth = 0;
        let accel = carbonate();

        let seed = vec![5e-4, 1e-6, 1e-5, 0.0];
        let totals = plain.totals(&seed);

        let mut c1 = seed.clone();
        plain.solve(&totals, &mut c1).expect("plain PCF converges");
        let mut c2 = seed;
        accel.solve(&totals, &mut c2).expect("accelerated converges");

        for (a, b) in c1.iter().zip(c2.iter()) {
            assert!(
                (a - b).abs() <= 1e-7 * a.abs().max(1e-10),
                "depth 0 and depth 4 disagree: {} vs {}",
                a,
                b
            );
        }
    }

    #[test]
    fn test_stage_respeciates_whole_domain() {
        use crate::compute::grid::{Grid, VoxelClass};
        use crate::compute::state::State;

        let grid = Grid::new(2, 2, 2, 1.0);
        let mut mask = vec![VoxelClass::Pore; grid.len()];
        mask[0] = VoxelClass::Solid;
        let mut state = State::new(grid, mask.clone(), vec![0; grid.len()], 4, 0);
        for idx in 0..grid.len() {
            if mask[idx].is_fluid() {
                state.species[0].set_equilibrium(idx, 1e-3, 0.0, 0.0, 0.0);
                state.species[1].set_equilibrium(idx, 1e-7, 0.0, 0.0, 0.0);
            }
        }

        let mut stage = EquilibriumStage::new(carbonate(), grid.len());
        let report = stage.run(&mut state);
        assert_eq!(report.failed, 0, "speciation failed somewhere");

        for idx in 0..grid.len() {
            if !mask[idx].is_fluid() {
                continue;
            }
            let co2 = state.species[0].conc[idx];
            let h = state.species[1].conc[idx];
            let hco3 = state.species[2].conc[idx];
            let co3 = state.species[3].conc[idx];
            assert!(
                ((hco3 * h / co2).log10() + 6.35).abs() < 1e-6,
                "mass action open at voxel {}",
                idx
            );
            let carbon = co2 + hco3 + co3;
            assert!(
                (carbon - 1e-3).abs() < 1e-8,
                "carbon total drifted to {} at voxel {}",
                carbon,
                idx
            );
        }

        // A second sweep finds everything already speciated.
        let before = state.species[1].conc.clone();
        let report = stage.run(&mut state);
        assert_eq!(report.failed, 0);
        for (idx, (&a, &b)) in before.iter().zip(state.species[1].conc.iter()).enumerate() {
            assert!(
                (a - b).abs() <= 1e-10 * a.abs().max(1e-12),
                "re-sweep moved voxel {}: {} -> {}",
                idx,
                a,
                b
            );
        }
    }

    #[test]
    fn test_identity_system_returns_input() {
        // One component, one species, logK = 0: speciation is the identity.
        let sys = EquilibriumSystem {
            components: vec!["A".into()],
            stoich: vec![vec![1.0]],
            log_k: vec![0.0],
            max_iter: 50,
            tolerance: 1e-12,
            depth: 2,
        };
        let mut conc = vec![2.5e-4];
        let totals = sys.totals(&conc);
        sys.solve(&totals, &mut conc).unwrap();
        assert!((conc[0] - 2.5e-4).abs() < 1e-12);
    }
}
