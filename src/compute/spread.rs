//! Biofilm spreading by cellular-automaton overflow redistribution.
//!
//! When total sessile biomass in a voxel exceeds the carrying capacity,
//! the excess is pushed into face neighbours until the field settles.
//! Fraction mode splits the excess evenly over eligible neighbours with a
//! push-then-pull sweep that is independent of voxel visitation order;
//! half mode moves half the excess per pass, preferring neighbours with
//! headroom in seeded-random order, then the neighbour closest to a wall.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;

use super::SimulationError;
use super::distance::rebuild_distance;
use super::grid::VoxelClass;
use super::state::{State, reduce_max};

/// Redistribution rule for overflowing biomass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpreadMode {
    /// Excess split evenly over eligible neighbours, applied push-then-pull.
    Fraction,
    /// Half the excess per pass to a single preferred neighbour.
    Half,
}

/// Spreader parameters.
#[derive(Debug, Clone)]
pub struct SpreadParams {
    pub mode: SpreadMode,
    /// Carrying capacity per voxel.
    pub b_max: f64,
    /// Fraction of `b_max` at which a pore voxel counts as biofilm.
    pub phi_b: f64,
    /// Redistribution pass cap; exceeding it is fatal.
    pub iter_cap: u32,
    /// Seed for the half-mode neighbour shuffle.
    pub seed: u64,
}

/// Result of one spreading invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpreadOutcome {
    /// Redistribution passes taken (0 when nothing overflowed).
    pub passes: u32,
    /// True when the biofilm threshold pattern no longer matches the mask.
    pub geometry_dirty: bool,
}

pub struct Spreader {
    pub params: SpreadParams,
    /// Participation flag per microbe; mobile phases are never spread.
    sessile: Vec<bool>,
    rng: StdRng,
    /// Total sessile biomass per voxel, refreshed each pass.
    b_tot: Vec<f64>,
    /// Per-donor outbound share per neighbour.
    share: Vec<f64>,
    /// Marks donors with no under-cap neighbour, which push into at-cap
    /// fluid neighbours instead so the excess cascades toward open pore.
    relaxed: Vec<bool>,
    /// Times an invocation found overflow to redistribute.
    pub triggers: u64,
    /// Total passes across the run.
    pub passes_total: u64,
}

impl Spreader {
    pub fn new(params: SpreadParams, sessile: Vec<bool>, n_voxels: usize) -> Self {
        let rng = StdRng::seed_from_u64(params.seed);
        Self {
            params,
            sessile,
            rng,
            b_tot: vec![0.0; n_voxels],
            share: vec![0.0; n_voxels],
            relaxed: vec![false; n_voxels],
            triggers: 0,
            passes_total: 0,
        }
    }

    /// Total sessile biomass over the domain (used by conservation audits).
    pub fn total_mass(&self, state: &State) -> f64 {
        self.sessile
            .iter()
            .zip(state.biomass.iter())
            .filter(|(s, _)| **s)
            .map(|(_, b)| b.iter().sum::<f64>())
            .sum()
    }

    fn refresh_b_tot(&mut self, state: &State) {
        self.b_tot.fill(0.0);
        for (m, field) in state.biomass.iter().enumerate() {
            if self.sessile[m] {
                for (t, &b) in self.b_tot.iter_mut().zip(field.iter()) {
                    *t += b;
                }
            }
        }
    }

    /// Redistribute overflow and report whether the mask needs reconciling.
    pub fn run(&mut self, state: &mut State) -> Result<SpreadOutcome, SimulationError> {
        self.refresh_b_tot(state);
        let mut passes = 0u32;
        let mut max = reduce_max(&self.b_tot);

        if max > self.params.b_max {
            self.triggers += 1;
        }

        while max > self.params.b_max {
            if passes >= self.params.iter_cap {
                return Err(SimulationError::SpreaderStuck { passes });
            }
            let progressed = match self.params.mode {
                SpreadMode::Fraction => self.fraction_pass(state),
                SpreadMode::Half => self.half_pass(state),
            };
            passes += 1;
            if !progressed {
                // Every donor is boxed in by walls or exactly-at-cap
                // neighbours; the excess carries over to the next iteration,
                // when growth turns those neighbours into donors themselves.
                log::debug!(
                    "spreading stalled with overflow {:.3e}, carrying excess",
                    max - self.params.b_max
                );
                break;
            }
            if passes % 50 == 0 {
                // Spreading may have pushed biofilm into new voxels.
                rebuild_distance(&state.grid, &state.mask, &mut state.distance)?;
            }
            self.refresh_b_tot(state);
            max = reduce_max(&self.b_tot);
        }

        self.passes_total += passes as u64;
        Ok(SpreadOutcome {
            passes,
            geometry_dirty: self.mask_out_of_date(state),
        })
    }

    /// Even split of each donor's excess over its eligible neighbours.
    ///
    /// Phase 1 stores every donor's per-neighbour, per-microbe share in the
    /// shove buffers; phase 2 lets each receiver pull from donor neighbours
    /// and each donor drop to the cap. No voxel writes anything but itself,
    /// so the sweep parallelizes and the result cannot depend on visitation
    /// order. Returns false when no donor could place any mass.
    fn fraction_pass(&mut self, state: &mut State) -> bool {
        let grid = state.grid;
        let b_max = self.params.b_max;
        let b_tot = &self.b_tot;
        let mask = &state.mask;

        let eligible = |idx: usize| mask[idx].is_fluid() && b_tot[idx] < b_max;
        // Fallback receivers: fluid voxels at (but not above) the cap.
        let at_cap = |idx: usize| mask[idx].is_fluid() && b_tot[idx] <= b_max;

        // Phase 1a: scalar per-neighbour share of each donor.
        self.share
            .par_iter_mut()
            .zip(self.relaxed.par_iter_mut())
            .enumerate()
            .for_each(|(idx, (share, relaxed))| {
                *share = 0.0;
                *relaxed = false;
                if !mask[idx].is_fluid() || b_tot[idx] <= b_max {
                    return;
                }
                let (i, j, k) = grid.coords(idx);
                let neighbours = grid.neighbours_face(i, j, k);
                let n = neighbours.iter().filter(|&&nb| eligible(nb)).count();
                if n > 0 {
                    *share = (b_tot[idx] - b_max) / n as f64;
                    return;
                }
                // No under-cap neighbour: push into at-cap neighbours so
                // they overflow and carry the excess outward next pass.
                let n = neighbours.iter().filter(|&&nb| at_cap(nb)).count();
                if n > 0 {
                    *share = (b_tot[idx] - b_max) / n as f64;
                    *relaxed = true;
                }
            });

        // Phase 1b: split each share by the donor's composition.
        let share = &self.share;
        let biomass = &state.biomass;
        for (m, shove) in state.shove.iter_mut().enumerate() {
            if !self.sessile[m] {
                continue;
            }
            let field = &biomass[m];
            shove.par_iter_mut().enumerate().for_each(|(idx, s)| {
                *s = if share[idx] > 0.0 && b_tot[idx] > 0.0 {
                    share[idx] * field[idx] / b_tot[idx]
                } else {
                    0.0
                };
            });
        }

        // Phase 2: every voxel updates only itself.
        let shove = &state.shove;
        let relaxed = &self.relaxed;
        for (m, field) in state.biomass.iter_mut().enumerate() {
            if !self.sessile[m] {
                continue;
            }
            let shove_m = &shove[m];
            field.par_iter_mut().enumerate().for_each(|(idx, b)| {
                if !mask[idx].is_fluid() {
                    return;
                }
                let (i, j, k) = grid.coords(idx);
                if share[idx] > 0.0 {
                    // Donor: drop to the cap, composition preserved.
                    let n = grid
                        .neighbours_face(i, j, k)
                        .into_iter()
                        .filter(|&nb| {
                            if relaxed[idx] {
                                at_cap(nb)
                            } else {
                                eligible(nb)
                            }
                        })
                        .count();
                    *b -= shove_m[idx] * n as f64;
                } else {
                    // Receiver: pull this microbe's slice of each
                    // neighbouring donor's share.
                    for nb in grid.neighbours_face(i, j, k) {
                        if share[nb] > 0.0 {
                            let takes = if relaxed[nb] {
                                at_cap(idx)
                            } else {
                                eligible(idx)
                            };
                            if takes {
                                *b += shove_m[nb];
                            }
                        }
                    }
                }
            });
        }

        share.iter().any(|&s| s > 0.0)
    }

    /// Half-excess move to a preferred neighbour, sequential under the
    /// configured seed. Returns false when no donor could place any mass.
    fn half_pass(&mut self, state: &mut State) -> bool {
        let grid = state.grid;
        let b_max = self.params.b_max;
        let n_microbes = state.biomass.len();

        // Inbound per voxel per microbe, applied after all donors decided.
        let mut inbound = vec![0.0f64; grid.len() * n_microbes];
        // Headroom consumed so far this pass.
        let mut pending: Vec<f64> = vec![0.0; grid.len()];

        let donors: Vec<usize> = (0..grid.len())
            .filter(|&idx| state.mask[idx].is_fluid() && self.b_tot[idx] > b_max)
            .collect();

        let mut total_sent = 0.0f64;
        for &idx in &donors {
            let excess = self.b_tot[idx] - b_max;
            let mut remaining = 0.5 * excess;
            let (i, j, k) = grid.coords(idx);
            let mut neighbours: Vec<usize> = grid
                .neighbours_face(i, j, k)
                .into_iter()
                .filter(|&nb| state.mask[nb].is_fluid())
                .collect();
            if neighbours.is_empty() {
                continue;
            }
            neighbours.shuffle(&mut self.rng);

            let mut sent = 0.0;
            for &nb in &neighbours {
                let headroom = (b_max - self.b_tot[nb] - pending[nb]).max(0.0);
                if headroom <= 0.0 {
                    continue;
                }
                let give = remaining.min(headroom);
                for m in 0..n_microbes {
                    if self.sessile[m] {
                        inbound[nb * n_microbes + m] +=
                            give * state.biomass[m][idx] / self.b_tot[idx];
                    }
                }
                pending[nb] += give;
                sent += give;
                remaining -= give;
                if remaining <= 0.0 {
                    break;
                }
            }

            if remaining > 0.0 {
                // Everyone is full: shove the rest toward the wall, where
                // the crowd is; ties fall to the shuffled order.
                let target = neighbours
                    .iter()
                    .copied()
                    .min_by_key(|&nb| state.distance[nb])
                    .unwrap();
                for m in 0..n_microbes {
                    if self.sessile[m] {
                        inbound[target * n_microbes + m] +=
                            remaining * state.biomass[m][idx] / self.b_tot[idx];
                    }
                }
                pending[target] += remaining;
                sent += remaining;
            }

            // Donor sheds what it managed to place.
            if sent > 0.0 {
                let scale = sent / self.b_tot[idx];
                for m in 0..n_microbes {
                    if self.sessile[m] {
                        let out = state.biomass[m][idx] * scale;
                        inbound[idx * n_microbes + m] -= out;
                    }
                }
                total_sent += sent;
            }
        }

        for m in 0..n_microbes {
            if !self.sessile[m] {
                continue;
            }
            for idx in 0..grid.len() {
                state.biomass[m][idx] += inbound[idx * n_microbes + m];
            }
        }

        total_sent > 0.0
    }

    /// True when some voxel's biofilm state no longer matches the mask.
    fn mask_out_of_date(&self, state: &State) -> bool {
        let threshold = self.params.phi_b * self.params.b_max;
        for idx in 0..state.grid.len() {
            match state.mask[idx] {
                VoxelClass::Pore => {
                    if self.b_tot[idx] >= threshold {
                        return true;
                    }
                }
                VoxelClass::Biofilm(_) => {
                    if self.b_tot[idx] < threshold {
                        return true;
                    }
                }
                _ => {}
            }
        }
        false
    }
}
