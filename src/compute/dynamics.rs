//! Mask and per-voxel dynamics reconciliation.
//!
//! The single writer of the mask after setup. When spreading (or growth)
//! moves a voxel across the biofilm threshold, this component reclassifies
//! it, reinstalls every lattice's per-voxel relaxation, rebuilds the
//! distance field and re-converges the flow. Two consecutive flow failures
//! are read as a percolation collapse: flow freezes and transport carries
//! on by diffusion alone.

use super::SimulationError;
use super::distance::rebuild_distance;
use super::flow::FlowSolver;
use super::grid::VoxelClass;
use super::state::State;

/// Relaxation frequencies derived once from the configuration.
#[derive(Debug, Clone)]
pub struct RelaxationTable {
    /// Flow relaxation in open pore.
    pub omega_ns_pore: f64,
    /// Flow relaxation inside each microbe's biofilm.
    pub omega_ns_bio: Vec<f64>,
    /// Species relaxation in open pore, one per species.
    pub omega_ade_pore: Vec<f64>,
    /// Species relaxation in biofilm, one per species.
    pub omega_ade_bio: Vec<f64>,
    /// Mobile-biomass relaxation in open pore, one per microbe.
    pub omega_bio_pore: Vec<f64>,
    /// Mobile-biomass relaxation in biofilm, one per microbe.
    pub omega_bio_bio: Vec<f64>,
}

/// Write every lattice's per-voxel relaxation from the mask.
pub fn install_dynamics(state: &mut State, table: &RelaxationTable) {
    let n = state.grid.len();
    for idx in 0..n {
        let class = state.mask[idx];
        state.omega_ns[idx] = match class {
            VoxelClass::Pore => table.omega_ns_pore,
            VoxelClass::Biofilm(m) => table.omega_ns_bio[m],
            _ => 0.0,
        };
        for (s, lat) in state.species.iter_mut().enumerate() {
            lat.omega[idx] = match class {
                VoxelClass::Pore => table.omega_ade_pore[s],
                VoxelClass::Biofilm(_) => table.omega_ade_bio[s],
                _ => 0.0,
            };
        }
        for (m, lat) in state.biomass_lattices.iter_mut().enumerate() {
            if let Some(lat) = lat {
                lat.omega[idx] = match class {
                    VoxelClass::Pore => table.omega_bio_pore[m],
                    VoxelClass::Biofilm(_) => table.omega_bio_bio[m],
                    _ => 0.0,
                };
            }
        }
    }
}

pub struct DynamicsUpdater {
    pub table: RelaxationTable,
    /// Biofilm threshold as a fraction of the carrying capacity.
    phi_b: f64,
    b_max: f64,
    sessile: Vec<bool>,
    /// Flow iteration cap for post-update re-convergence.
    flow_cap: u32,
    consecutive_flow_failures: u32,
    /// Set once a percolation collapse has been declared.
    pub flow_frozen: bool,
    /// Completed reconciliation passes.
    pub geometry_updates: u64,
}

impl DynamicsUpdater {
    pub fn new(
        table: RelaxationTable,
        phi_b: f64,
        b_max: f64,
        sessile: Vec<bool>,
        flow_cap: u32,
    ) -> Self {
        Self {
            table,
            phi_b,
            b_max,
            sessile,
            flow_cap,
            consecutive_flow_failures: 0,
            flow_frozen: false,
            geometry_updates: 0,
        }
    }

    /// Reclassify pore/biofilm voxels from the biomass threshold.
    ///
    /// Returns the number of voxels that changed class.
    pub fn update_mask(&self, state: &mut State) -> usize {
        if self.b_max <= 0.0 || !self.sessile.iter().any(|&s| s) {
            return 0;
        }
        let threshold = self.phi_b * self.b_max;
        let mut changed = 0usize;
        for idx in 0..state.grid.len() {
            let class = state.mask[idx];
            if class.is_wall() {
                continue;
            }
            // Dominant sessile microbe decides the biofilm identity.
            let mut b_tot = 0.0;
            let mut dominant = 0usize;
            let mut dominant_b = f64::NEG_INFINITY;
            for (m, field) in state.biomass.iter().enumerate() {
                if !self.sessile[m] {
                    continue;
                }
                b_tot += field[idx];
                if field[idx] > dominant_b {
                    dominant_b = field[idx];
                    dominant = m;
                }
            }
            let target = if b_tot >= threshold {
                VoxelClass::Biofilm(dominant)
            } else {
                VoxelClass::Pore
            };
            if target != class {
                state.mask[idx] = target;
                state.age[idx] = 0;
                changed += 1;
            }
        }
        changed
    }

    /// Full reconciliation after a geometry-change signal.
    ///
    /// `flow` is absent for diffusion-only runs (no pressure drop).
    pub fn reconcile(
        &mut self,
        state: &mut State,
        flow: Option<&mut FlowSolver>,
    ) -> Result<(), SimulationError> {
        let changed = self.update_mask(state);
        install_dynamics(state, &self.table);
        rebuild_distance(&state.grid, &state.mask, &mut state.distance)?;
        self.geometry_updates += 1;

        if changed > 0 {
            log::info!("geometry update: {} voxels reclassified", changed);
        }

        if self.flow_frozen {
            state.zero_velocity();
            return Ok(());
        }

        if let Some(flow) = flow {
            let run = flow.run_to_convergence(state, self.flow_cap);
            if run.converged {
                self.consecutive_flow_failures = 0;
            } else {
                self.consecutive_flow_failures += 1;
                log::warn!(
                    "flow failed to re-converge within {} iterations ({} in a row)",
                    self.flow_cap,
                    self.consecutive_flow_failures
                );
                if self.consecutive_flow_failures >= 2 {
                    log::warn!(
                        "percolation collapse: freezing flow, transport continues diffusion-only"
                    );
                    self.flow_frozen = true;
                    state.zero_velocity();
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::grid::Grid;
    use crate::compute::state::ScalarLattice;

    fn table(n_species: usize, n_microbes: usize) -> RelaxationTable {
        RelaxationTable {
            omega_ns_pore: 1.0,
            omega_ns_bio: vec![0.4; n_microbes],
            omega_ade_pore: vec![1.2; n_species],
            omega_ade_bio: vec![0.7; n_species],
            omega_bio_pore: vec![1.1; n_microbes],
            omega_bio_bio: vec![0.6; n_microbes],
        }
    }

    fn state_with_biomass(b: f64) -> State {
        let grid = Grid::new(3, 3, 3, 1.0);
        let mask = vec![VoxelClass::Pore; grid.len()];
        let mut state = State::new(grid, mask, vec![0; grid.len()], 1, 1);
        state.biomass[0][grid.idx(1, 1, 1)] = b;
        state
    }

    #[test]
    fn test_threshold_promotes_and_reverts() {
        let mut state = state_with_biomass(60.0);
        let updater = DynamicsUpdater::new(table(1, 1), 0.5, 100.0, vec![true], 100);

        let changed = updater.update_mask(&mut state);
        assert_eq!(changed, 1);
        let idx = state.grid.idx(1, 1, 1);
        assert_eq!(state.mask[idx], VoxelClass::Biofilm(0));

        // Biomass recedes below the threshold: the voxel reverts.
        state.biomass[0][idx] = 10.0;
        let changed = updater.update_mask(&mut state);
        assert_eq!(changed, 1);
        assert_eq!(state.mask[idx], VoxelClass::Pore);
    }

    #[test]
    fn test_installed_relaxations_match_mask() {
        let mut state = state_with_biomass(60.0);
        state.biomass_lattices[0] = Some(ScalarLattice::uniform(
            &state.grid,
            &state.mask,
            0.0,
        ));
        let mut updater = DynamicsUpdater::new(table(1, 1), 0.5, 100.0, vec![true], 100);
        updater.reconcile(&mut state, None).unwrap();

        let t = table(1, 1);
        for idx in 0..state.grid.len() {
            let (expect_ns, expect_ade, expect_bio) = match state.mask[idx] {
                VoxelClass::Pore => (t.omega_ns_pore, t.omega_ade_pore[0], t.omega_bio_pore[0]),
                VoxelClass::Biofilm(m) => {
                    (t.omega_ns_bio[m], t.omega_ade_bio[0], t.omega_bio_bio[0])
                }
                _ => (0.0, 0.0, 0.0),
            };
            assert_eq!(state.omega_ns[idx], expect_ns, "flow omega at {}", idx);
            assert_eq!(state.species[0].omega[idx], expect_ade, "species omega at {}", idx);
            assert_eq!(
                state.biomass_lattices[0].as_ref().unwrap().omega[idx],
                expect_bio,
                "biomass omega at {}",
                idx
            );
        }
    }

    #[test]
    fn test_distance_tracks_new_biofilm() {
        // Biofilm voxels are fluid, not walls: the distance field still
        // measures hops to true solids only.
        let mut state = state_with_biomass(60.0);
        let grid = state.grid;
        state.mask[grid.idx(0, 0, 0)] = VoxelClass::Solid;
        let mut updater = DynamicsUpdater::new(table(1, 1), 0.5, 100.0, vec![true], 100);
        updater.reconcile(&mut state, None).unwrap();
        assert_eq!(state.distance[grid.idx(0, 0, 0)], 0);
        assert_eq!(state.distance[grid.idx(1, 1, 1)], 3);
    }

    #[test]
    fn test_dominant_microbe_wins_classification() {
        let grid = Grid::new(2, 2, 2, 1.0);
        let mask = vec![VoxelClass::Pore; grid.len()];
        let mut state = State::new(grid, mask, vec![0; grid.len()], 0, 2);
        state.biomass[0][0] = 20.0;
        state.biomass[1][0] = 45.0;
        let updater = DynamicsUpdater::new(table(0, 2), 0.5, 100.0, vec![true, true], 100);
        updater.update_mask(&mut state);
        assert_eq!(state.mask[0], VoxelClass::Biofilm(1));
    }
}
