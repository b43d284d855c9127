//! Time-step engine.
//!
//! Owns the per-iteration pipeline: scalar collide, kinetics, equilibrium,
//! biofilm spreading, geometry reconciliation, scalar stream. Flow is
//! converged once at startup (with pressure calibration) and re-converged
//! only when the pore topology changes. Every optional stage is a runtime
//! branch so one binary covers abiotic, kinetics-only and equilibrium-only
//! runs.

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use super::SimulationError;
use super::distance::rebuild_distance;
use super::dynamics::{DynamicsUpdater, RelaxationTable, install_dynamics};
use super::equilibrium::{EquilibriumStage, EquilibriumSystem};
use super::flow::{FlowParams, FlowSolver};
use super::grid::{Grid, VoxelClass};
use super::kinetics::{KineticsOperator, MonodLaw, MonodParams};
use super::spread::{SpreadMode, SpreadParams, Spreader};
use super::state::{ScalarLattice, State, find_non_finite};
use super::stencil::{CS2_ADE, tau_from_diffusivity, viscosity_from_tau};
use super::transport::{Boundary, TransportSolver};
use crate::output::{
    open_domain, read_checkpoint, read_image_stack, read_tag_file, write_checkpoint, write_flow,
    write_mask, write_scalar,
};
use crate::schema::{BoundaryConfig, CaMethod, MicrobeSolver, ReactionKind, SimulationConfig};

/// Wall-clock totals per pipeline stage.
#[derive(Debug, Clone, Default)]
pub struct StageTimers {
    pub collide: Duration,
    pub kinetics: Duration,
    pub equilibrium: Duration,
    pub spread: Duration,
    pub geometry: Duration,
    pub stream: Duration,
    pub output: Duration,
}

/// Closing report of a finished run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub iterations: u64,
    pub simulated_time: f64,
    pub wall_clock: Duration,
    /// Per species: name, min, mean, max over fluid voxels.
    pub species_envelopes: Vec<(String, f64, f64, f64)>,
    pub biomass_initial: f64,
    pub biomass_final: f64,
    pub ca_triggers: u64,
    pub ca_passes: u64,
    pub equilibrium_failures: u64,
    pub geometry_updates: u64,
    pub flow_frozen: bool,
}

impl RunSummary {
    pub fn growth_percent(&self) -> f64 {
        if self.biomass_initial > 0.0 {
            100.0 * (self.biomass_final - self.biomass_initial) / self.biomass_initial
        } else {
            0.0
        }
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "iterations:        {}", self.iterations)?;
        writeln!(f, "simulated time:    {:.6e} s", self.simulated_time)?;
        writeln!(f, "wall clock:        {:.2} s", self.wall_clock.as_secs_f64())?;
        for (name, min, mean, max) in &self.species_envelopes {
            writeln!(
                f,
                "species {:12} min {:.6e}  mean {:.6e}  max {:.6e}",
                name, min, mean, max
            )?;
        }
        if self.biomass_initial > 0.0 {
            writeln!(
                f,
                "biomass:           {:.6e} -> {:.6e} ({:+.2}%)",
                self.biomass_initial,
                self.biomass_final,
                self.growth_percent()
            )?;
        }
        writeln!(f, "spreader triggers: {}", self.ca_triggers)?;
        writeln!(f, "spreader passes:   {}", self.ca_passes)?;
        writeln!(f, "speciation fails:  {}", self.equilibrium_failures)?;
        writeln!(f, "geometry updates:  {}", self.geometry_updates)?;
        if self.flow_frozen {
            writeln!(f, "flow:              frozen (percolation collapse)")?;
        }
        Ok(())
    }
}

/// The coupled simulation.
pub struct Engine {
    pub config: SimulationConfig,
    pub state: State,
    flow: Option<FlowSolver>,
    transport: TransportSolver,
    kinetics: Option<KineticsOperator>,
    equilibrium: Option<EquilibriumStage>,
    spreader: Option<Spreader>,
    dynamics: DynamicsUpdater,
    /// Physical seconds per lattice iteration.
    dt: f64,
    iteration: u64,
    species_bc: Vec<(Boundary, Boundary)>,
    /// Boundary pair per mobile microbe (index-aligned, sessile unused).
    biomass_bc: Vec<(Boundary, Boundary)>,
    biomass_initial: f64,
    pub timers: StageTimers,
}

fn to_boundary(bc: &BoundaryConfig) -> Boundary {
    match bc {
        BoundaryConfig::Dirichlet { value } => Boundary::Dirichlet(*value),
        BoundaryConfig::Neumann { flux } => Boundary::Neumann(*flux),
    }
}

impl Engine {
    /// Build the full engine: geometry, fields, dynamics, converged flow.
    pub fn from_config(config: SimulationConfig) -> Result<Self, SimulationError> {
        config.validate()?;
        let grid = Grid::new(
            config.domain.nx,
            config.domain.ny,
            config.domain.nz,
            config.domain.dx,
        );

        // Geometry.
        let (mask, tags) = if let Some(name) = &config.domain.geometry {
            read_tag_file(&config.paths.input_dir.join(name), &grid, &config.domain.materials)?
        } else if let Some(dir) = &config.domain.image_stack {
            read_image_stack(&config.paths.input_dir.join(dir), &grid, &config.domain.materials)?
        } else {
            open_domain(&grid, &config.domain.materials)
        };

        let microbes = config.microbes().to_vec();
        let n_species = config.n_species();
        let n_microbes = microbes.len();
        let mut state = State::new(grid, mask, tags, n_species, n_microbes);

        // Initial concentrations.
        for (s, sc) in config.chemistry.species.iter().enumerate() {
            state.species[s] = ScalarLattice::uniform(&grid, &state.mask, sc.c0);
        }

        // Initial biomass from material tags.
        for (m, mc) in microbes.iter().enumerate() {
            for td in &mc.initial_density {
                for idx in 0..grid.len() {
                    if state.tags[idx] == td.tag && state.mask[idx].is_fluid() {
                        state.biomass[m][idx] = td.density;
                    }
                }
            }
            if !mc.is_sessile() {
                let mut lat = ScalarLattice::uniform(&grid, &state.mask, 0.0);
                for idx in 0..grid.len() {
                    if state.biomass[m][idx] > 0.0 {
                        lat.set_equilibrium(idx, state.biomass[m][idx], 0.0, 0.0, 0.0);
                    }
                }
                state.biomass_lattices[m] = Some(lat);
            }
        }

        // Time step from the reference species' lattice diffusivity.
        let dx_m = config.dx_metres();
        let d_ref_lat = CS2_ADE * (config.lb.tau_ade - 0.5);
        let dt = if n_species > 0 {
            d_ref_lat * dx_m * dx_m / config.chemistry.species[0].d_pore
        } else {
            1.0
        };

        let to_lattice = |d_phys: f64| d_phys * dt / (dx_m * dx_m);
        let omega_of = |d_phys: f64| {
            if d_phys > 0.0 {
                let tau = tau_from_diffusivity(to_lattice(d_phys));
                if tau <= 0.5 || tau >= 2.0 {
                    log::warn!("scalar relaxation time {:.4} outside (0.5, 2)", tau);
                }
                1.0 / tau
            } else {
                0.0
            }
        };

        let nu_pore = viscosity_from_tau(config.lb.tau);
        let table = RelaxationTable {
            omega_ns_pore: 1.0 / config.lb.tau,
            omega_ns_bio: microbes
                .iter()
                .map(|m| 1.0 / (m.viscosity_ratio * nu_pore / super::stencil::CS2_NS + 0.5))
                .collect(),
            omega_ade_pore: config
                .chemistry
                .species
                .iter()
                .map(|s| omega_of(s.d_pore))
                .collect(),
            omega_ade_bio: config
                .chemistry
                .species
                .iter()
                .map(|s| omega_of(s.d_biofilm()))
                .collect(),
            omega_bio_pore: microbes.iter().map(|m| omega_of(m.d_pore)).collect(),
            omega_bio_bio: microbes.iter().map(|m| omega_of(m.d_biofilm())).collect(),
        };

        let micro = config.microbiology.as_ref();
        let sessile: Vec<bool> = microbes.iter().map(|m| m.is_sessile()).collect();
        let (b_max, phi_b) = micro.map(|m| (m.b_max, m.biofilm_fraction)).unwrap_or((0.0, 1.0));
        let mut dynamics = DynamicsUpdater::new(
            table,
            phi_b,
            b_max,
            sessile.clone(),
            config.lb.ns_max_iter_update,
        );
        // Reconcile biofilm seeded by geometry tags or initial densities
        // before anything converges against the mask.
        dynamics.update_mask(&mut state);
        install_dynamics(&mut state, &dynamics.table);
        rebuild_distance(&state.grid, &state.mask, &mut state.distance)?;

        // Flow setup and initial convergence.
        let d_min_lat = config
            .chemistry
            .species
            .iter()
            .map(|s| to_lattice(s.d_pore.min(s.d_biofilm())))
            .fold(f64::INFINITY, f64::min);
        let mut flow = if config.lb.delta_p != 0.0 {
            let params = FlowParams {
                tau: config.lb.tau,
                delta_p: config.lb.delta_p,
                peclet: config.lb.peclet,
                d_ref: d_ref_lat,
                length: config.characteristic_length_lattice(),
                periodic_y: config.domain.periodic_y,
                periodic_z: config.domain.periodic_z,
                tolerance: config.lb.ns_tolerance,
                check_interval: config.lb.ns_check_interval,
                window: config.lb.ns_window,
            };
            Some(FlowSolver::new(params)?)
        } else {
            None
        };

        let mut engine_iteration = 0u64;
        let mut restored = false;
        if config.io.restart {
            let path = match &config.io.restart_file {
                Some(name) => config.paths.output_dir.join(name),
                None => config.paths.output_dir.join(&config.paths.checkpoint_name),
            };
            let chk = read_checkpoint(&path)?;
            chk.apply_to(&mut state)?;
            engine_iteration = chk.iteration;
            install_dynamics(&mut state, &dynamics.table);
            rebuild_distance(&state.grid, &state.mask, &mut state.distance)?;
            restored = true;
            log::info!("restarted from {} at iteration {}", path.display(), chk.iteration);
        }

        if let Some(flow) = flow.as_mut() {
            if !restored {
                let run = flow.run_to_convergence(&mut state, config.lb.ns_max_iter_initial);
                log::info!(
                    "initial flow: {} iterations, converged = {}",
                    run.iterations,
                    run.converged
                );
                if flow.calibrate_pressure(&state) {
                    let run = flow.run_to_convergence(&mut state, config.lb.ns_max_iter_initial);
                    log::info!(
                        "calibrated flow: {} iterations, converged = {}",
                        run.iterations,
                        run.converged
                    );
                }
            }
            flow.check_stability(&state, d_min_lat)?;
        }

        // Optional stages.
        let kinetics = if config.kinetics_enabled() && n_species > 0 {
            let law = MonodLaw {
                microbes: microbes
                    .iter()
                    .map(|m| MonodParams {
                        mu_max: m.mu_max,
                        yield_coeff: m.yield_coeff,
                        k_decay: m.k_decay,
                        half_saturation: aligned(&m.half_saturation, n_species),
                        uptake: aligned(&m.uptake, n_species),
                        active: m.reaction == ReactionKind::Kinetics,
                    })
                    .collect(),
            };
            let clamp = micro.map(|m| m.clamp_fraction).unwrap_or(0.5);
            Some(KineticsOperator::new(
                Box::new(law),
                clamp,
                grid.len(),
                n_species,
                n_microbes,
            ))
        } else {
            None
        };

        let equilibrium = match (&config.equilibrium, n_species) {
            (Some(eq), ns) if ns > 0 => Some(EquilibriumStage::new(
                EquilibriumSystem {
                    components: eq.components.clone(),
                    stoich: eq.stoichiometry.clone(),
                    log_k: eq.log_k.clone(),
                    max_iter: eq.max_iter,
                    tolerance: eq.tolerance,
                    depth: eq.anderson_depth,
                },
                grid.len(),
            )),
            _ => None,
        };

        let spreader = match micro {
            Some(mc) if config.mode.biotic && sessile.iter().any(|&s| s) => {
                let mode = match mc.ca_method {
                    CaMethod::Fraction => Some(SpreadMode::Fraction),
                    CaMethod::Half => Some(SpreadMode::Half),
                    CaMethod::None => None,
                };
                mode.map(|mode| {
                    Spreader::new(
                        SpreadParams {
                            mode,
                            b_max: mc.b_max,
                            phi_b: mc.biofilm_fraction,
                            iter_cap: mc.ca_iter_cap,
                            seed: mc.ca_seed,
                        },
                        sessile.clone(),
                        grid.len(),
                    )
                })
            }
            _ => None,
        };

        let transport =
            TransportSolver::new(&grid, config.domain.periodic_y, config.domain.periodic_z);
        let species_bc = config
            .chemistry
            .species
            .iter()
            .map(|s| (to_boundary(&s.left), to_boundary(&s.right)))
            .collect();
        let biomass_bc = microbes
            .iter()
            .map(|m| (to_boundary(&m.left), to_boundary(&m.right)))
            .collect();

        let biomass_initial: f64 = state.biomass.iter().map(|b| b.iter().sum::<f64>()).sum();

        std::fs::create_dir_all(&config.paths.output_dir)?;

        Ok(Self {
            config,
            state,
            flow,
            transport,
            kinetics,
            equilibrium,
            spreader,
            dynamics,
            dt,
            iteration: engine_iteration,
            species_bc,
            biomass_bc,
            biomass_initial,
            timers: StageTimers::default(),
        })
    }

    /// Physical seconds per iteration.
    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// One iteration of the coupled pipeline.
    pub fn step(&mut self) -> Result<(), SimulationError> {
        let track = self.config.mode.track_performance;

        // Scalar collide.
        let t0 = Instant::now();
        self.collide_scalars();
        if track {
            self.timers.collide += t0.elapsed();
        }

        // Kinetics.
        if let Some(kinetics) = self.kinetics.as_mut() {
            let t = Instant::now();
            kinetics.sweep(&mut self.state, self.dt);
            kinetics.apply(&mut self.state);
            if track {
                self.timers.kinetics += t.elapsed();
            }
        }

        // Equilibrium speciation.
        if let Some(eq) = self.equilibrium.as_mut() {
            let t = Instant::now();
            let report = eq.run(&mut self.state);
            if report.failed > 0 {
                log::warn!(
                    "speciation left {} voxels unchanged this iteration",
                    report.failed
                );
            }
            if track {
                self.timers.equilibrium += t.elapsed();
            }
        }

        // Biofilm spreading, then geometry reconciliation if it moved the
        // pore topology.
        if let Some(spreader) = self.spreader.as_mut() {
            let t = Instant::now();
            let outcome = spreader.run(&mut self.state)?;
            if track {
                self.timers.spread += t.elapsed();
            }
            if outcome.geometry_dirty {
                let t = Instant::now();
                self.dynamics.reconcile(&mut self.state, self.flow.as_mut())?;
                if track {
                    self.timers.geometry += t.elapsed();
                }
            }
        }

        // Scalar stream and boundary re-imposition.
        let t = Instant::now();
        self.stream_scalars();
        if track {
            self.timers.stream += t.elapsed();
        }

        // Biofilm ages in iterations.
        for idx in 0..self.state.grid.len() {
            if matches!(self.state.mask[idx], VoxelClass::Biofilm(_)) {
                self.state.age[idx] += 1;
            }
        }

        self.iteration += 1;
        self.check_finite()?;
        Ok(())
    }

    fn collide_scalars(&mut self) {
        let State {
            mask,
            species,
            biomass_lattices,
            ux,
            uy,
            uz,
            ..
        } = &mut self.state;
        for lat in species.iter_mut() {
            self.transport.collide(lat, mask, ux, uy, uz, true);
        }
        for (m, lat) in biomass_lattices.iter_mut().enumerate() {
            if let Some(lat) = lat {
                let advected = self.config.microbes()[m].solver == MicrobeSolver::Lbm;
                self.transport.collide(lat, mask, ux, uy, uz, advected);
            }
        }
    }

    fn stream_scalars(&mut self) {
        let State {
            grid,
            mask,
            species,
            biomass_lattices,
            biomass,
            ux,
            uy,
            uz,
            ..
        } = &mut self.state;

        for (s, lat) in species.iter_mut().enumerate() {
            self.transport.stream(lat, grid, mask);
            let (left, right) = self.species_bc[s];
            self.transport
                .apply_boundaries(lat, grid, mask, left, right, ux, uy, uz, true);
            lat.refresh_conc(mask);
        }

        for (m, lat) in biomass_lattices.iter_mut().enumerate() {
            if let Some(lat) = lat {
                let advected = self.config.microbes()[m].solver == MicrobeSolver::Lbm;
                self.transport.stream(lat, grid, mask);
                let (left, right) = self.biomass_bc[m];
                self.transport
                    .apply_boundaries(lat, grid, mask, left, right, ux, uy, uz, advected);
                lat.refresh_conc(mask);
                biomass[m].copy_from_slice(&lat.conc);
            }
        }
    }

    /// Fatal NaN/Inf gate over every macroscopic field.
    fn check_finite(&self) -> Result<(), SimulationError> {
        for lat in &self.state.species {
            if let Some(idx) = find_non_finite(&lat.conc) {
                let (i, j, k) = self.state.grid.coords(idx);
                return Err(SimulationError::NonFinite {
                    field: "concentration",
                    i,
                    j,
                    k,
                    iter: self.iteration,
                });
            }
        }
        for field in &self.state.biomass {
            if let Some(idx) = find_non_finite(field) {
                let (i, j, k) = self.state.grid.coords(idx);
                return Err(SimulationError::NonFinite {
                    field: "biomass",
                    i,
                    j,
                    k,
                    iter: self.iteration,
                });
            }
        }
        if let Some(idx) = find_non_finite(&self.state.ux) {
            let (i, j, k) = self.state.grid.coords(idx);
            return Err(SimulationError::NonFinite {
                field: "velocity",
                i,
                j,
                k,
                iter: self.iteration,
            });
        }
        Ok(())
    }

    /// Min/mean/max of one species over fluid voxels.
    fn species_stats(&self, s: usize) -> (f64, f64, f64) {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut sum = 0.0;
        let mut count = 0usize;
        for idx in 0..self.state.grid.len() {
            if self.state.mask[idx].is_fluid() {
                let c = self.state.species[s].conc[idx];
                min = min.min(c);
                max = max.max(c);
                sum += c;
                count += 1;
            }
        }
        if count == 0 {
            (0.0, 0.0, 0.0)
        } else {
            (min, sum / count as f64, max)
        }
    }

    fn report_interval(&self) {
        for (s, sc) in self.config.chemistry.species.iter().enumerate() {
            let (min, mean, max) = self.species_stats(s);
            log::info!(
                "iter {:>8} {:12} min {:.4e} mean {:.4e} max {:.4e}",
                self.iteration,
                sc.name,
                min,
                mean,
                max
            );
        }
        let total: f64 = self.state.biomass.iter().map(|b| b.iter().sum::<f64>()).sum();
        if self.biomass_initial > 0.0 {
            let max = self
                .state
                .biomass
                .iter()
                .flat_map(|b| b.iter().copied())
                .fold(0.0f64, f64::max);
            log::info!(
                "iter {:>8} biomass max {:.4e} growth {:+.2}%",
                self.iteration,
                max,
                100.0 * (total - self.biomass_initial) / self.biomass_initial
            );
        }
        if let Some(sp) = &self.spreader {
            log::info!(
                "iter {:>8} spreader triggers {} passes {}",
                self.iteration,
                sp.triggers,
                sp.passes_total
            );
        }
        if self.config.mode.track_performance {
            let t = &self.timers;
            log::info!(
                "timing: collide {:.2?} kinetics {:.2?} equilibrium {:.2?} spread {:.2?} geometry {:.2?} stream {:.2?} output {:.2?}",
                t.collide,
                t.kinetics,
                t.equilibrium,
                t.spread,
                t.geometry,
                t.stream,
                t.output
            );
        }
        if self.config.mode.enable_validation_diagnostics {
            self.validation_report();
        }
    }

    /// Bulk inventories for closed-system audits: one line per species plus
    /// the sessile biomass total.
    fn validation_report(&self) {
        for (s, sc) in self.config.chemistry.species.iter().enumerate() {
            let inventory: f64 = self.state.species[s].conc.iter().sum();
            log::info!(
                "iter {:>8} inventory {:12} {:.9e}",
                self.iteration,
                sc.name,
                inventory
            );
        }
        if let Some(sp) = &self.spreader {
            log::info!(
                "iter {:>8} sessile biomass inventory {:.9e}",
                self.iteration,
                sp.total_mass(&self.state)
            );
        }
    }

    fn vti_path(&self, name: &str) -> PathBuf {
        self.config
            .paths
            .output_dir
            .join(format!("{}_{:08}.vti", name, self.iteration))
    }

    /// Dump every configured field at the current iteration.
    pub fn write_fields(&mut self) -> Result<(), SimulationError> {
        let t = Instant::now();
        let grid = &self.state.grid;
        for (s, sc) in self.config.chemistry.species.iter().enumerate() {
            write_scalar(
                &self.vti_path(&sc.name),
                grid,
                &sc.name,
                &self.state.species[s].conc,
            )?;
        }
        for (m, mc) in self.config.microbes().iter().enumerate() {
            write_scalar(&self.vti_path(&mc.name), grid, &mc.name, &self.state.biomass[m])?;
        }
        write_mask(&self.vti_path("mask"), grid, &self.state.mask)?;
        write_flow(
            &self.vti_path("flow"),
            grid,
            &self.state.ux,
            &self.state.uy,
            &self.state.uz,
            &self.state.rho,
        )?;
        self.timers.output += t.elapsed();
        Ok(())
    }

    fn write_checkpoint_now(&mut self) -> Result<(), SimulationError> {
        let t = Instant::now();
        let path = self
            .config
            .paths
            .output_dir
            .join(&self.config.paths.checkpoint_name);
        write_checkpoint(
            &path,
            &self.state,
            self.iteration,
            self.iteration as f64 * self.dt,
        )?;
        self.timers.output += t.elapsed();
        Ok(())
    }

    /// Drive the full time loop with periodic output.
    pub fn run(&mut self) -> Result<RunSummary, SimulationError> {
        let start = Instant::now();
        let total = self.config.lb.max_iterations;
        let vti_every = self.config.io.vti_interval;
        let chk_every = self.config.io.checkpoint_interval;
        let report_every = self.config.lb.report_interval.max(1);

        while self.iteration < total {
            if vti_every > 0 && self.iteration % vti_every == 0 {
                self.write_fields()?;
            }
            if chk_every > 0 && self.iteration > 0 && self.iteration % chk_every == 0 {
                self.write_checkpoint_now()?;
            }
            self.step()?;
            if self.iteration % report_every == 0 {
                self.report_interval();
            }
        }

        self.write_fields()?;
        if chk_every > 0 {
            self.write_checkpoint_now()?;
        }

        let biomass_final: f64 = self.state.biomass.iter().map(|b| b.iter().sum::<f64>()).sum();
        let species_envelopes = self
            .config
            .chemistry
            .species
            .iter()
            .enumerate()
            .map(|(s, sc)| {
                let (min, mean, max) = self.species_stats(s);
                (sc.name.clone(), min, mean, max)
            })
            .collect();

        Ok(RunSummary {
            iterations: self.iteration,
            simulated_time: self.iteration as f64 * self.dt,
            wall_clock: start.elapsed(),
            species_envelopes,
            biomass_initial: self.biomass_initial,
            biomass_final,
            ca_triggers: self.spreader.as_ref().map(|s| s.triggers).unwrap_or(0),
            ca_passes: self.spreader.as_ref().map(|s| s.passes_total).unwrap_or(0),
            equilibrium_failures: self
                .equilibrium
                .as_ref()
                .map(|e| e.total_failures)
                .unwrap_or(0),
            geometry_updates: self.dynamics.geometry_updates,
            flow_frozen: self.dynamics.flow_frozen,
        })
    }
}

fn aligned(values: &[f64], n: usize) -> Vec<f64> {
    if values.len() == n {
        values.to_vec()
    } else {
        vec![0.0; n]
    }
}
