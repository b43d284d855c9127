//! Configuration types for reactive-transport simulations.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_tau() -> f64 {
    1.0
}

fn default_viscosity_ratio() -> f64 {
    10.0
}

fn default_half() -> f64 {
    0.5
}

fn default_eq_max_iter() -> usize {
    200
}

fn default_eq_tolerance() -> f64 {
    1e-10
}

fn default_anderson_depth() -> usize {
    4
}

fn default_ca_iter_cap() -> u32 {
    2000
}

fn default_ca_seed() -> u64 {
    42
}

fn default_ns_max_iter() -> u32 {
    20_000
}

fn default_ns_update_iter() -> u32 {
    2_000
}

fn default_ns_tolerance() -> f64 {
    1e-8
}

fn default_ns_check_interval() -> u32 {
    50
}

fn default_ns_window() -> usize {
    5
}

fn default_max_iterations() -> u64 {
    10_000
}

fn default_report_interval() -> u64 {
    100
}

/// Top-level simulation configuration, one JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub mode: ModeConfig,
    pub domain: DomainConfig,
    pub lb: LbConfig,
    #[serde(default)]
    pub chemistry: ChemistryConfig,
    #[serde(default)]
    pub microbiology: Option<MicrobiologyConfig>,
    #[serde(default)]
    pub equilibrium: Option<EquilibriumConfig>,
    #[serde(default)]
    pub io: IoConfig,
}

/// Input/output locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory holding the geometry file or image stack.
    pub input_dir: PathBuf,
    /// Directory receiving field dumps and checkpoints.
    pub output_dir: PathBuf,
    /// Checkpoint file name inside `output_dir`.
    pub checkpoint_name: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("."),
            output_dir: PathBuf::from("output"),
            checkpoint_name: "state.chk".into(),
        }
    }
}

/// Global simulation-mode switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeConfig {
    /// Master switch for all microbiology. False skips kinetics, spreading
    /// and biofilm dynamics regardless of the other flags.
    #[serde(default = "default_true")]
    pub biotic: bool,
    #[serde(default = "default_true")]
    pub enable_kinetics: bool,
    /// Extra per-interval mass-balance audits on the console.
    #[serde(default)]
    pub enable_validation_diagnostics: bool,
    /// Collect and print a wall-clock breakdown per stage.
    #[serde(default)]
    pub track_performance: bool,
}

impl Default for ModeConfig {
    fn default() -> Self {
        Self {
            biotic: true,
            enable_kinetics: true,
            enable_validation_diagnostics: false,
            track_performance: false,
        }
    }
}

/// Physical length unit of `dx` and `characteristic_length`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    #[default]
    M,
    Mm,
    Um,
}

impl Unit {
    /// Conversion factor to metres.
    pub fn metres(self) -> f64 {
        match self {
            Unit::M => 1.0,
            Unit::Mm => 1e-3,
            Unit::Um => 1e-6,
        }
    }
}

/// Domain shape, resolution and material mapping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
    /// Voxel edge length, in `unit`.
    pub dx: f64,
    #[serde(default)]
    pub unit: Unit,
    /// Characteristic length for Peclet scaling, in `unit`. Defaults to the
    /// x extent.
    #[serde(default)]
    pub characteristic_length: Option<f64>,
    /// Geometry file of integer material tags; absent means all-pore.
    #[serde(default)]
    pub geometry: Option<String>,
    /// Directory of raw 8-bit image slices stacked along x, thresholded at
    /// 128. Mutually exclusive with `geometry`.
    #[serde(default)]
    pub image_stack: Option<String>,
    #[serde(default)]
    pub materials: MaterialMap,
    #[serde(default = "default_true")]
    pub periodic_y: bool,
    #[serde(default = "default_true")]
    pub periodic_z: bool,
}

/// Integer material tags as they appear in the geometry file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaterialMap {
    pub pore: i32,
    pub solid: i32,
    pub bounce_back: i32,
    /// Per-microbe lists of tags marking initial biofilm voxels.
    #[serde(default)]
    pub microbes: Vec<Vec<i32>>,
}

impl Default for MaterialMap {
    fn default() -> Self {
        Self {
            pore: 0,
            solid: 1,
            bounce_back: 2,
            microbes: Vec::new(),
        }
    }
}

/// Lattice-Boltzmann numerics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LbConfig {
    /// Pressure drop across the x extent, lattice units.
    #[serde(default)]
    pub delta_p: f64,
    /// Target Peclet number for pressure calibration; 0 disables it.
    #[serde(default)]
    pub peclet: f64,
    /// Flow relaxation time.
    #[serde(default = "default_tau")]
    pub tau: f64,
    /// Reference relaxation time of species 0 fixing the time step.
    #[serde(default = "default_tau")]
    pub tau_ade: f64,
    /// Flow iteration cap for the initial convergence.
    #[serde(default = "default_ns_max_iter")]
    pub ns_max_iter_initial: u32,
    /// Flow iteration cap after geometry changes.
    #[serde(default = "default_ns_update_iter")]
    pub ns_max_iter_update: u32,
    #[serde(default = "default_ns_tolerance")]
    pub ns_tolerance: f64,
    #[serde(default = "default_ns_check_interval")]
    pub ns_check_interval: u32,
    #[serde(default = "default_ns_window")]
    pub ns_window: usize,
    /// Transport iterations to run.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u64,
    /// Console report interval in iterations.
    #[serde(default = "default_report_interval")]
    pub report_interval: u64,
}

/// Dissolved chemistry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChemistryConfig {
    #[serde(default)]
    pub species: Vec<SpeciesConfig>,
}

/// One dissolved species.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeciesConfig {
    pub name: String,
    /// Initial concentration in every fluid voxel.
    #[serde(default)]
    pub c0: f64,
    /// Diffusivity in open pore, m^2/s.
    pub d_pore: f64,
    /// Diffusivity in biofilm, m^2/s; defaults to `d_pore`.
    #[serde(default)]
    pub d_biofilm: Option<f64>,
    pub left: BoundaryConfig,
    pub right: BoundaryConfig,
}

impl SpeciesConfig {
    pub fn d_biofilm(&self) -> f64 {
        self.d_biofilm.unwrap_or(self.d_pore)
    }
}

/// Boundary condition on an x face.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BoundaryConfig {
    Dirichlet {
        value: f64,
    },
    Neumann {
        #[serde(default)]
        flux: f64,
    },
}

impl Default for BoundaryConfig {
    fn default() -> Self {
        BoundaryConfig::Neumann { flux: 0.0 }
    }
}

/// Microbial populations and the spreading rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicrobiologyConfig {
    /// Carrying capacity per voxel.
    pub b_max: f64,
    /// Fraction of `b_max` at which a voxel counts as biofilm.
    #[serde(default = "default_half")]
    pub biofilm_fraction: f64,
    #[serde(default)]
    pub ca_method: CaMethod,
    #[serde(default = "default_ca_seed")]
    pub ca_seed: u64,
    #[serde(default = "default_ca_iter_cap")]
    pub ca_iter_cap: u32,
    /// Largest fraction of a species the kinetics may consume per step.
    #[serde(default = "default_half")]
    pub clamp_fraction: f64,
    #[serde(default)]
    pub microbes: Vec<MicrobeConfig>,
}

/// Overflow redistribution rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaMethod {
    #[default]
    Fraction,
    Half,
    None,
}

/// Biomass phase solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MicrobeSolver {
    /// Sessile biofilm, spread by the cellular automaton.
    Ca,
    /// Planktonic phase advected by the flow.
    Lbm,
    /// Diffusive phase without advection.
    Fd,
}

/// Whether a microbe carries a reaction term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionKind {
    #[default]
    Kinetics,
    None,
}

/// Initial biomass density on voxels carrying one material tag.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TagDensity {
    pub tag: i32,
    pub density: f64,
}

/// One microbial population.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MicrobeConfig {
    pub name: String,
    pub solver: MicrobeSolver,
    #[serde(default)]
    pub reaction: ReactionKind,
    #[serde(default)]
    pub initial_density: Vec<TagDensity>,
    /// Maximum specific growth rate, 1/s.
    #[serde(default)]
    pub mu_max: f64,
    /// Biomass yield per unit substrate.
    #[serde(default = "default_tau")]
    pub yield_coeff: f64,
    /// First-order decay rate, 1/s.
    #[serde(default)]
    pub k_decay: f64,
    /// Flow viscosity multiplier inside this microbe's biofilm.
    #[serde(default = "default_viscosity_ratio")]
    pub viscosity_ratio: f64,
    /// Half-saturation constant per species; empty means no substrate
    /// limitation.
    #[serde(default)]
    pub half_saturation: Vec<f64>,
    /// Uptake flux weight per species; empty disables uptake.
    #[serde(default)]
    pub uptake: Vec<f64>,
    /// Mobile-phase diffusivity in open pore, m^2/s.
    #[serde(default)]
    pub d_pore: f64,
    /// Mobile-phase diffusivity in biofilm, m^2/s.
    #[serde(default)]
    pub d_biofilm: Option<f64>,
    /// Mobile-phase boundary conditions; default zero-flux.
    #[serde(default)]
    pub left: BoundaryConfig,
    #[serde(default)]
    pub right: BoundaryConfig,
}

impl MicrobeConfig {
    pub fn is_sessile(&self) -> bool {
        self.solver == MicrobeSolver::Ca
    }

    pub fn is_advected(&self) -> bool {
        self.solver == MicrobeSolver::Lbm
    }

    pub fn d_biofilm(&self) -> f64 {
        self.d_biofilm.unwrap_or(self.d_pore)
    }
}

/// Fast-reaction speciation setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquilibriumConfig {
    /// Component names in column order.
    pub components: Vec<String>,
    /// One row per dissolved species, one column per component.
    pub stoichiometry: Vec<Vec<f64>>,
    /// log10 formation constant per species.
    pub log_k: Vec<f64>,
    #[serde(default = "default_eq_max_iter")]
    pub max_iter: usize,
    #[serde(default = "default_eq_tolerance")]
    pub tolerance: f64,
    #[serde(default = "default_anderson_depth")]
    pub anderson_depth: usize,
}

/// Output cadence and restart handling.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IoConfig {
    /// Field-dump interval in iterations; 0 dumps only the final state.
    #[serde(default)]
    pub vti_interval: u64,
    /// Checkpoint interval in iterations; 0 disables checkpoints.
    #[serde(default)]
    pub checkpoint_interval: u64,
    #[serde(default)]
    pub restart: bool,
    #[serde(default)]
    pub restart_file: Option<String>,
}

/// Configuration validation and parse errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("grid dimensions must be non-zero")]
    InvalidDimensions,
    #[error("voxel size dx must be positive")]
    InvalidVoxelSize,
    #[error("tau must lie in (0.5, 2), got {0}")]
    TauOutOfRange(f64),
    #[error("species {0} has non-positive pore diffusivity")]
    InvalidDiffusivity(String),
    #[error("duplicate species name {0}")]
    DuplicateSpecies(String),
    #[error("microbe {microbe}: {vector} has length {got}, expected {expected} (one per species)")]
    MisalignedKinetics {
        microbe: String,
        vector: &'static str,
        got: usize,
        expected: usize,
    },
    #[error("microbe {0} is mobile but has no diffusivity")]
    MobileWithoutDiffusivity(String),
    #[error("material tag {0} is mapped more than once")]
    DuplicateTag(i32),
    #[error("materials map {got} microbe tag lists for {expected} microbes")]
    MisalignedMaterials { got: usize, expected: usize },
    #[error("equilibrium stoichiometry has {got} rows, expected {expected} (one per species)")]
    MisalignedStoichiometry { got: usize, expected: usize },
    #[error("equilibrium stoichiometry row {row} has {got} columns, expected {expected}")]
    MisalignedComponents {
        row: usize,
        got: usize,
        expected: usize,
    },
    #[error("equilibrium log_k has {got} entries, expected {expected}")]
    MisalignedLogK { got: usize, expected: usize },
    #[error("geometry and image_stack are mutually exclusive")]
    AmbiguousGeometry,
}

impl SimulationConfig {
    /// Read and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: SimulationConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Number of dissolved species.
    pub fn n_species(&self) -> usize {
        self.chemistry.species.len()
    }

    /// Microbes, empty when the run is abiotic.
    pub fn microbes(&self) -> &[MicrobeConfig] {
        if !self.mode.biotic {
            return &[];
        }
        self.microbiology
            .as_ref()
            .map(|m| m.microbes.as_slice())
            .unwrap_or(&[])
    }

    /// True when the kinetics stage runs.
    pub fn kinetics_enabled(&self) -> bool {
        self.mode.biotic && self.mode.enable_kinetics && !self.microbes().is_empty()
    }

    /// Characteristic length in lattice units.
    pub fn characteristic_length_lattice(&self) -> f64 {
        match self.domain.characteristic_length {
            Some(l) => l / self.domain.dx,
            None => self.domain.nx as f64,
        }
    }

    /// Physical voxel size in metres.
    pub fn dx_metres(&self) -> f64 {
        self.domain.dx * self.domain.unit.metres()
    }

    /// Cross-field validation; fails fast with a specific message.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let d = &self.domain;
        if d.nx == 0 || d.ny == 0 || d.nz == 0 {
            return Err(ConfigError::InvalidDimensions);
        }
        if d.dx <= 0.0 {
            return Err(ConfigError::InvalidVoxelSize);
        }
        if d.geometry.is_some() && d.image_stack.is_some() {
            return Err(ConfigError::AmbiguousGeometry);
        }
        if self.lb.tau <= 0.5 || self.lb.tau >= 2.0 {
            return Err(ConfigError::TauOutOfRange(self.lb.tau));
        }

        let mut names = Vec::new();
        for s in &self.chemistry.species {
            if s.d_pore <= 0.0 {
                return Err(ConfigError::InvalidDiffusivity(s.name.clone()));
            }
            if names.contains(&s.name) {
                return Err(ConfigError::DuplicateSpecies(s.name.clone()));
            }
            names.push(s.name.clone());
        }

        let ns = self.n_species();
        if let Some(micro) = &self.microbiology {
            if !d.materials.microbes.is_empty()
                && d.materials.microbes.len() != micro.microbes.len()
            {
                return Err(ConfigError::MisalignedMaterials {
                    got: d.materials.microbes.len(),
                    expected: micro.microbes.len(),
                });
            }
            for m in &micro.microbes {
                for (vector, len) in [
                    ("half_saturation", m.half_saturation.len()),
                    ("uptake", m.uptake.len()),
                ] {
                    if len != 0 && len != ns {
                        return Err(ConfigError::MisalignedKinetics {
                            microbe: m.name.clone(),
                            vector,
                            got: len,
                            expected: ns,
                        });
                    }
                }
                if !m.is_sessile() && m.d_pore <= 0.0 {
                    return Err(ConfigError::MobileWithoutDiffusivity(m.name.clone()));
                }
            }
        }

        // Material tags must be unambiguous.
        let mut tags = vec![d.materials.pore, d.materials.solid, d.materials.bounce_back];
        for list in &d.materials.microbes {
            tags.extend_from_slice(list);
        }
        tags.sort_unstable();
        for w in tags.windows(2) {
            if w[0] == w[1] {
                return Err(ConfigError::DuplicateTag(w[0]));
            }
        }

        if let Some(eq) = &self.equilibrium {
            if eq.stoichiometry.len() != ns {
                return Err(ConfigError::MisalignedStoichiometry {
                    got: eq.stoichiometry.len(),
                    expected: ns,
                });
            }
            let nc = eq.components.len();
            for (row, r) in eq.stoichiometry.iter().enumerate() {
                if r.len() != nc {
                    return Err(ConfigError::MisalignedComponents {
                        row,
                        got: r.len(),
                        expected: nc,
                    });
                }
            }
            if eq.log_k.len() != ns {
                return Err(ConfigError::MisalignedLogK {
                    got: eq.log_k.len(),
                    expected: ns,
                });
            }
        }
        Ok(())
    }
}
