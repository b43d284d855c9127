//! Reactive-transport CLI - validate configurations and run simulations.

use std::path::PathBuf;

use porelab::schema::{
    BoundaryConfig, CaMethod, ChemistryConfig, DomainConfig, LbConfig, MaterialMap, MicrobeConfig,
    MicrobeSolver, MicrobiologyConfig, ModeConfig, PathsConfig, ReactionKind, SpeciesConfig,
    TagDensity, Unit,
};
use porelab::{Engine, SimulationConfig};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage(&args[0]);
        std::process::exit(1);
    }

    match args[1].as_str() {
        "run" => cmd_run(&args[2..]),
        "validate" => cmd_validate(&args[2..]),
        "--example" => print_example_config(),
        "--help" | "-h" => print_usage(&args[0]),
        // Treat a bare config path as `run`
        _ => {
            if args[1].ends_with(".json") {
                cmd_run(&args[1..]);
            } else {
                eprintln!("Unknown command: {}", args[1]);
                print_usage(&args[0]);
                std::process::exit(1);
            }
        }
    }
}

fn print_usage(program: &str) {
    eprintln!("porelab - pore-scale reactive transport");
    eprintln!();
    eprintln!("Usage: {} <command> [options]", program);
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  run <config.json>       Run a simulation");
    eprintln!("  validate <config.json>  Check a configuration and exit");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --example               Print an example configuration");
    eprintln!("  --help, -h              Show this help message");
}

fn load_config(path: &PathBuf) -> SimulationConfig {
    SimulationConfig::load(path).unwrap_or_else(|e| {
        eprintln!("Error in {}: {}", path.display(), e);
        std::process::exit(1);
    })
}

fn cmd_validate(args: &[String]) {
    if args.is_empty() {
        eprintln!("Usage: porelab validate <config.json>");
        std::process::exit(1);
    }
    let path = PathBuf::from(&args[0]);
    let config = load_config(&path);
    println!("{} is valid", path.display());
    println!(
        "  domain {}x{}x{}, {} species, {} microbes",
        config.domain.nx,
        config.domain.ny,
        config.domain.nz,
        config.n_species(),
        config.microbes().len()
    );
}

fn cmd_run(args: &[String]) {
    if args.is_empty() {
        eprintln!("Usage: porelab run <config.json>");
        std::process::exit(1);
    }
    let path = PathBuf::from(&args[0]);
    let config = load_config(&path);

    println!("Pore-Scale Reactive Transport");
    println!("=============================");
    println!(
        "Domain: {}x{}x{} (dx = {} {})",
        config.domain.nx,
        config.domain.ny,
        config.domain.nz,
        config.domain.dx,
        match config.domain.unit {
            Unit::M => "m",
            Unit::Mm => "mm",
            Unit::Um => "um",
        }
    );
    println!("Species: {}", config.n_species());
    println!("Microbes: {}", config.microbes().len());
    println!("Iterations: {}", config.lb.max_iterations);
    println!();

    let mut engine = Engine::from_config(config).unwrap_or_else(|e| {
        eprintln!("Setup failed: {}", e);
        std::process::exit(1);
    });
    println!("Time step: {:.6e} s", engine.dt());
    println!("Running...");

    match engine.run() {
        Ok(summary) => {
            println!();
            println!("Run complete");
            println!("------------");
            print!("{}", summary);
        }
        Err(e) => {
            eprintln!();
            eprintln!("Fatal at iteration {}: {}", engine.iteration(), e);
            std::process::exit(1);
        }
    }
}

fn print_example_config() {
    let config = SimulationConfig {
        paths: PathsConfig::default(),
        mode: ModeConfig::default(),
        domain: DomainConfig {
            nx: 30,
            ny: 20,
            nz: 20,
            dx: 1.0,
            unit: Unit::Um,
            characteristic_length: Some(30.0),
            geometry: Some("geometry.dat".into()),
            image_stack: None,
            materials: MaterialMap {
                pore: 0,
                solid: 1,
                bounce_back: 2,
                microbes: vec![vec![5]],
            },
            periodic_y: true,
            periodic_z: true,
        },
        lb: LbConfig {
            delta_p: 1e-3,
            peclet: 1.0,
            tau: 1.0,
            tau_ade: 1.0,
            ns_max_iter_initial: 20_000,
            ns_max_iter_update: 2_000,
            ns_tolerance: 1e-8,
            ns_check_interval: 50,
            ns_window: 5,
            max_iterations: 50_000,
            report_interval: 1_000,
        },
        chemistry: ChemistryConfig {
            species: vec![SpeciesConfig {
                name: "doc".into(),
                c0: 0.0,
                d_pore: 1e-9,
                d_biofilm: Some(2.5e-10),
                left: BoundaryConfig::Dirichlet { value: 1e-2 },
                right: BoundaryConfig::Neumann { flux: 0.0 },
            }],
        },
        microbiology: Some(MicrobiologyConfig {
            b_max: 100.0,
            biofilm_fraction: 0.5,
            ca_method: CaMethod::Fraction,
            ca_seed: 42,
            ca_iter_cap: 2000,
            clamp_fraction: 0.5,
            microbes: vec![MicrobeConfig {
                name: "degrader".into(),
                solver: MicrobeSolver::Ca,
                reaction: ReactionKind::Kinetics,
                initial_density: vec![TagDensity {
                    tag: 5,
                    density: 90.0,
                }],
                mu_max: 1e-4,
                yield_coeff: 0.4,
                k_decay: 1e-7,
                viscosity_ratio: 10.0,
                half_saturation: vec![1e-5],
                uptake: vec![1.0],
                d_pore: 0.0,
                d_biofilm: None,
                left: BoundaryConfig::default(),
                right: BoundaryConfig::default(),
            }],
        }),
        equilibrium: None,
        io: porelab::schema::IoConfig {
            vti_interval: 5_000,
            checkpoint_interval: 10_000,
            restart: false,
            restart_file: None,
        },
    };

    println!("Example configuration (config.json):");
    println!("{}", serde_json::to_string_pretty(&config).unwrap());
}
