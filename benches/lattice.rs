//! Benchmarks for the flow and transport kernels.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use porelab::compute::{
    FlowParams, FlowSolver, Grid, State, TransportSolver, VoxelClass, tau_from_diffusivity,
};

fn channel_state(n: usize, n_species: usize) -> State {
    let grid = Grid::new(n, n, n, 1e-6);
    let mut mask = vec![VoxelClass::Pore; grid.len()];
    for i in 0..n {
        for k in 0..n {
            mask[grid.idx(i, 0, k)] = VoxelClass::BounceBack;
            mask[grid.idx(i, n - 1, k)] = VoxelClass::BounceBack;
        }
    }
    let tags = vec![0; grid.len()];
    let mut state = State::new(grid, mask, tags, n_species, 0);
    state.omega_ns.fill(1.0);
    let omega = 1.0 / tau_from_diffusivity(0.1);
    for lat in &mut state.species {
        lat.omega.fill(omega);
    }
    state
}

fn flow_params(n: usize) -> FlowParams {
    FlowParams {
        tau: 1.0,
        delta_p: 1e-3,
        peclet: 1.0,
        d_ref: 0.1,
        length: n as f64,
        periodic_y: false,
        periodic_z: true,
        tolerance: 1e-8,
        check_interval: 50,
        window: 5,
    }
}

fn bench_flow_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("flow_step");

    for size in [16, 32, 64] {
        let mut state = channel_state(size, 0);
        let solver = FlowSolver::new(flow_params(size)).unwrap();

        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{0}x{0}x{0}", size)),
            &size,
            |b, _| {
                b.iter(|| {
                    solver.step(black_box(&mut state));
                });
            },
        );
    }

    group.finish();
}

fn bench_transport_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("transport_step");

    for n_species in [1, 2, 4] {
        let mut state = channel_state(32, n_species);
        let mut solver = TransportSolver::new(&state.grid, false, true);

        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}_species", n_species)),
            &n_species,
            |b, _| {
                b.iter(|| {
                    let State {
                        grid,
                        mask,
                        species,
                        ux,
                        uy,
                        uz,
                        ..
                    } = &mut state;
                    for lat in species.iter_mut() {
                        solver.collide(black_box(lat), mask, ux, uy, uz, true);
                        solver.stream(black_box(lat), grid, mask);
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_flow_step, bench_transport_step);
criterion_main!(benches);
