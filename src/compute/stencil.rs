//! Discrete velocity sets for the flow and scalar lattices.
//!
//! D3Q19 carries the Navier-Stokes dynamics, D3Q7 the advected scalars.
//! Both share the same axis ordering so a D3Q7 direction index is valid
//! as a D3Q19 index for q < 7.

/// Number of discrete velocities in the flow stencil.
pub const Q19: usize = 19;
/// Number of discrete velocities in the scalar stencil.
pub const Q7: usize = 7;

/// Squared sound speed of the D3Q19 lattice.
pub const CS2_NS: f64 = 1.0 / 3.0;
/// Squared sound speed of the D3Q7 lattice.
pub const CS2_ADE: f64 = 1.0 / 4.0;

/// D3Q19 velocity components, rest vector first, axis pairs, then diagonals.
pub const C19: [[i32; 3]; Q19] = [
    [0, 0, 0],
    [1, 0, 0],
    [-1, 0, 0],
    [0, 1, 0],
    [0, -1, 0],
    [0, 0, 1],
    [0, 0, -1],
    [1, 1, 0],
    [-1, -1, 0],
    [1, -1, 0],
    [-1, 1, 0],
    [1, 0, 1],
    [-1, 0, -1],
    [1, 0, -1],
    [-1, 0, 1],
    [0, 1, 1],
    [0, -1, -1],
    [0, 1, -1],
    [0, -1, 1],
];

/// D3Q19 quadrature weights.
pub const W19: [f64; Q19] = [
    1.0 / 3.0,
    1.0 / 18.0,
    1.0 / 18.0,
    1.0 / 18.0,
    1.0 / 18.0,
    1.0 / 18.0,
    1.0 / 18.0,
    1.0 / 36.0,
    1.0 / 36.0,
    1.0 / 36.0,
    1.0 / 36.0,
    1.0 / 36.0,
    1.0 / 36.0,
    1.0 / 36.0,
    1.0 / 36.0,
    1.0 / 36.0,
    1.0 / 36.0,
    1.0 / 36.0,
    1.0 / 36.0,
];

/// Index of the opposite direction for each D3Q19 velocity.
pub const OPP19: [usize; Q19] = [
    0, 2, 1, 4, 3, 6, 5, 8, 7, 10, 9, 12, 11, 14, 13, 16, 15, 18, 17,
];

/// D3Q7 weights: rest particle plus the six face directions of `C19[0..7]`.
pub const W7: [f64; Q7] = [
    1.0 / 4.0,
    1.0 / 8.0,
    1.0 / 8.0,
    1.0 / 8.0,
    1.0 / 8.0,
    1.0 / 8.0,
    1.0 / 8.0,
];

/// Index of the opposite direction for each D3Q7 velocity.
pub const OPP7: [usize; Q7] = [0, 2, 1, 4, 3, 6, 5];

/// Second-order incompressible equilibrium for the flow lattice.
#[inline]
pub fn feq(q: usize, rho: f64, ux: f64, uy: f64, uz: f64) -> f64 {
    let c = C19[q];
    let cu = c[0] as f64 * ux + c[1] as f64 * uy + c[2] as f64 * uz;
    let usq = ux * ux + uy * uy + uz * uz;
    W19[q] * rho * (1.0 + 3.0 * cu + 4.5 * cu * cu - 1.5 * usq)
}

/// Linear advection-diffusion equilibrium for the scalar lattice.
#[inline]
pub fn geq(q: usize, conc: f64, ux: f64, uy: f64, uz: f64) -> f64 {
    let c = C19[q];
    let cu = c[0] as f64 * ux + c[1] as f64 * uy + c[2] as f64 * uz;
    W7[q] * conc * (1.0 + cu / CS2_ADE)
}

/// Relaxation time giving kinematic viscosity `nu` on the D3Q19 lattice.
#[inline]
pub fn tau_from_viscosity(nu: f64) -> f64 {
    nu / CS2_NS + 0.5
}

/// Kinematic viscosity of the D3Q19 lattice at relaxation time `tau`.
#[inline]
pub fn viscosity_from_tau(tau: f64) -> f64 {
    CS2_NS * (tau - 0.5)
}

/// Relaxation time giving diffusivity `d` on the D3Q7 lattice.
#[inline]
pub fn tau_from_diffusivity(d: f64) -> f64 {
    d / CS2_ADE + 0.5
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_q19_weights_sum_to_one() {
        let sum: f64 = W19.iter().sum();
        assert!((sum - 1.0).abs() < 1e-15, "D3Q19 weights sum to {}", sum);
    }

    #[test]
    fn test_q7_weights_sum_to_one() {
        let sum: f64 = W7.iter().sum();
        assert!((sum - 1.0).abs() < 1e-15, "D3Q7 weights sum to {}", sum);
    }

    #[test]
    fn test_opposites_negate() {
        for q in 0..Q19 {
            let o = OPP19[q];
            for a in 0..3 {
                assert_eq!(C19[q][a], -C19[o][a], "direction {} vs opposite {}", q, o);
            }
        }
        for q in 0..Q7 {
            assert_eq!(OPP7[q], OPP19[q], "D3Q7 opposite table diverges at {}", q);
        }
    }

    #[test]
    fn test_feq_moments() {
        // Zeroth and first moments of the equilibrium recover rho and rho*u.
        let (rho, ux, uy, uz) = (1.02, 0.03, -0.01, 0.02);
        let mut m0 = 0.0;
        let mut m1 = [0.0f64; 3];
        for q in 0..Q19 {
            let f = feq(q, rho, ux, uy, uz);
            m0 += f;
            for a in 0..3 {
                m1[a] += f * C19[q][a] as f64;
            }
        }
        assert!((m0 - rho).abs() < 1e-12, "density moment {} vs {}", m0, rho);
        assert!((m1[0] - rho * ux).abs() < 1e-12);
        assert!((m1[1] - rho * uy).abs() < 1e-12);
        assert!((m1[2] - rho * uz).abs() < 1e-12);
    }

    #[test]
    fn test_geq_zeroth_moment() {
        let (conc, ux, uy, uz) = (0.75, 0.05, 0.02, -0.04);
        let sum: f64 = (0..Q7).map(|q| geq(q, conc, ux, uy, uz)).sum();
        assert!(
            (sum - conc).abs() < 1e-12,
            "scalar moment {} vs {}",
            sum,
            conc
        );
    }

    #[test]
    fn test_tau_viscosity_round_trip() {
        let nu = 0.12;
        let tau = tau_from_viscosity(nu);
        assert!((viscosity_from_tau(tau) - nu).abs() < 1e-15);
    }
}
