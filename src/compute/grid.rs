//! Rectilinear voxel grid: dimensions, indexing and voxel classification.

use serde::{Deserialize, Serialize};

/// Classification of a single voxel.
///
/// Every voxel is in exactly one class at any instant. The class decides
/// which lattice updates touch the voxel and which relaxation parameters
/// are installed there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoxelClass {
    /// Impermeable solid, excluded from every lattice update.
    Solid,
    /// Solid-fluid interface, participates in LBM as a no-slip reflector.
    BounceBack,
    /// Open pore fluid.
    Pore,
    /// Fluid occupied by biofilm of microbe `m`: reduced diffusivity and
    /// flow permeability.
    Biofilm(usize),
}

impl VoxelClass {
    /// True for voxels that carry flow and transport dynamics.
    #[inline]
    pub fn is_fluid(self) -> bool {
        matches!(self, VoxelClass::Pore | VoxelClass::Biofilm(_))
    }

    /// True for voxels that block streaming.
    #[inline]
    pub fn is_wall(self) -> bool {
        matches!(self, VoxelClass::Solid | VoxelClass::BounceBack)
    }
}

/// Grid geometry and flat-index arithmetic.
///
/// Storage order follows the geometry file: x outermost, then z, then y.
/// `idx = (i * nz + k) * ny + j`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grid {
    /// Extent along x (flow axis, inlet at i = 0).
    pub nx: usize,
    /// Extent along y.
    pub ny: usize,
    /// Extent along z.
    pub nz: usize,
    /// Physical voxel size in metres.
    pub dx: f64,
}

impl Grid {
    pub fn new(nx: usize, ny: usize, nz: usize, dx: f64) -> Self {
        Self { nx, ny, nz, dx }
    }

    /// Total number of voxels.
    #[inline]
    pub fn len(&self) -> usize {
        self.nx * self.ny * self.nz
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flat index of voxel (i, j, k).
    #[inline]
    pub fn idx(&self, i: usize, j: usize, k: usize) -> usize {
        (i * self.nz + k) * self.ny + j
    }

    /// Voxel coordinate of a flat index.
    #[inline]
    pub fn coords(&self, idx: usize) -> (usize, usize, usize) {
        let j = idx % self.ny;
        let rest = idx / self.ny;
        let k = rest % self.nz;
        let i = rest / self.nz;
        (i, j, k)
    }

    /// Shift (i, j, k) by a lattice vector, honouring the domain faces.
    ///
    /// Returns `None` when the step leaves the domain along x or along a
    /// non-periodic transverse axis; wraps along y/z when periodic.
    #[inline]
    pub fn shift(
        &self,
        i: usize,
        j: usize,
        k: usize,
        c: [i32; 3],
        periodic_y: bool,
        periodic_z: bool,
    ) -> Option<(usize, usize, usize)> {
        let ni = i as i64 + c[0] as i64;
        if ni < 0 || ni >= self.nx as i64 {
            return None;
        }
        let nj = match wrap(j, c[1], self.ny, periodic_y) {
            Some(v) => v,
            None => return None,
        };
        let nk = match wrap(k, c[2], self.nz, periodic_z) {
            Some(v) => v,
            None => return None,
        };
        Some((ni as usize, nj, nk))
    }

    /// Face-adjacent neighbour indices of (i, j, k), without wrapping.
    ///
    /// At a domain face the missing neighbours are simply absent, so the
    /// returned list holds between 3 and 6 entries.
    pub fn neighbours_face(&self, i: usize, j: usize, k: usize) -> Vec<usize> {
        let mut out = Vec::with_capacity(6);
        if i > 0 {
            out.push(self.idx(i - 1, j, k));
        }
        if i + 1 < self.nx {
            out.push(self.idx(i + 1, j, k));
        }
        if j > 0 {
            out.push(self.idx(i, j - 1, k));
        }
        if j + 1 < self.ny {
            out.push(self.idx(i, j + 1, k));
        }
        if k > 0 {
            out.push(self.idx(i, j, k - 1));
        }
        if k + 1 < self.nz {
            out.push(self.idx(i, j, k + 1));
        }
        out
    }
}

#[inline]
fn wrap(v: usize, step: i32, extent: usize, periodic: bool) -> Option<usize> {
    let n = v as i64 + step as i64;
    if n < 0 {
        if periodic { Some(extent - 1) } else { None }
    } else if n >= extent as i64 {
        if periodic { Some(0) } else { None }
    } else {
        Some(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idx_matches_file_order() {
        // The geometry file runs i outer, k middle, j inner.
        let grid = Grid::new(3, 4, 5, 1e-6);
        let mut expected = 0usize;
        for i in 0..3 {
            for k in 0..5 {
                for j in 0..4 {
                    assert_eq!(grid.idx(i, j, k), expected);
                    assert_eq!(grid.coords(expected), (i, j, k));
                    expected += 1;
                }
            }
        }
    }

    #[test]
    fn test_shift_blocks_at_x_faces() {
        let grid = Grid::new(4, 4, 4, 1.0);
        assert_eq!(grid.shift(0, 1, 1, [-1, 0, 0], true, true), None);
        assert_eq!(grid.shift(3, 1, 1, [1, 0, 0], true, true), None);
        assert_eq!(grid.shift(1, 1, 1, [1, 0, 0], true, true), Some((2, 1, 1)));
    }

    #[test]
    fn test_shift_periodicity() {
        let grid = Grid::new(4, 4, 4, 1.0);
        assert_eq!(grid.shift(1, 3, 0, [0, 1, 0], true, false), Some((1, 0, 0)));
        assert_eq!(grid.shift(1, 3, 0, [0, 1, 0], false, false), None);
        assert_eq!(grid.shift(1, 0, 0, [0, 0, -1], false, true), Some((1, 0, 3)));
        assert_eq!(grid.shift(1, 0, 0, [0, 0, -1], false, false), None);
    }

    #[test]
    fn test_neighbours_face_counts() {
        let grid = Grid::new(3, 3, 3, 1.0);
        assert_eq!(grid.neighbours_face(0, 0, 0).len(), 3);
        assert_eq!(grid.neighbours_face(1, 1, 1).len(), 6);
        assert_eq!(grid.neighbours_face(1, 0, 1).len(), 5);
    }

    #[test]
    fn test_class_predicates() {
        assert!(VoxelClass::Pore.is_fluid());
        assert!(VoxelClass::Biofilm(2).is_fluid());
        assert!(!VoxelClass::Solid.is_fluid());
        assert!(VoxelClass::BounceBack.is_wall());
        assert!(!VoxelClass::Biofilm(0).is_wall());
    }
}
