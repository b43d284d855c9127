//! Distance-to-wall field.
//!
//! Face-metric BFS from every wall voxel. The half-excess spreading rule
//! reads this field to steer biomass between crowded and open pore.

use std::collections::VecDeque;

use super::SimulationError;
use super::grid::{Grid, VoxelClass};

/// Level cap for the BFS; any physical geometry settles far below this.
const MAX_LEVELS: u32 = 1000;

/// Rebuild `distance` as the face-adjacent hop count to the nearest wall.
///
/// Wall voxels get distance 0. Fluid voxels unreachable from any wall (a
/// domain with no solids at all) get `MAX_LEVELS`.
pub fn rebuild_distance(
    grid: &Grid,
    mask: &[VoxelClass],
    distance: &mut [u32],
) -> Result<(), SimulationError> {
    distance.fill(MAX_LEVELS);
    let mut queue = VecDeque::new();

    for (idx, class) in mask.iter().enumerate() {
        if class.is_wall() {
            distance[idx] = 0;
            queue.push_back(idx);
        }
    }

    while let Some(idx) = queue.pop_front() {
        let level = distance[idx];
        if level >= MAX_LEVELS {
            return Err(SimulationError::DistanceOverflow { levels: MAX_LEVELS });
        }
        let (i, j, k) = grid.coords(idx);
        for n in grid.neighbours_face(i, j, k) {
            if distance[n] > level + 1 {
                distance[n] = level + 1;
                queue.push_back(n);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_from_single_wall_plane() {
        // Solid plane at i = 0; distance grows linearly along x.
        let grid = Grid::new(5, 3, 3, 1.0);
        let mut mask = vec![VoxelClass::Pore; grid.len()];
        for k in 0..3 {
            for j in 0..3 {
                mask[grid.idx(0, j, k)] = VoxelClass::Solid;
            }
        }
        let mut distance = vec![0u32; grid.len()];
        rebuild_distance(&grid, &mask, &mut distance).unwrap();

        for i in 0..5 {
            assert_eq!(
                distance[grid.idx(i, 1, 1)],
                i as u32,
                "distance at x = {}",
                i
            );
        }
    }

    #[test]
    fn test_distance_is_face_metric() {
        // A lone solid voxel in the corner: the opposite corner of a 3-cube
        // is 6 face hops away, not 2 Chebyshev steps.
        let grid = Grid::new(3, 3, 3, 1.0);
        let mut mask = vec![VoxelClass::Pore; grid.len()];
        mask[grid.idx(0, 0, 0)] = VoxelClass::BounceBack;
        let mut distance = vec![0u32; grid.len()];
        rebuild_distance(&grid, &mask, &mut distance).unwrap();

        assert_eq!(distance[grid.idx(2, 2, 2)], 6);
        assert_eq!(distance[grid.idx(0, 0, 0)], 0);
        assert_eq!(distance[grid.idx(1, 0, 0)], 1);
    }
}
