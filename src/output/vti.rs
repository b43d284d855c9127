//! VTK ImageData (VTI) field dumps.
//!
//! One scalar per file, ASCII point data, x varying fastest as VTK
//! expects. Paraview-compatible without extensions.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::compute::{Grid, VoxelClass};

fn write_header(w: &mut impl Write, grid: &Grid, scalars: &str) -> io::Result<()> {
    writeln!(w, "<?xml version=\"1.0\"?>")?;
    writeln!(
        w,
        "<VTKFile type=\"ImageData\" version=\"0.1\" byte_order=\"LittleEndian\">"
    )?;
    let extent = format!("0 {} 0 {} 0 {}", grid.nx - 1, grid.ny - 1, grid.nz - 1);
    writeln!(
        w,
        "  <ImageData WholeExtent=\"{extent}\" Origin=\"0 0 0\" Spacing=\"{dx} {dx} {dx}\">",
        extent = extent,
        dx = grid.dx
    )?;
    writeln!(w, "    <Piece Extent=\"{}\">", extent)?;
    writeln!(w, "      <PointData Scalars=\"{}\">", scalars)?;
    Ok(())
}

fn write_footer(w: &mut impl Write) -> io::Result<()> {
    writeln!(w, "      </PointData>")?;
    writeln!(w, "    </Piece>")?;
    writeln!(w, "  </ImageData>")?;
    writeln!(w, "</VTKFile>")?;
    Ok(())
}

fn write_array<F: Fn(usize) -> f64>(
    w: &mut impl Write,
    grid: &Grid,
    name: &str,
    value: F,
) -> io::Result<()> {
    writeln!(
        w,
        "        <DataArray type=\"Float64\" Name=\"{}\" format=\"ascii\">",
        name
    )?;
    // VTK point order: x fastest, then y, then z.
    for k in 0..grid.nz {
        for j in 0..grid.ny {
            write!(w, "          ")?;
            for i in 0..grid.nx {
                write!(w, "{:e} ", value(grid.idx(i, j, k)))?;
            }
            writeln!(w)?;
        }
    }
    writeln!(w, "        </DataArray>")?;
    Ok(())
}

/// Dump one scalar field.
pub fn write_scalar(path: &Path, grid: &Grid, name: &str, data: &[f64]) -> io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    write_header(&mut w, grid, name)?;
    write_array(&mut w, grid, name, |idx| data[idx])?;
    write_footer(&mut w)?;
    w.flush()
}

/// Dump the voxel classification as integer codes.
///
/// 0 solid, 1 bounce-back, 2 pore, 3 + m biofilm of microbe m.
pub fn write_mask(path: &Path, grid: &Grid, mask: &[VoxelClass]) -> io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    write_header(&mut w, grid, "mask")?;
    write_array(&mut w, grid, "mask", |idx| match mask[idx] {
        VoxelClass::Solid => 0.0,
        VoxelClass::BounceBack => 1.0,
        VoxelClass::Pore => 2.0,
        VoxelClass::Biofilm(m) => 3.0 + m as f64,
    })?;
    write_footer(&mut w)?;
    w.flush()
}

/// Dump velocity magnitude and pressure in one file.
pub fn write_flow(
    path: &Path,
    grid: &Grid,
    ux: &[f64],
    uy: &[f64],
    uz: &[f64],
    rho: &[f64],
) -> io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    write_header(&mut w, grid, "velocity_magnitude")?;
    write_array(&mut w, grid, "velocity_magnitude", |idx| {
        (ux[idx] * ux[idx] + uy[idx] * uy[idx] + uz[idx] * uz[idx]).sqrt()
    })?;
    // Lattice pressure p = cs^2 rho.
    write_array(&mut w, grid, "pressure", |idx| rho[idx] / 3.0)?;
    write_footer(&mut w)?;
    w.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_dump_layout() {
        let grid = Grid::new(2, 2, 1, 0.5);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("field.vti");
        // Distinguishable values per voxel.
        let mut data = vec![0.0; grid.len()];
        data[grid.idx(0, 0, 0)] = 1.0;
        data[grid.idx(1, 0, 0)] = 2.0;
        data[grid.idx(0, 1, 0)] = 3.0;
        data[grid.idx(1, 1, 0)] = 4.0;

        write_scalar(&path, &grid, "c", &data).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();

        assert!(text.contains("WholeExtent=\"0 1 0 1 0 0\""));
        assert!(text.contains("Spacing=\"0.5 0.5 0.5\""));
        // x runs fastest: row (j=0) is 1 2, row (j=1) is 3 4.
        let rows: Vec<&str> = text
            .lines()
            .filter(|l| l.trim_start().starts_with(|c: char| c.is_ascii_digit()))
            .collect();
        assert!(rows[0].trim().starts_with("1e0 2e0"), "row 0: {}", rows[0]);
        assert!(rows[1].trim().starts_with("3e0 4e0"), "row 1: {}", rows[1]);
    }

    #[test]
    fn test_mask_codes() {
        let grid = Grid::new(4, 1, 1, 1.0);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mask.vti");
        let mask = vec![
            VoxelClass::Solid,
            VoxelClass::BounceBack,
            VoxelClass::Pore,
            VoxelClass::Biofilm(1),
        ];
        write_mask(&path, &grid, &mask).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("0e0 1e0 2e0 4e0"), "mask row missing: {}", text);
    }
}
