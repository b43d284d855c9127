//! Geometry ingestion: tag files and image stacks.

use std::fs;
use std::path::Path;

use crate::compute::{Grid, VoxelClass};
use crate::schema::MaterialMap;

/// Geometry loading failures; all fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum GeometryError {
    #[error("cannot read geometry {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("geometry entry {position} is not an integer tag: {token}")]
    BadToken { position: usize, token: String },
    #[error("geometry holds {got} tags, domain needs {expected}")]
    WrongCount { got: usize, expected: usize },
    #[error("unknown material tag {tag} at entry {position}")]
    UnknownTag { tag: i32, position: usize },
    #[error("image stack has {got} slices, domain needs {expected}")]
    WrongSliceCount { got: usize, expected: usize },
    #[error("image slice {path} holds {got} pixels, expected {expected}")]
    WrongSliceSize {
        path: String,
        got: usize,
        expected: usize,
    },
}

/// Resolve one material tag to a voxel class.
fn classify(tag: i32, materials: &MaterialMap, position: usize) -> Result<VoxelClass, GeometryError> {
    if tag == materials.pore {
        return Ok(VoxelClass::Pore);
    }
    if tag == materials.solid {
        return Ok(VoxelClass::Solid);
    }
    if tag == materials.bounce_back {
        return Ok(VoxelClass::BounceBack);
    }
    for (m, list) in materials.microbes.iter().enumerate() {
        if list.contains(&tag) {
            return Ok(VoxelClass::Biofilm(m));
        }
    }
    Err(GeometryError::UnknownTag { tag, position })
}

/// Read a whitespace-separated tag file.
///
/// Entry order matches the grid's flat index: x outermost, then z, then y.
pub fn read_tag_file(
    path: &Path,
    grid: &Grid,
    materials: &MaterialMap,
) -> Result<(Vec<VoxelClass>, Vec<i32>), GeometryError> {
    let text = fs::read_to_string(path).map_err(|source| GeometryError::Io {
        path: path.display().to_string(),
        source,
    })?;

    let mut tags = Vec::with_capacity(grid.len());
    for (position, token) in text.split_whitespace().enumerate() {
        let tag: i32 = token.parse().map_err(|_| GeometryError::BadToken {
            position,
            token: token.to_string(),
        })?;
        tags.push(tag);
    }
    if tags.len() != grid.len() {
        return Err(GeometryError::WrongCount {
            got: tags.len(),
            expected: grid.len(),
        });
    }

    let mut mask = Vec::with_capacity(grid.len());
    for (position, &tag) in tags.iter().enumerate() {
        mask.push(classify(tag, materials, position)?);
    }
    Ok((mask, tags))
}

/// Ingest a directory of raw 8-bit slices stacked along x.
///
/// Slices are taken in file-name order, one per x layer, each `ny * nz`
/// bytes ordered z-major to match the grid layout. Pixels below 128 are
/// pore, the rest solid.
pub fn read_image_stack(
    dir: &Path,
    grid: &Grid,
    materials: &MaterialMap,
) -> Result<(Vec<VoxelClass>, Vec<i32>), GeometryError> {
    let mut slices: Vec<_> = fs::read_dir(dir)
        .map_err(|source| GeometryError::Io {
            path: dir.display().to_string(),
            source,
        })?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    slices.sort();

    if slices.len() != grid.nx {
        return Err(GeometryError::WrongSliceCount {
            got: slices.len(),
            expected: grid.nx,
        });
    }

    let slice_len = grid.ny * grid.nz;
    let mut mask = vec![VoxelClass::Pore; grid.len()];
    let mut tags = vec![materials.pore; grid.len()];

    for (i, path) in slices.iter().enumerate() {
        let bytes = fs::read(path).map_err(|source| GeometryError::Io {
            path: path.display().to_string(),
            source,
        })?;
        if bytes.len() != slice_len {
            return Err(GeometryError::WrongSliceSize {
                path: path.display().to_string(),
                got: bytes.len(),
                expected: slice_len,
            });
        }
        for k in 0..grid.nz {
            for j in 0..grid.ny {
                let idx = grid.idx(i, j, k);
                if bytes[k * grid.ny + j] >= 128 {
                    mask[idx] = VoxelClass::Solid;
                    tags[idx] = materials.solid;
                }
            }
        }
    }
    Ok((mask, tags))
}

/// All-pore geometry for runs without a geometry input.
pub fn open_domain(grid: &Grid, materials: &MaterialMap) -> (Vec<VoxelClass>, Vec<i32>) {
    (
        vec![VoxelClass::Pore; grid.len()],
        vec![materials.pore; grid.len()],
    )
}
