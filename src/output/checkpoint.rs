//! Binary checkpoint format.
//!
//! An opaque dump of every lattice, sufficient for bit-exact restart.
//! Written to a temporary file and renamed into place so a crash never
//! leaves a half-written checkpoint behind.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::compute::{Q7, Q19, State, VoxelClass};

/// Magic bytes identifying a checkpoint file.
pub const CHECKPOINT_MAGIC: &[u8; 4] = b"PLCK";

/// Current format version.
pub const CHECKPOINT_VERSION: u16 = 1;

const FLAG_LZ4: u16 = 1;

/// Everything needed to resume a run.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub nx: u32,
    pub ny: u32,
    pub nz: u32,
    pub iteration: u64,
    pub time: f64,
    pub mask_codes: Vec<u8>,
    pub tags: Vec<i32>,
    pub age: Vec<u64>,
    pub f: Vec<f64>,
    pub species_g: Vec<Vec<f64>>,
    pub biomass: Vec<BiomassCheckpoint>,
}

#[derive(Debug, Clone)]
pub struct BiomassCheckpoint {
    pub density: Vec<f64>,
    /// Present for mobile microbes.
    pub lattice_g: Option<Vec<f64>>,
}

/// Voxel class to code: 0 solid, 1 bounce-back, 2 pore, 3 + m biofilm.
pub fn encode_class(class: VoxelClass) -> u8 {
    match class {
        VoxelClass::Solid => 0,
        VoxelClass::BounceBack => 1,
        VoxelClass::Pore => 2,
        VoxelClass::Biofilm(m) => 3 + m as u8,
    }
}

/// Inverse of `encode_class`.
pub fn decode_class(code: u8) -> VoxelClass {
    match code {
        0 => VoxelClass::Solid,
        1 => VoxelClass::BounceBack,
        2 => VoxelClass::Pore,
        m => VoxelClass::Biofilm((m - 3) as usize),
    }
}

fn push_f64s(buf: &mut Vec<u8>, values: &[f64]) {
    for v in values {
        buf.extend_from_slice(&v.to_le_bytes());
    }
}

fn read_f64s(bytes: &[u8], offset: &mut usize, count: usize) -> io::Result<Vec<f64>> {
    let need = count * 8;
    if bytes.len() < *offset + need {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "checkpoint payload truncated",
        ));
    }
    let out = bytes[*offset..*offset + need]
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
        .collect();
    *offset += need;
    Ok(out)
}

fn read_bytes(bytes: &[u8], offset: &mut usize, count: usize) -> io::Result<Vec<u8>> {
    if bytes.len() < *offset + count {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "checkpoint payload truncated",
        ));
    }
    let out = bytes[*offset..*offset + count].to_vec();
    *offset += count;
    Ok(out)
}

#[cfg(feature = "lz4")]
fn pack(payload: Vec<u8>) -> (u16, Vec<u8>) {
    (FLAG_LZ4, lz4_flex::compress_prepend_size(&payload))
}

#[cfg(not(feature = "lz4"))]
fn pack(payload: Vec<u8>) -> (u16, Vec<u8>) {
    (0, payload)
}

fn unpack(flags: u16, body: Vec<u8>) -> io::Result<Vec<u8>> {
    if flags & FLAG_LZ4 == 0 {
        return Ok(body);
    }
    #[cfg(feature = "lz4")]
    {
        lz4_flex::decompress_size_prepended(&body)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }
    #[cfg(not(feature = "lz4"))]
    {
        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "checkpoint is LZ4-compressed but the lz4 feature is disabled",
        ))
    }
}

/// Write an atomic checkpoint of the full state.
pub fn write_checkpoint(path: &Path, state: &State, iteration: u64, time: f64) -> io::Result<()> {
    let n = state.grid.len();
    let mut payload = Vec::with_capacity(n * (1 + 4 + 8 + Q19 * 8));

    payload.extend(state.mask.iter().map(|&c| encode_class(c)));
    for &t in &state.tags {
        payload.extend_from_slice(&t.to_le_bytes());
    }
    for &a in &state.age {
        payload.extend_from_slice(&a.to_le_bytes());
    }
    push_f64s(&mut payload, &state.f);
    for lat in &state.species {
        push_f64s(&mut payload, &lat.g);
    }
    for (m, density) in state.biomass.iter().enumerate() {
        push_f64s(&mut payload, density);
        match &state.biomass_lattices[m] {
            Some(lat) => {
                payload.push(1);
                push_f64s(&mut payload, &lat.g);
            }
            None => payload.push(0),
        }
    }

    let (flags, body) = pack(payload);

    let tmp = path.with_extension("chk.tmp");
    {
        let mut w = BufWriter::new(File::create(&tmp)?);
        w.write_all(CHECKPOINT_MAGIC)?;
        w.write_all(&CHECKPOINT_VERSION.to_le_bytes())?;
        w.write_all(&flags.to_le_bytes())?;
        w.write_all(&(state.grid.nx as u32).to_le_bytes())?;
        w.write_all(&(state.grid.ny as u32).to_le_bytes())?;
        w.write_all(&(state.grid.nz as u32).to_le_bytes())?;
        w.write_all(&(state.species.len() as u32).to_le_bytes())?;
        w.write_all(&(state.biomass.len() as u32).to_le_bytes())?;
        w.write_all(&iteration.to_le_bytes())?;
        w.write_all(&time.to_le_bytes())?;
        w.write_all(&[0u8; 16])?;
        w.write_all(&body)?;
        w.flush()?;
    }
    fs::rename(&tmp, path)
}

/// Read a checkpoint back.
pub fn read_checkpoint(path: &Path) -> io::Result<Checkpoint> {
    let mut r = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != CHECKPOINT_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "invalid checkpoint magic bytes",
        ));
    }

    let mut buf2 = [0u8; 2];
    let mut buf4 = [0u8; 4];
    let mut buf8 = [0u8; 8];

    r.read_exact(&mut buf2)?;
    let version = u16::from_le_bytes(buf2);
    if version != CHECKPOINT_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported checkpoint version {}", version),
        ));
    }

    r.read_exact(&mut buf2)?;
    let flags = u16::from_le_bytes(buf2);

    r.read_exact(&mut buf4)?;
    let nx = u32::from_le_bytes(buf4);
    r.read_exact(&mut buf4)?;
    let ny = u32::from_le_bytes(buf4);
    r.read_exact(&mut buf4)?;
    let nz = u32::from_le_bytes(buf4);
    r.read_exact(&mut buf4)?;
    let n_species = u32::from_le_bytes(buf4) as usize;
    r.read_exact(&mut buf4)?;
    let n_microbes = u32::from_le_bytes(buf4) as usize;
    r.read_exact(&mut buf8)?;
    let iteration = u64::from_le_bytes(buf8);
    r.read_exact(&mut buf8)?;
    let time = f64::from_le_bytes(buf8);
    let mut reserved = [0u8; 16];
    r.read_exact(&mut reserved)?;

    let mut body = Vec::new();
    r.read_to_end(&mut body)?;
    let bytes = unpack(flags, body)?;

    let n = (nx * ny * nz) as usize;
    let mut offset = 0usize;

    let mask_codes = read_bytes(&bytes, &mut offset, n)?;
    let tags = read_bytes(&bytes, &mut offset, n * 4)?
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    let age = read_bytes(&bytes, &mut offset, n * 8)?
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect();
    let f = read_f64s(&bytes, &mut offset, n * Q19)?;

    let mut species_g = Vec::with_capacity(n_species);
    for _ in 0..n_species {
        species_g.push(read_f64s(&bytes, &mut offset, n * Q7)?);
    }

    let mut biomass = Vec::with_capacity(n_microbes);
    for _ in 0..n_microbes {
        let density = read_f64s(&bytes, &mut offset, n)?;
        let has_lattice = read_bytes(&bytes, &mut offset, 1)?[0] == 1;
        let lattice_g = if has_lattice {
            Some(read_f64s(&bytes, &mut offset, n * Q7)?)
        } else {
            None
        };
        biomass.push(BiomassCheckpoint { density, lattice_g });
    }

    Ok(Checkpoint {
        nx,
        ny,
        nz,
        iteration,
        time,
        mask_codes,
        tags,
        age,
        f,
        species_g,
        biomass,
    })
}

impl Checkpoint {
    /// Copy the stored fields back into a freshly allocated state.
    ///
    /// The caller must have allocated `state` with matching dimensions and
    /// field counts; relaxations and the distance field are reinstalled by
    /// the dynamics updater afterwards.
    pub fn apply_to(&self, state: &mut State) -> io::Result<()> {
        let n = state.grid.len();
        if n != self.mask_codes.len()
            || state.species.len() != self.species_g.len()
            || state.biomass.len() != self.biomass.len()
        {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "checkpoint does not match the configured domain",
            ));
        }
        for (idx, &code) in self.mask_codes.iter().enumerate() {
            state.mask[idx] = decode_class(code);
        }
        state.tags.copy_from_slice(&self.tags);
        state.age.copy_from_slice(&self.age);
        state.f.copy_from_slice(&self.f);
        for (lat, g) in state.species.iter_mut().zip(self.species_g.iter()) {
            lat.g.copy_from_slice(g);
        }
        for (m, b) in self.biomass.iter().enumerate() {
            state.biomass[m].copy_from_slice(&b.density);
            match (&mut state.biomass_lattices[m], &b.lattice_g) {
                (Some(lat), Some(g)) => lat.g.copy_from_slice(g),
                (None, None) => {}
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "checkpoint mobility does not match the configuration",
                    ));
                }
            }
        }
        // Refresh every macroscopic cache from the restored distributions.
        state.refresh_flow_moments();
        let mask = state.mask.clone();
        for lat in state.species.iter_mut() {
            lat.refresh_conc(&mask);
        }
        for lat in state.biomass_lattices.iter_mut().flatten() {
            lat.refresh_conc(&mask);
        }
        for m in 0..state.biomass.len() {
            if let Some(lat) = &state.biomass_lattices[m] {
                let conc = lat.conc.clone();
                state.biomass[m].copy_from_slice(&conc);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::{Grid, ScalarLattice};

    fn sample_state() -> State {
        let grid = Grid::new(3, 2, 2, 1e-6);
        let mut mask = vec![VoxelClass::Pore; grid.len()];
        mask[0] = VoxelClass::Solid;
        mask[3] = VoxelClass::Biofilm(0);
        let tags = (0..grid.len() as i32).collect();
        let mut state = State::new(grid, mask.clone(), tags, 2, 2);
        state.f[7] = 0.123;
        state.species[0].g[5] = 0.456;
        state.species[1].g[9] = 0.789;
        state.biomass[0][3] = 42.0;
        state.biomass_lattices[1] = Some(ScalarLattice::uniform(&grid, &mask, 1.5));
        state.biomass[1].copy_from_slice(&state.biomass_lattices[1].as_ref().unwrap().conc.clone());
        state.age[3] = 17;
        state
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let state = sample_state();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.chk");

        write_checkpoint(&path, &state, 1234, 5.25).unwrap();
        let chk = read_checkpoint(&path).unwrap();

        assert_eq!(chk.iteration, 1234);
        assert_eq!(chk.time, 5.25);
        assert_eq!((chk.nx, chk.ny, chk.nz), (3, 2, 2));

        let grid = state.grid;
        let mut restored = State::new(
            grid,
            vec![VoxelClass::Pore; grid.len()],
            vec![0; grid.len()],
            2,
            2,
        );
        restored.biomass_lattices[1] = Some(ScalarLattice::uniform(
            &grid,
            &vec![VoxelClass::Pore; grid.len()],
            0.0,
        ));
        chk.apply_to(&mut restored).unwrap();

        assert_eq!(restored.mask, state.mask);
        assert_eq!(restored.f, state.f);
        assert_eq!(restored.species[0].g, state.species[0].g);
        assert_eq!(restored.species[1].g, state.species[1].g);
        assert_eq!(restored.biomass[0], state.biomass[0]);
        assert_eq!(restored.age[3], 17);
        assert_eq!(
            restored.biomass_lattices[1].as_ref().unwrap().g,
            state.biomass_lattices[1].as_ref().unwrap().g
        );
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.chk");
        fs::write(&path, b"NOPE000000000000").unwrap();
        assert!(read_checkpoint(&path).is_err());
    }

    #[test]
    fn test_no_tmp_file_left_behind() {
        let state = sample_state();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.chk");
        write_checkpoint(&path, &state, 1, 0.0).unwrap();
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty(), "temporary checkpoint not renamed");
    }
}
