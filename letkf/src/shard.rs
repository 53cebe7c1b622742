//! Scratch shard I/O: the sweep phase's per-column analysis submatrices,
//! written as raw little-endian `f64` so the gather phase can stitch the
//! globe back together without re-running any linear algebra.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use ndarray::Array2;

use crate::error::{Error, Result};

/// Path for one column's scratch shard under `scratch_dir`.
pub fn shard_path(
    scratch_dir: &Path,
    ensnum: u32,
    corenum: u32,
    timestamp: &str,
    lat_idx: usize,
    lon_idx: usize,
) -> PathBuf {
    scratch_dir.join(format!(
        "ens_{ensnum}_core_{corenum}_time_{timestamp}_lat_{lat_idx}_lon_{lon_idx}.bin"
    ))
}

/// Write `matrix` as an 8-byte `(rows: u32, cols: u32)` header followed by
/// its row-major data, little-endian.
pub fn write_shard(path: &Path, matrix: &Array2<f64>) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut writer = BufWriter::new(file);

    let rows = matrix.shape()[0] as u32;
    let cols = matrix.shape()[1] as u32;
    writer.write_all(&rows.to_le_bytes()).map_err(|e| Error::io(path, e))?;
    writer.write_all(&cols.to_le_bytes()).map_err(|e| Error::io(path, e))?;

    for value in matrix.iter() {
        writer.write_all(&value.to_le_bytes()).map_err(|e| Error::io(path, e))?;
    }
    writer.flush().map_err(|e| Error::io(path, e))
}

/// Read a shard written by [`write_shard`]. Returns `Ok(None)` if the file
/// does not exist (callers map that to `Error::MissingShard` with the
/// column/member context they have at hand); any other I/O failure is
/// propagated as `Error::Io`.
pub fn read_shard(path: &Path) -> Result<Option<Array2<f64>>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::io(path, e)),
    };
    let mut reader = BufReader::new(file);

    let mut header = [0u8; 8];
    reader.read_exact(&mut header).map_err(|e| Error::io(path, e))?;
    let rows = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
    let cols = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;

    let mut data = vec![0u8; rows * cols * 8];
    reader.read_exact(&mut data).map_err(|e| Error::io(path, e))?;
    let values: Vec<f64> = data
        .chunks_exact(8)
        .map(|chunk| f64::from_le_bytes(chunk.try_into().unwrap()))
        .collect();

    Array2::from_shape_vec((rows, cols), values)
        .map(Some)
        .map_err(|_| Error::io(path, std::io::Error::new(std::io::ErrorKind::InvalidData, "shard header/body size mismatch")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("letkf_shard_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("test.bin");

        let matrix = Array2::from_shape_vec((3, 2), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        write_shard(&path, &matrix).unwrap();
        let read_back = read_shard(&path).unwrap().unwrap();
        assert_eq!(matrix, read_back);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_shard_returns_none() {
        let path = Path::new("/nonexistent/shard/path/that/does/not/exist.bin");
        assert!(read_shard(path).unwrap().is_none());
    }
}
