//! The binary point-file format.
//!
//! Layout, all little-endian: 4-byte magic `KMPF`, `u32` element type tag
//! (1 = f32, 2 = f64), `u64` row count (points), `u64` column count
//! (features), then `rows * cols` elements stored column-major.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::matrix::Matrix;

pub const MAGIC: [u8; 4] = *b"KMPF";

/// An element type storable in a point file.
pub trait PointElement: Copy + Default {
    const TYPE_TAG: u32;
    fn read_from<R: Read>(r: &mut R) -> std::io::Result<Self>;
    fn write_to<W: Write>(self, w: &mut W) -> std::io::Result<()>;
}

impl PointElement for f32 {
    const TYPE_TAG: u32 = 1;

    fn read_from<R: Read>(r: &mut R) -> std::io::Result<f32> {
        r.read_f32::<LittleEndian>()
    }

    fn write_to<W: Write>(self, w: &mut W) -> std::io::Result<()> {
        w.write_f32::<LittleEndian>(self)
    }
}

impl PointElement for f64 {
    const TYPE_TAG: u32 = 2;

    fn read_from<R: Read>(r: &mut R) -> std::io::Result<f64> {
        r.read_f64::<LittleEndian>()
    }

    fn write_to<W: Write>(self, w: &mut W) -> std::io::Result<()> {
        w.write_f64::<LittleEndian>(self)
    }
}

/// Reads a point file. The file's type tag must match `T`.
/// A truncated file surfaces as `UnexpectedEof` from the header and
/// element reads; that is a malformed input, not an i/o failure.
fn reject_truncation(path: &Path, err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::InvalidArgument(format!("{}: truncated point file", path.display()))
    } else {
        Error::Io(err)
    }
}

pub fn read_points<T: PointElement, P: AsRef<Path>>(path: P) -> Result<Matrix<T>> {
    let path = path.as_ref();
    let mut r = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).map_err(|e| reject_truncation(path, e))?;
    if magic != MAGIC {
        return Err(Error::InvalidArgument(format!(
            "{}: not a point file (bad magic)",
            path.display()
        )));
    }

    let tag = r
        .read_u32::<LittleEndian>()
        .map_err(|e| reject_truncation(path, e))?;
    if tag != T::TYPE_TAG {
        return Err(Error::TypeMismatch(format!(
            "{}: holds element type tag {}, the configuration expects {}",
            path.display(),
            tag,
            T::TYPE_TAG
        )));
    }

    let rows = r
        .read_u64::<LittleEndian>()
        .map_err(|e| reject_truncation(path, e))? as usize;
    let cols = r
        .read_u64::<LittleEndian>()
        .map_err(|e| reject_truncation(path, e))? as usize;
    if rows == 0 || cols == 0 {
        return Err(Error::InvalidArgument(format!(
            "{}: empty matrix ({} x {})",
            path.display(),
            rows,
            cols
        )));
    }

    let mut data = Vec::with_capacity(rows * cols);
    for _ in 0..rows * cols {
        data.push(T::read_from(&mut r).map_err(|e| reject_truncation(path, e))?);
    }
    Ok(Matrix::from_vec(data, rows, cols))
}

/// Writes a point file.
pub fn write_points<T: PointElement, P: AsRef<Path>>(path: P, matrix: &Matrix<T>) -> Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(&MAGIC)?;
    w.write_u32::<LittleEndian>(T::TYPE_TAG)?;
    w.write_u64::<LittleEndian>(matrix.rows() as u64)?;
    w.write_u64::<LittleEndian>(matrix.cols() as u64)?;
    for &v in matrix.data() {
        v.write_to(&mut w)?;
    }
    w.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::path::PathBuf;

    fn tmp_file(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("kmeans-cl-points-{}-{}", std::process::id(), name));
        p
    }

    #[test]
    fn round_trip_f32() {
        let m = Matrix::from_vec(vec![0.0f32, 1.0, 10.0, 11.0], 2, 2);
        let path = tmp_file("rt32.kmpf");
        write_points(&path, &m).unwrap();
        let back: Matrix<f32> = read_points(&path).unwrap();
        assert_eq!(back, m);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_mismatched_type_tag() {
        let m = Matrix::from_vec(vec![1.0f32, 2.0, 3.0], 3, 1);
        let path = tmp_file("tag.kmpf");
        write_points(&path, &m).unwrap();
        match read_points::<f64, _>(&path) {
            Err(Error::TypeMismatch(_)) => {}
            other => panic!("expected TypeMismatch, got {:?}", other.map(|m| m.len())),
        }
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_bad_magic() {
        let path = tmp_file("magic.kmpf");
        std::fs::write(&path, b"nope....").unwrap();
        assert!(matches!(
            read_points::<f32, _>(&path),
            Err(Error::InvalidArgument(_))
        ));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn rejects_truncated_files() {
        let m = Matrix::from_vec(vec![1.0f32, 2.0, 3.0, 4.0], 4, 1);
        let full_path = tmp_file("full.kmpf");
        write_points(&full_path, &m).unwrap();
        let full = std::fs::read(&full_path).unwrap();
        std::fs::remove_file(&full_path).ok();

        // Mid-magic, mid-tag, mid-dims and mid-body cuts must all be
        // reported as malformed input rather than as i/o failures.
        for cut in [2, 6, 12, 20, full.len() - 3] {
            let path = tmp_file(&format!("cut{}.kmpf", cut));
            std::fs::write(&path, &full[..cut]).unwrap();
            match read_points::<f32, _>(&path) {
                Err(Error::InvalidArgument(_)) => {}
                other => panic!(
                    "cut at {}: expected InvalidArgument, got {:?}",
                    cut,
                    other.map(|m| m.len())
                ),
            }
            std::fs::remove_file(&path).ok();
        }
    }
}
