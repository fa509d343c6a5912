use std::fs::File;
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use nalgebra::Vector3;
use ndarray::Array3;
use tracing::info;

use crate::error::{Error, Result};
use crate::volume::{ColorVolume, TruncationBand, VoxelGrid};

const MAGIC: &[u8; 4] = b"SDFV";
const VERSION: u32 = 2;
/// Magic, version, dims, resolution, origin, band and the color flag.
const HEADER_LEN: u64 = 4 + 4 + 3 * 8 + 4 + 3 * 4 + 3 * 4 + 1;
const MAX_CELLS: u64 = 1 << 30;
/// Values decoded per read, so allocation follows the bytes actually present.
const READ_CHUNK: usize = 1 << 16;

/// Payload size in bytes of a grid with `cells` cells.
fn payload_len(cells: u64, has_color: bool) -> u64 {
    cells * if has_color { 6 * 4 } else { 2 * 4 }
}

/// Serializes a grid: a little endian header followed by the distance, weight
/// and (optionally) RGB and color weight arrays in `[x, y, z]` logical order.
pub fn write_volume<W: Write>(grid: &VoxelGrid, writer: &mut W) -> Result<()> {
    let dims = grid.dims();
    let origin = grid.origin();
    let band = grid.band();

    writer.write_all(MAGIC)?;
    writer.write_u32::<LittleEndian>(VERSION)?;
    for dim in dims {
        writer.write_u64::<LittleEndian>(dim as u64)?;
    }
    writer.write_f32::<LittleEndian>(grid.resolution())?;
    for c in origin.iter() {
        writer.write_f32::<LittleEndian>(*c)?;
    }
    writer.write_f32::<LittleEndian>(band.dmin)?;
    writer.write_f32::<LittleEndian>(band.dmax)?;
    writer.write_f32::<LittleEndian>(band.wmax)?;
    writer.write_u8(grid.has_color() as u8)?;

    for distance in grid.distance.iter() {
        writer.write_f32::<LittleEndian>(*distance)?;
    }
    for weight in grid.weight.iter() {
        writer.write_f32::<LittleEndian>(*weight)?;
    }
    if let Some(colors) = grid.color.as_ref() {
        for color in colors.rgb.iter() {
            for c in color.iter() {
                writer.write_f32::<LittleEndian>(*c)?;
            }
        }
        for weight in colors.weight.iter() {
            writer.write_f32::<LittleEndian>(*weight)?;
        }
    }
    Ok(())
}

struct Header {
    dims: [usize; 3],
    resolution: f32,
    origin: Vector3<f32>,
    band: TruncationBand,
    has_color: bool,
    cells: u64,
}

fn read_header<R: Read>(reader: &mut R) -> Result<Header> {
    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::format("not a volume file, bad magic"));
    }
    let version = reader.read_u32::<LittleEndian>()?;
    if version != VERSION {
        return Err(Error::format(format!("unsupported volume version {version}")));
    }

    let mut dims = [0usize; 3];
    let mut cells = 1u64;
    for dim in dims.iter_mut() {
        let value = reader.read_u64::<LittleEndian>()?;
        cells = cells
            .checked_mul(value)
            .filter(|cells| *cells <= MAX_CELLS)
            .ok_or_else(|| Error::format("volume dimensions are too large"))?;
        *dim = usize::try_from(value).map_err(|_| Error::format("volume dimension overflow"))?;
    }

    let resolution = reader.read_f32::<LittleEndian>()?;
    let origin = Vector3::new(
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
        reader.read_f32::<LittleEndian>()?,
    );
    let dmin = reader.read_f32::<LittleEndian>()?;
    let dmax = reader.read_f32::<LittleEndian>()?;
    let wmax = reader.read_f32::<LittleEndian>()?;
    let band = TruncationBand::new(dmin, dmax, wmax).map_err(|err| Error::format(err.to_string()))?;
    let has_color = match reader.read_u8()? {
        0 => false,
        1 => true,
        flag => return Err(Error::format(format!("invalid color flag {flag}"))),
    };

    Ok(Header {
        dims,
        resolution,
        origin,
        band,
        has_color,
        cells,
    })
}

/// Reads `len` floats in bounded chunks. A header claiming more data than the
/// stream holds fails with `UnexpectedEof` before the full buffer exists.
fn read_f32_vec<R: Read>(reader: &mut R, len: usize) -> Result<Vec<f32>> {
    let mut values = Vec::with_capacity(len.min(READ_CHUNK));
    let mut chunk = vec![0f32; READ_CHUNK.min(len)];
    while values.len() < len {
        let n = (len - values.len()).min(READ_CHUNK);
        reader.read_f32_into::<LittleEndian>(&mut chunk[..n])?;
        values.extend_from_slice(&chunk[..n]);
    }
    Ok(values)
}

fn read_array<R: Read>(reader: &mut R, dims: [usize; 3]) -> Result<Array3<f32>> {
    let values = read_f32_vec(reader, dims[0] * dims[1] * dims[2])?;
    Array3::from_shape_vec((dims[0], dims[1], dims[2]), values)
        .map_err(|err| Error::format(err.to_string()))
}

/// Deserializes a grid written by [`write_volume`], validating the header,
/// the payload length and the field invariants.
pub fn read_volume<R: Read>(reader: &mut R) -> Result<VoxelGrid> {
    let header = read_header(reader).map_err(truncated)?;
    let dims = header.dims;

    let distance = read_array(reader, dims).map_err(truncated)?;
    let weight = read_array(reader, dims).map_err(truncated)?;
    let color = if header.has_color {
        let values = read_f32_vec(reader, header.cells as usize * 3).map_err(truncated)?;
        let rgb = Array3::from_shape_fn((dims[0], dims[1], dims[2]), |(i, j, k)| {
            let n = ((i * dims[1] + j) * dims[2] + k) * 3;
            Vector3::new(values[n], values[n + 1], values[n + 2])
        });
        let weight = read_array(reader, dims).map_err(truncated)?;
        Some(ColorVolume { rgb, weight })
    } else {
        None
    };

    let mut rest = [0u8; 1];
    if reader.read(&mut rest)? != 0 {
        return Err(Error::format("trailing data after volume payload"));
    }

    let grid = VoxelGrid::from_parts(
        distance,
        weight,
        color,
        header.resolution,
        header.origin,
        header.band,
    )?;
    if !grid.check_invariants() {
        return Err(Error::format("volume values fall outside the truncation band"));
    }
    Ok(grid)
}

fn truncated(err: Error) -> Error {
    match err {
        Error::Io(io) if io.kind() == ErrorKind::UnexpectedEof => {
            Error::format("volume file is truncated")
        }
        other => other,
    }
}

/// Writes the grid to `path`.
pub fn save_volume<P: AsRef<Path>>(grid: &VoxelGrid, path: P) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path.as_ref())?);
    write_volume(grid, &mut writer)?;
    writer.flush()?;
    info!(path = %path.as_ref().display(), dims = ?grid.dims(), "saved volume");
    Ok(())
}

/// Reads a grid from `path`. The file size is checked against the header
/// before any payload is allocated.
pub fn load_volume<P: AsRef<Path>>(path: P) -> Result<VoxelGrid> {
    let file = File::open(path.as_ref())?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let header = read_header(&mut reader).map_err(truncated)?;
    if file_len != HEADER_LEN + payload_len(header.cells, header.has_color) {
        return Err(Error::format(format!(
            "volume file has {file_len} bytes, header implies {}",
            HEADER_LEN + payload_len(header.cells, header.has_color)
        )));
    }

    let file = File::open(path.as_ref())?;
    let grid = read_volume(&mut BufReader::new(file))?;
    info!(path = %path.as_ref().display(), dims = ?grid.dims(), "loaded volume");
    Ok(grid)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::unit_test::{colored_planar_grid, planar_grid};

    fn assert_bit_exact(a: &VoxelGrid, b: &VoxelGrid) {
        assert_eq!(a.dims(), b.dims());
        assert_eq!(a.resolution().to_bits(), b.resolution().to_bits());
        assert_eq!(a.origin(), b.origin());
        assert_eq!(a.band(), b.band());
        for (x, y) in a.distance.iter().zip(b.distance.iter()) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
        for (x, y) in a.weight.iter().zip(b.weight.iter()) {
            assert_eq!(x.to_bits(), y.to_bits());
        }
        assert_eq!(a.color, b.color);
    }

    #[rstest]
    fn should_round_trip_in_memory(planar_grid: VoxelGrid) {
        let mut buffer = Vec::new();
        write_volume(&planar_grid, &mut buffer).unwrap();
        assert_eq!(
            buffer.len() as u64,
            HEADER_LEN + payload_len(planar_grid.len() as u64, false)
        );

        let loaded = read_volume(&mut buffer.as_slice()).unwrap();
        assert_bit_exact(&planar_grid, &loaded);
    }

    #[test]
    fn should_round_trip_colors_through_file() {
        let grid = colored_planar_grid();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.sdfv");
        save_volume(&grid, &path).unwrap();

        let loaded = load_volume(&path).unwrap();
        assert!(loaded.has_color());
        assert_bit_exact(&grid, &loaded);
    }

    #[rstest]
    fn should_reject_truncated_file(planar_grid: VoxelGrid) {
        let mut buffer = Vec::new();
        write_volume(&planar_grid, &mut buffer).unwrap();
        buffer.truncate(buffer.len() - 7);

        assert!(matches!(
            read_volume(&mut buffer.as_slice()),
            Err(Error::Format(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truncated.sdfv");
        std::fs::write(&path, &buffer).unwrap();
        assert!(matches!(load_volume(&path), Err(Error::Format(_))));
    }

    #[rstest]
    fn should_reject_oversized_header_without_allocating(planar_grid: VoxelGrid) {
        let mut buffer = Vec::new();
        write_volume(&planar_grid, &mut buffer).unwrap();
        buffer.truncate(HEADER_LEN as usize + 100);
        // 1024^3 cells, within the cell limit but far beyond the payload.
        for axis in 0..3 {
            let start = 8 + axis * 8;
            buffer[start..start + 8].copy_from_slice(&1024u64.to_le_bytes());
        }

        assert!(matches!(
            read_volume(&mut buffer.as_slice()),
            Err(Error::Format(_))
        ));
    }

    #[test]
    fn should_reject_bad_magic() {
        let mut data: &[u8] = b"PLY\n0000000000000000";
        assert!(matches!(read_volume(&mut data), Err(Error::Format(_))));
    }

    #[test]
    fn should_fail_on_missing_file() {
        assert!(matches!(
            load_volume("/nonexistent/dir/grid.sdfv"),
            Err(Error::Io(_))
        ));
    }
}
