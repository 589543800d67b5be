//! Minimal NPY file access
//!
//! Spike sorter output ships as NumPy `.npy` arrays. Only what the pipeline
//! needs is implemented: one-dimensional integer and float arrays in
//! little-endian C order, format versions 1 and 2. Writing exists so tests
//! and tooling can synthesize sorter output.

use std::path::Path;

use spikeline_core::{Error, Result};

const MAGIC: &[u8] = b"\x93NUMPY";

struct Header {
    descr: String,
    shape: Vec<u64>,
    data_offset: usize,
}

fn malformed(path: &Path, detail: &str) -> Error {
    Error::MissingData(format!("malformed npy file {}: {}", path.display(), detail))
}

fn parse_header(path: &Path, bytes: &[u8]) -> Result<Header> {
    if bytes.len() < 10 || &bytes[..6] != MAGIC {
        return Err(malformed(path, "bad magic"));
    }
    let (header_len, header_start) = match bytes[6] {
        1 => (u16::from_le_bytes([bytes[8], bytes[9]]) as usize, 10),
        2 | 3 => {
            if bytes.len() < 12 {
                return Err(malformed(path, "truncated header length"));
            }
            let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
            (len, 12)
        }
        v => {
            return Err(Error::Unsupported(format!(
                "npy format version {} in {}",
                v,
                path.display()
            )))
        }
    };
    let data_offset = header_start + header_len;
    if bytes.len() < data_offset {
        return Err(malformed(path, "truncated header"));
    }
    let header = std::str::from_utf8(&bytes[header_start..data_offset])
        .map_err(|_| malformed(path, "header is not utf-8"))?;

    let descr = dict_field(header, "descr")
        .and_then(|rest| quoted_value(rest))
        .ok_or_else(|| malformed(path, "missing descr"))?;
    // 1-D data has the same layout either way; parse the key only to
    // validate the header
    match dict_field(header, "fortran_order") {
        Some(rest) if rest.starts_with("True") || rest.starts_with("False") => {}
        _ => return Err(malformed(path, "missing fortran_order")),
    }
    let shape = dict_field(header, "shape")
        .and_then(parse_shape)
        .ok_or_else(|| malformed(path, "missing shape"))?;

    Ok(Header {
        descr,
        shape,
        data_offset,
    })
}

/// Header text following `'key':`, whitespace trimmed
fn dict_field<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let pattern = format!("'{}':", key);
    let start = header.find(&pattern)? + pattern.len();
    Some(header[start..].trim_start())
}

fn quoted_value(rest: &str) -> Option<String> {
    let rest = rest.strip_prefix('\'')?;
    let end = rest.find('\'')?;
    Some(rest[..end].to_string())
}

fn parse_shape(rest: &str) -> Option<Vec<u64>> {
    let rest = rest.strip_prefix('(')?;
    let end = rest.find(')')?;
    let mut dims = Vec::new();
    for part in rest[..end].split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        dims.push(part.parse::<u64>().ok()?);
    }
    Some(dims)
}

fn element_count(path: &Path, header: &Header) -> Result<usize> {
    if header.shape.len() != 1 {
        return Err(Error::Unsupported(format!(
            "expected a one-dimensional array in {}, found shape {:?}",
            path.display(),
            header.shape
        )));
    }
    Ok(header.shape[0] as usize)
}

fn check_len(path: &Path, bytes: &[u8], offset: usize, count: usize, item: usize) -> Result<()> {
    if bytes.len() < offset + count * item {
        return Err(malformed(path, "data shorter than declared shape"));
    }
    Ok(())
}

/// Array shape from the header alone, without reading the data
pub fn read_shape(path: &Path) -> Result<Vec<u64>> {
    let mut file = std::fs::File::open(path)?;
    let mut prefix = [0u8; 12];
    let read = read_up_to(&mut file, &mut prefix)?;
    if read < 10 {
        return Err(malformed(path, "truncated header"));
    }

    let total = match prefix[6] {
        1 => 10 + u16::from_le_bytes([prefix[8], prefix[9]]) as usize,
        2 | 3 if read >= 12 => {
            12 + u32::from_le_bytes([prefix[8], prefix[9], prefix[10], prefix[11]]) as usize
        }
        // let parse_header produce the version error
        _ => read,
    };

    let mut bytes = prefix[..read].to_vec();
    if total > bytes.len() {
        let mut rest = vec![0u8; total - bytes.len()];
        let n = read_up_to(&mut file, &mut rest)?;
        bytes.extend_from_slice(&rest[..n]);
    }
    Ok(parse_header(path, &bytes)?.shape)
}

fn read_up_to(file: &mut std::fs::File, buf: &mut [u8]) -> Result<usize> {
    use std::io::Read;

    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// One-dimensional integer array. Accepts 4- and 8-byte signed and
/// unsigned little-endian element types; unsigned values that overflow
/// i64 are rejected.
pub fn read_1d_i64(path: &Path) -> Result<Vec<i64>> {
    let bytes = std::fs::read(path)?;
    let header = parse_header(path, &bytes)?;
    let count = element_count(path, &header)?;
    let data = &bytes[header.data_offset..];

    let mut out = Vec::with_capacity(count);
    match header.descr.as_str() {
        "<i8" => {
            check_len(path, &bytes, header.data_offset, count, 8)?;
            for chunk in data[..count * 8].chunks_exact(8) {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(chunk);
                out.push(i64::from_le_bytes(buf));
            }
        }
        "<u8" => {
            check_len(path, &bytes, header.data_offset, count, 8)?;
            for chunk in data[..count * 8].chunks_exact(8) {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(chunk);
                let v = u64::from_le_bytes(buf);
                let v = i64::try_from(v)
                    .map_err(|_| malformed(path, "unsigned value overflows i64"))?;
                out.push(v);
            }
        }
        "<i4" => {
            check_len(path, &bytes, header.data_offset, count, 4)?;
            for chunk in data[..count * 4].chunks_exact(4) {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(chunk);
                out.push(i32::from_le_bytes(buf) as i64);
            }
        }
        "<u4" => {
            check_len(path, &bytes, header.data_offset, count, 4)?;
            for chunk in data[..count * 4].chunks_exact(4) {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(chunk);
                out.push(u32::from_le_bytes(buf) as i64);
            }
        }
        other => {
            return Err(Error::Unsupported(format!(
                "integer dtype '{}' in {}",
                other,
                path.display()
            )))
        }
    }
    Ok(out)
}

/// One-dimensional float array, 4- or 8-byte little-endian
pub fn read_1d_f64(path: &Path) -> Result<Vec<f64>> {
    let bytes = std::fs::read(path)?;
    let header = parse_header(path, &bytes)?;
    let count = element_count(path, &header)?;
    let data = &bytes[header.data_offset..];

    let mut out = Vec::with_capacity(count);
    match header.descr.as_str() {
        "<f8" => {
            check_len(path, &bytes, header.data_offset, count, 8)?;
            for chunk in data[..count * 8].chunks_exact(8) {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(chunk);
                out.push(f64::from_le_bytes(buf));
            }
        }
        "<f4" => {
            check_len(path, &bytes, header.data_offset, count, 4)?;
            for chunk in data[..count * 4].chunks_exact(4) {
                let mut buf = [0u8; 4];
                buf.copy_from_slice(chunk);
                out.push(f32::from_le_bytes(buf) as f64);
            }
        }
        other => {
            return Err(Error::Unsupported(format!(
                "float dtype '{}' in {}",
                other,
                path.display()
            )))
        }
    }
    Ok(out)
}

fn write_1d(path: &Path, descr: &str, count: usize, data: &[u8]) -> Result<()> {
    let dict = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': ({},), }}",
        descr, count
    );
    // pad the header so the data starts on a 64-byte boundary
    let unpadded = MAGIC.len() + 4 + dict.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    let header_len = dict.len() + padding + 1;

    let mut bytes = Vec::with_capacity(MAGIC.len() + 4 + header_len + data.len());
    bytes.extend_from_slice(MAGIC);
    bytes.push(1);
    bytes.push(0);
    bytes.extend_from_slice(
        &u16::try_from(header_len)
            .map_err(|_| Error::Internal("npy header too large".to_string()))?
            .to_le_bytes(),
    );
    bytes.extend_from_slice(dict.as_bytes());
    bytes.extend(std::iter::repeat(b' ').take(padding));
    bytes.push(b'\n');
    bytes.extend_from_slice(data);

    std::fs::write(path, bytes)?;
    Ok(())
}

pub fn write_1d_i64(path: &Path, values: &[i64]) -> Result<()> {
    let mut data = Vec::with_capacity(values.len() * 8);
    for v in values {
        data.extend_from_slice(&v.to_le_bytes());
    }
    write_1d(path, "<i8", values.len(), &data)
}

pub fn write_1d_f64(path: &Path, values: &[f64]) -> Result<()> {
    let mut data = Vec::with_capacity(values.len() * 8);
    for v in values {
        data.extend_from_slice(&v.to_le_bytes());
    }
    write_1d(path, "<f8", values.len(), &data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i64_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spike_times.npy");
        let values = vec![3_i64, 15, 900, 30_000_000];

        write_1d_i64(&path, &values).unwrap();
        assert_eq!(read_1d_i64(&path).unwrap(), values);
        assert_eq!(read_shape(&path).unwrap(), vec![4]);
    }

    #[test]
    fn test_f64_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("amplitudes.npy");
        let values = vec![0.5_f64, -1.25, 30000.0];

        write_1d_f64(&path, &values).unwrap();
        assert_eq!(read_1d_f64(&path).unwrap(), values);
    }

    #[test]
    fn test_data_starts_on_aligned_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.npy");
        write_1d_i64(&path, &[1, 2, 3]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
        assert_eq!((10 + header_len) % 64, 0);
        assert_eq!(bytes[10 + header_len - 1], b'\n');
    }

    #[test]
    fn test_narrow_integers_widen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clusters.npy");

        // hand-build a '<u4' file
        let dict = "{'descr': '<u4', 'fortran_order': False, 'shape': (2,), }";
        let unpadded = 6 + 4 + dict.len() + 1;
        let padding = (64 - unpadded % 64) % 64;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"\x93NUMPY\x01\x00");
        bytes.extend_from_slice(&((dict.len() + padding + 1) as u16).to_le_bytes());
        bytes.extend_from_slice(dict.as_bytes());
        bytes.extend(std::iter::repeat(b' ').take(padding));
        bytes.push(b'\n');
        bytes.extend_from_slice(&7_u32.to_le_bytes());
        bytes.extend_from_slice(&4_000_000_000_u32.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();

        assert_eq!(read_1d_i64(&path).unwrap(), vec![7, 4_000_000_000]);
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.npy");
        std::fs::write(&path, b"not an npy file").unwrap();

        let err = read_1d_i64(&path).unwrap_err();
        assert!(matches!(err, Error::MissingData(_)));
    }

    #[test]
    fn test_truncated_data_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.npy");
        write_1d_i64(&path, &[1, 2, 3, 4]).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 8]).unwrap();

        let err = read_1d_i64(&path).unwrap_err();
        assert!(matches!(err, Error::MissingData(_)));
    }
}
