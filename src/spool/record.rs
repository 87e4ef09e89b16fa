//! Binary spool format for geometry records.
//!
//! Layout (little-endian):
//!
//! ```text
//! "GREC" u16 version u16 reserved
//! u32 vertex_count
//!   f64×3 position, u8 flags, [f64×3 normal], [u8×4 color], [f64×2 uv], u32 feature
//! u32 material_count
//!   u32 name_len, name bytes, u8×4 color, u8 has_texture, [u32 len, raw path bytes]
//! u32 surface_count
//!   i32 material (-1 = none), u32 face_count, { u32 n, u32×n indices }
//! ```

use crate::error::{IoContext, Result, TilerError};
use crate::types::{GeometryRecord, Material, Surface, Vertex};
use std::path::{Path, PathBuf};

const MAGIC: &[u8; 4] = b"GREC";
const VERSION: u16 = 1;

const HAS_NORMAL: u8 = 1;
const HAS_COLOR: u8 = 2;
const HAS_UV: u8 = 4;

/// Encode a record into the spool format.
pub fn encode_record(record: &GeometryRecord) -> Vec<u8> {
    let mut out = Vec::with_capacity(16 + record.vertex_count() * 40);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());

    out.extend_from_slice(&(record.vertex_count() as u32).to_le_bytes());
    for v in record.vertices() {
        put_f64s(&mut out, &v.position);
        let flags = (v.normal.is_some() as u8 * HAS_NORMAL)
            | (v.color.is_some() as u8 * HAS_COLOR)
            | (v.uv.is_some() as u8 * HAS_UV);
        out.push(flags);
        if let Some(n) = v.normal {
            put_f64s(&mut out, &n);
        }
        if let Some(c) = v.color {
            out.extend_from_slice(&c);
        }
        if let Some(uv) = v.uv {
            put_f64s(&mut out, &uv);
        }
        out.extend_from_slice(&v.feature.to_le_bytes());
    }

    out.extend_from_slice(&(record.materials.len() as u32).to_le_bytes());
    for m in &record.materials {
        put_str(&mut out, &m.name);
        out.extend_from_slice(&m.color);
        match &m.texture {
            Some(path) => {
                out.push(1);
                put_bytes(&mut out, &path_to_bytes(path));
            }
            None => out.push(0),
        }
    }

    out.extend_from_slice(&(record.surfaces.len() as u32).to_le_bytes());
    for s in &record.surfaces {
        let material = s.material.map(|m| m as i32).unwrap_or(-1);
        out.extend_from_slice(&material.to_le_bytes());
        out.extend_from_slice(&(s.faces.len() as u32).to_le_bytes());
        for face in &s.faces {
            out.extend_from_slice(&(face.len() as u32).to_le_bytes());
            for i in face {
                out.extend_from_slice(&i.to_le_bytes());
            }
        }
    }

    out
}

/// Decode a record from the spool format.
pub fn decode_record(data: &[u8]) -> Result<GeometryRecord> {
    let mut r = Cursor { data, pos: 0 };

    if r.take(4)? != MAGIC {
        return Err(TilerError::Spool("bad geometry spool magic".to_string()));
    }
    let version = r.u16()?;
    if version != VERSION {
        return Err(TilerError::Spool(format!(
            "unsupported geometry spool version {version}"
        )));
    }
    r.u16()?;

    let vertex_count = r.u32()? as usize;
    let mut vertices = Vec::with_capacity(vertex_count.min(data.len() / 29));
    for _ in 0..vertex_count {
        let mut v = Vertex::new(r.f64x3()?);
        let flags = r.u8()?;
        if flags & HAS_NORMAL != 0 {
            v.normal = Some(r.f64x3()?);
        }
        if flags & HAS_COLOR != 0 {
            let c = r.take(4)?;
            v.color = Some([c[0], c[1], c[2], c[3]]);
        }
        if flags & HAS_UV != 0 {
            v.uv = Some([r.f64()?, r.f64()?]);
        }
        v.feature = r.u32()?;
        vertices.push(v);
    }

    let material_count = r.u32()? as usize;
    let mut materials = Vec::with_capacity(material_count.min(1024));
    for _ in 0..material_count {
        let name = r.string()?;
        let c = r.take(4)?;
        let mut material = Material::new(name).with_color([c[0], c[1], c[2], c[3]]);
        if r.u8()? != 0 {
            material.texture = Some(path_from_bytes(r.bytes()?));
        }
        materials.push(material);
    }

    let surface_count = r.u32()? as usize;
    let mut surfaces = Vec::with_capacity(surface_count.min(1024));
    for _ in 0..surface_count {
        let material = r.i32()?;
        let mut surface = Surface::new((material >= 0).then_some(material as usize));
        let face_count = r.u32()? as usize;
        for _ in 0..face_count {
            let n = r.u32()? as usize;
            let mut face = Vec::with_capacity(n.min(64));
            for _ in 0..n {
                face.push(r.u32()?);
            }
            surface.faces.push(face);
        }
        surfaces.push(surface);
    }

    Ok(GeometryRecord::from_parts(vertices, surfaces, materials))
}

/// Write a record spool file.
pub fn write_record_file(path: &Path, record: &GeometryRecord) -> Result<()> {
    std::fs::write(path, encode_record(record)).with_path(path)
}

/// Read a record spool file.
pub fn read_record_file(path: &Path) -> Result<GeometryRecord> {
    let data = std::fs::read(path).with_path(path)?;
    decode_record(&data)
}

fn put_f64s(out: &mut Vec<u8>, values: &[f64]) {
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    put_bytes(out, s.as_bytes());
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

// Unix paths are stored as raw bytes so non-UTF-8 names survive. Elsewhere
// the path must be valid Unicode to round trip.
#[cfg(unix)]
fn path_to_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn path_to_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

#[cfg(unix)]
fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    use std::os::unix::ffi::OsStrExt;
    PathBuf::from(std::ffi::OsStr::from_bytes(bytes))
}

#[cfg(not(unix))]
fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    PathBuf::from(String::from_utf8_lossy(bytes).into_owned())
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.data.len()).ok_or_else(|| {
            TilerError::Spool(format!("geometry spool truncated at byte {}", self.pos))
        })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    fn f64(&mut self) -> Result<f64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(f64::from_le_bytes(buf))
    }

    fn f64x3(&mut self) -> Result<[f64; 3]> {
        Ok([self.f64()?, self.f64()?, self.f64()?])
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let n = self.u32()? as usize;
        self.take(n)
    }

    fn string(&mut self) -> Result<String> {
        Ok(String::from_utf8_lossy(self.bytes()?).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> GeometryRecord {
        let mut rec = GeometryRecord::new();
        let roof = rec.add_material(Material::new("roof").with_color([200, 40, 40, 255]).with_texture("tex/roof.png"));
        rec.add_vertex(Vertex::new([0.0, 0.0, 0.0]).with_normal([0.0, 0.0, 1.0]));
        rec.add_vertex(Vertex::new([1.5, 0.0, 0.0]).with_color([1, 2, 3, 4]));
        rec.add_vertex(Vertex::new([0.0, 2.5, 0.0]).with_uv([0.25, 0.75]));
        rec.add_vertex(Vertex::new([1.0, 1.0, 3.0]));
        rec.add_face(Some(roof), vec![0, 1, 2]);
        rec.add_face(None, vec![0, 1, 3, 2]);
        rec
    }

    #[test]
    fn test_record_survives_spooling() {
        let rec = sample_record();
        let decoded = decode_record(&encode_record(&rec)).unwrap();
        assert_eq!(decoded, rec);
        assert_eq!(decoded.materials[0].texture.as_deref(), Some(Path::new("tex/roof.png")));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_texture_path_survives_spooling() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let raw = OsStr::from_bytes(b"tex/fa\xe7ade.png");
        let mut rec = sample_record();
        rec.materials[0].texture = Some(PathBuf::from(raw));
        let decoded = decode_record(&encode_record(&rec)).unwrap();
        assert_eq!(decoded.materials[0].texture.as_deref(), Some(Path::new(raw)));
    }

    #[test]
    fn test_truncated_spool_is_an_error() {
        let bytes = encode_record(&sample_record());
        let err = decode_record(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, TilerError::Spool(_)));
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = encode_record(&sample_record());
        bytes[0] = b'X';
        assert!(decode_record(&bytes).is_err());
    }
}
