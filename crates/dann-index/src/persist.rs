//! On-disk index format.
//!
//! Self-describing little-endian layout:
//!
//! ```text
//! [magic: 8 bytes "DANNIDX\0"]
//! [format version: u32]
//! [index type: u32 length + utf8]
//! [dim: u32] [nlist: u32] [shard_count: u32]
//! [index version counter: u64] [trained: u8]
//! Flat:    [count: u64] [ids: i64 * count] [vectors: f32 * count * dim]
//! IVF:     [centroids: f32 * nlist * dim]
//!          per centroid: [count: u64] [ids: i64 * count] [vectors: f32 * count * dim]
//! ```
//!
//! Loading refuses files whose recorded `dim` disagrees with the caller's
//! index dimension.

use crate::backend::IndexBackend;
use crate::flat::FlatIndex;
use crate::ivf::{DistributedIvfIndex, InvertedList, IvfConfig};
use dann_core::{DannError, IndexType, Result, VectorId};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::info;

const MAGIC: &[u8; 8] = b"DANNIDX\0";
const FORMAT_VERSION: u32 = 1;

/// Serializes a backend plus its index version counter to `path`.
pub fn save(backend: &IndexBackend, index_version: u64, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    let mut w = BufWriter::new(file);

    w.write_all(MAGIC)?;
    w.write_all(&FORMAT_VERSION.to_le_bytes())?;

    let type_name = backend.index_type().to_string();
    w.write_all(&(type_name.len() as u32).to_le_bytes())?;
    w.write_all(type_name.as_bytes())?;

    let dim = backend.dimension() as u32;
    w.write_all(&dim.to_le_bytes())?;

    match backend {
        IndexBackend::Flat(index) => {
            w.write_all(&0u32.to_le_bytes())?; // nlist
            w.write_all(&0u32.to_le_bytes())?; // shard_count
            w.write_all(&index_version.to_le_bytes())?;
            w.write_all(&[1u8])?; // flat is always ready
            w.write_all(&(index.len() as u64).to_le_bytes())?;
            for (id, _) in index.iter() {
                w.write_all(&id.as_i64().to_le_bytes())?;
            }
            for (_, vector) in index.iter() {
                for &v in vector {
                    w.write_all(&v.to_le_bytes())?;
                }
            }
        }
        IndexBackend::Ivf(index) => {
            let nlist = index.nlist() as u32;
            w.write_all(&nlist.to_le_bytes())?;
            w.write_all(&index.shard_count().to_le_bytes())?;
            w.write_all(&index_version.to_le_bytes())?;
            w.write_all(&[u8::from(index.is_trained())])?;
            if index.is_trained() {
                for &v in index.centroids() {
                    w.write_all(&v.to_le_bytes())?;
                }
                for list in index.posting_lists() {
                    w.write_all(&(list.len() as u64).to_le_bytes())?;
                    for &id in list.ids() {
                        w.write_all(&id.as_i64().to_le_bytes())?;
                    }
                    for &v in list.vectors() {
                        w.write_all(&v.to_le_bytes())?;
                    }
                }
            }
        }
    }

    w.flush()?;
    info!(path = %path.display(), "saved index");
    Ok(())
}

/// Deserializes a backend from `path`, validating that the recorded
/// dimension matches `expected_dim`. Returns the backend and its index
/// version counter.
pub fn load(path: &Path, expected_dim: usize) -> Result<(IndexBackend, u64)> {
    let file = File::open(path)?;
    let mut r = BufReader::new(file);

    let mut magic = [0u8; 8];
    r.read_exact(&mut magic)
        .map_err(|_| DannError::Corrupt("file too small for header".into()))?;
    if &magic != MAGIC {
        return Err(DannError::Corrupt("bad magic bytes".into()));
    }

    let format = read_u32(&mut r)?;
    if format != FORMAT_VERSION {
        return Err(DannError::Corrupt(format!(
            "unsupported format version {format}"
        )));
    }

    let name_len = read_u32(&mut r)? as usize;
    if name_len > 64 {
        return Err(DannError::Corrupt("index type name too long".into()));
    }
    let mut name_buf = vec![0u8; name_len];
    r.read_exact(&mut name_buf)
        .map_err(|_| DannError::Corrupt("truncated index type".into()))?;
    let type_name = String::from_utf8(name_buf)
        .map_err(|_| DannError::Corrupt("index type is not utf8".into()))?;
    let index_type: IndexType = type_name
        .parse()
        .map_err(|e: String| DannError::Corrupt(e))?;

    let dim = read_u32(&mut r)? as usize;
    if dim != expected_dim {
        return Err(DannError::BadRequest(format!(
            "index file dimension {dim} does not match configured dimension {expected_dim}"
        )));
    }

    let nlist = read_u32(&mut r)? as usize;
    let shard_count = read_u32(&mut r)?;
    let index_version = read_u64(&mut r)?;
    let trained = read_u8(&mut r)? != 0;

    let backend = match index_type {
        IndexType::Flat => {
            let count = read_u64(&mut r)? as usize;
            let mut ids = Vec::with_capacity(count);
            for _ in 0..count {
                ids.push(VectorId(read_i64(&mut r)?));
            }
            let mut index = FlatIndex::new(dim);
            let mut vector = vec![0.0f32; dim];
            for id in ids {
                read_f32_into(&mut r, &mut vector)?;
                index.add(id, &vector)?;
            }
            IndexBackend::Flat(index)
        }
        IndexType::Ivf => {
            let mut config = IvfConfig::new(dim).with_shard_count(shard_count.max(1));
            if nlist > 0 {
                config = config.with_nlist(nlist);
            }
            if !trained {
                IndexBackend::Ivf(DistributedIvfIndex::new("local", config))
            } else {
                let mut centroids = vec![0.0f32; nlist * dim];
                read_f32_into(&mut r, &mut centroids)?;

                let mut lists = Vec::with_capacity(nlist);
                let mut vector = vec![0.0f32; dim];
                for _ in 0..nlist {
                    let count = read_u64(&mut r)? as usize;
                    let mut ids = Vec::with_capacity(count);
                    for _ in 0..count {
                        ids.push(VectorId(read_i64(&mut r)?));
                    }
                    let mut list = InvertedList::with_capacity(count, dim);
                    for id in ids {
                        read_f32_into(&mut r, &mut vector)?;
                        list.push(id, &vector);
                    }
                    lists.push(list);
                }
                IndexBackend::Ivf(DistributedIvfIndex::from_parts(
                    "local", config, centroids, lists,
                ))
            }
        }
        IndexType::Hnsw => {
            return Err(DannError::Corrupt("HNSW index files are not supported".into()))
        }
    };

    info!(path = %path.display(), index_type = %type_name, "loaded index");
    Ok((backend, index_version))
}

fn read_u8(r: &mut impl Read) -> Result<u8> {
    let mut buf = [0u8; 1];
    r.read_exact(&mut buf)
        .map_err(|_| DannError::Corrupt("truncated file".into()))?;
    Ok(buf[0])
}

fn read_u32(r: &mut impl Read) -> Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)
        .map_err(|_| DannError::Corrupt("truncated file".into()))?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)
        .map_err(|_| DannError::Corrupt("truncated file".into()))?;
    Ok(u64::from_le_bytes(buf))
}

fn read_i64(r: &mut impl Read) -> Result<i64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)
        .map_err(|_| DannError::Corrupt("truncated file".into()))?;
    Ok(i64::from_le_bytes(buf))
}

fn read_f32_into(r: &mut impl Read, out: &mut [f32]) -> Result<()> {
    let mut buf = [0u8; 4];
    for v in out.iter_mut() {
        r.read_exact(&mut buf)
            .map_err(|_| DannError::Corrupt("truncated vector data".into()))?;
        *v = f32::from_le_bytes(buf);
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use dann_core::IndexType;

    #[test]
    fn test_flat_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flat.idx");

        let mut backend = IndexBackend::new(IndexType::Flat, IvfConfig::new(2)).unwrap();
        backend
            .add_batch(&[0.0, 0.0, 3.0, 4.0], &[VectorId(1), VectorId(2)])
            .unwrap();
        save(&backend, 7, &path).unwrap();

        let (loaded, version) = load(&path, 2).unwrap();
        assert_eq!(version, 7);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.index_type(), IndexType::Flat);

        let before = backend.search(&[0.0, 0.0], 2).unwrap();
        let after = loaded.search(&[0.0, 0.0], 2).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_ivf_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ivf.idx");

        let mut backend =
            IndexBackend::new(IndexType::Ivf, IvfConfig::new(2).with_nlist(2)).unwrap();
        let vectors = vec![0.0, 0.0, 0.1, 0.1, 10.0, 10.0, 10.1, 10.1];
        let ids = vec![VectorId(1), VectorId(2), VectorId(3), VectorId(4)];
        backend.add_batch(&vectors, &ids).unwrap();
        save(&backend, 3, &path).unwrap();

        let (loaded, version) = load(&path, 2).unwrap();
        assert_eq!(version, 3);
        assert_eq!(loaded.len(), 4);
        assert!(loaded.is_trained());

        let before = backend.search_with_nprobe(&[0.05, 0.05], 4, 2).unwrap();
        let after = loaded.search_with_nprobe(&[0.05, 0.05], 4, 2).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_dim_mismatch_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dim.idx");

        let mut backend = IndexBackend::new(IndexType::Flat, IvfConfig::new(3)).unwrap();
        backend.add_batch(&[1.0, 2.0, 3.0], &[VectorId(1)]).unwrap();
        save(&backend, 1, &path).unwrap();

        let err = load(&path, 4).unwrap_err();
        assert!(matches!(err, DannError::BadRequest(_)));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.idx");
        std::fs::write(&path, b"NOTANIDX00000000").unwrap();
        let err = load(&path, 2).unwrap_err();
        assert!(matches!(err, DannError::Corrupt(_)));
    }

    #[test]
    fn test_truncated_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trunc.idx");

        let mut backend = IndexBackend::new(IndexType::Flat, IvfConfig::new(2)).unwrap();
        backend.add_batch(&[1.0, 2.0], &[VectorId(1)]).unwrap();
        save(&backend, 1, &path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 4]).unwrap();
        let err = load(&path, 2).unwrap_err();
        assert!(matches!(err, DannError::Corrupt(_)));
    }
}
