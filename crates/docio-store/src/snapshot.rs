//! Snapshot artifacts
//!
//! A snapshot directory holds a point-in-time copy of one store:
//!
//! ```text
//! <dir>/manifest.json   position, document count, content digest
//! <dir>/documents.dat   header followed by framed document records
//! ```
//!
//! Record format:
//! ```text
//! +--------+------+--------+
//! | Length | Data | CRC32C |
//! | 4B     | var  | 4B     |
//! +--------+------+--------+
//! ```

use crate::document::{Document, now_millis};
use crate::store::StoreImage;
use docio_common::{
    ContentDigest, DigestBuilder, DocId, Error, LogPosition, Result, frame_checksum,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use tracing::debug;

/// Data file magic number
const SNAPSHOT_MAGIC: u32 = 0x4453_4E50; // "DSNP"

/// Current format version
const SNAPSHOT_VERSION: u32 = 1;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const DATA_FILE: &str = "documents.dat";

/// Description of a snapshot directory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub format_version: u32,
    /// Last update included in the snapshot
    pub position: LogPosition,
    pub doc_count: u64,
    pub digest: ContentDigest,
    pub created_at_ms: u64,
}

/// Write `docs` as a snapshot into `dir` (created if missing)
pub fn write_snapshot(
    dir: &Path,
    docs: &BTreeMap<DocId, Document>,
    position: LogPosition,
) -> Result<SnapshotManifest> {
    fs::create_dir_all(dir)?;

    let mut digest = DigestBuilder::new();
    let file = File::create(dir.join(DATA_FILE))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&SNAPSHOT_MAGIC.to_le_bytes())?;
    writer.write_all(&SNAPSHOT_VERSION.to_le_bytes())?;

    for doc in docs.values() {
        let bytes = doc.to_bytes()?;
        let len = u32::try_from(bytes.len())
            .map_err(|_| Error::storage(format!("document {} too large", doc.id())))?;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&bytes)?;
        writer.write_all(&frame_checksum(&bytes).to_le_bytes())?;
        digest.record(&bytes);
    }
    let file = writer
        .into_inner()
        .map_err(|e| Error::DiskIo(e.into_error()))?;
    file.sync_all()?;

    let manifest = SnapshotManifest {
        format_version: SNAPSHOT_VERSION,
        position,
        doc_count: docs.len() as u64,
        digest: digest.finish(),
        created_at_ms: now_millis(),
    };
    let json =
        serde_json::to_vec_pretty(&manifest).map_err(|e| Error::Serialization(e.to_string()))?;
    fs::write(dir.join(MANIFEST_FILE), json)?;

    debug!(
        "Wrote snapshot to {}: {} docs at {}",
        dir.display(),
        manifest.doc_count,
        position
    );
    Ok(manifest)
}

/// Read only the manifest of a snapshot directory
pub fn read_manifest(dir: &Path) -> Result<SnapshotManifest> {
    let bytes = fs::read(dir.join(MANIFEST_FILE))?;
    serde_json::from_slice(&bytes).map_err(|e| Error::Deserialization(e.to_string()))
}

/// Read and verify a snapshot directory
///
/// Every record checksum, the document count and the content digest are
/// checked against the manifest.
pub fn read_snapshot(dir: &Path) -> Result<StoreImage> {
    let manifest = read_manifest(dir)?;
    if manifest.format_version != SNAPSHOT_VERSION {
        return Err(Error::storage(format!(
            "unsupported snapshot version {}",
            manifest.format_version
        )));
    }

    let mut reader = BufReader::new(File::open(dir.join(DATA_FILE))?);
    if read_u32(&mut reader)? != Some(SNAPSHOT_MAGIC) {
        return Err(Error::storage("invalid snapshot magic"));
    }
    if read_u32(&mut reader)? != Some(SNAPSHOT_VERSION) {
        return Err(Error::storage("snapshot data version mismatch"));
    }

    let mut docs = BTreeMap::new();
    let mut digest = DigestBuilder::new();
    while let Some(len) = read_u32(&mut reader)? {
        let mut bytes = vec![0u8; len as usize];
        reader.read_exact(&mut bytes)?;
        let stored = read_u32(&mut reader)?
            .ok_or_else(|| Error::storage("snapshot record truncated"))?;
        if stored != frame_checksum(&bytes) {
            return Err(Error::storage(format!(
                "snapshot record {} checksum mismatch",
                docs.len()
            )));
        }
        digest.record(&bytes);
        let doc = Document::from_bytes(&bytes)?;
        docs.insert(doc.id().clone(), doc);
    }

    let digest = digest.finish();
    if digest != manifest.digest || docs.len() as u64 != manifest.doc_count {
        return Err(Error::storage(format!(
            "snapshot content {digest} does not match manifest {}",
            manifest.digest
        )));
    }

    Ok(StoreImage {
        docs,
        position: manifest.position,
    })
}

/// Read a little-endian u32; `None` at a clean end of file
fn read_u32(reader: &mut impl Read) -> Result<Option<u32>> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(Error::storage("unexpected end of snapshot data"));
        }
        filled += n;
    }
    Ok(Some(u32::from_le_bytes(buf)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample(n: u64) -> BTreeMap<DocId, Document> {
        (1..=n)
            .map(|i| {
                let doc = Document::new(DocId::from(i))
                    .with_field("t1", format!("doc {i}"))
                    .with_field("n_ti", i);
                (doc.id().clone(), doc)
            })
            .collect()
    }

    #[test]
    fn test_write_and_read() {
        let dir = TempDir::new().unwrap();
        let docs = sample(25);
        let manifest = write_snapshot(dir.path(), &docs, LogPosition::new(25, 2)).unwrap();
        assert_eq!(manifest.doc_count, 25);

        let image = read_snapshot(dir.path()).unwrap();
        assert_eq!(image.position, LogPosition::new(25, 2));
        assert_eq!(image.docs, docs);
        assert_eq!(read_manifest(dir.path()).unwrap(), manifest);
    }

    #[test]
    fn test_empty_snapshot() {
        let dir = TempDir::new().unwrap();
        write_snapshot(dir.path(), &BTreeMap::new(), LogPosition::ZERO).unwrap();
        let image = read_snapshot(dir.path()).unwrap();
        assert!(image.docs.is_empty());
    }

    #[test]
    fn test_corruption_detected() {
        let dir = TempDir::new().unwrap();
        write_snapshot(dir.path(), &sample(3), LogPosition::new(3, 1)).unwrap();

        let path = dir.path().join(DATA_FILE);
        let mut data = fs::read(&path).unwrap();
        // Flip a byte inside the first record payload
        data[14] ^= 0x01;
        fs::write(&path, data).unwrap();

        assert!(matches!(read_snapshot(dir.path()), Err(Error::Storage(_))));
    }

    #[test]
    fn test_truncated_file() {
        let dir = TempDir::new().unwrap();
        write_snapshot(dir.path(), &sample(3), LogPosition::new(3, 1)).unwrap();

        let path = dir.path().join(DATA_FILE);
        let data = fs::read(&path).unwrap();
        fs::write(&path, &data[..data.len() - 2]).unwrap();

        assert!(read_snapshot(dir.path()).is_err());
    }
}
