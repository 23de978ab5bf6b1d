//! Binary codec for shard files.
//!
//! All three file kinds share one primitive: little-endian 64-bit ids. The
//! formats carry no header, magic number, or version; the file length
//! terminates the last record.
//!
//! ## Adjacency record (forward map files and `.brf` reverse map files)
//!
//! ```text
//! Offset  Size       Field
//! 0       8          key: i64 LE
//! 8       4          count: i32 LE
//! 12      8 × count  values: i64 LE
//! ```
//!
//! Forward map values are an array (order kept, repeats allowed). Reverse
//! map values are a deduplicated parent set written in ascending order.
//!
//! ## External-reference set (`.ref`)
//!
//! ```text
//! [id: i64 LE] × (file_size / 8)
//! ```

use std::collections::btree_map::Entry;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{AnalysisError, Result};
use crate::shard::types::{AdjacencyMap, ObjectId, ReverseMap};

// ── Constants ───────────────────────────────────────────────────────

/// Encoded size of one id.
pub const ID_SIZE: usize = 8;

/// Encoded size of a record header: key (8) + count (4).
pub const RECORD_HEADER_SIZE: usize = 12;

/// Default primary buffer of [`AdjacencyWriter`] (8 MB).
pub const DEFAULT_WRITE_BUFFER: usize = 8 * 1024 * 1024;

// ── Low-level helpers ───────────────────────────────────────────────

/// Hint the kernel that `file` is about to be read front to back.
///
/// Best-effort: failures are ignored.
#[cfg(target_os = "linux")]
pub fn advise_sequential(file: &File) {
    use std::os::unix::io::AsRawFd;
    unsafe {
        libc::posix_fadvise(file.as_raw_fd(), 0, 0, libc::POSIX_FADV_SEQUENTIAL);
    }
}

#[cfg(not(target_os = "linux"))]
pub fn advise_sequential(_file: &File) {}

/// Write `buf` with a single write call. Fewer bytes written is fatal.
pub fn write_fully<W: Write>(writer: &mut W, buf: &[u8], path: &Path) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    let written = writer.write(buf).map_err(|e| AnalysisError::io(path, e))?;
    if written != buf.len() {
        return Err(AnalysisError::ShortWrite {
            path: path.to_path_buf(),
            expected: buf.len(),
            written,
        });
    }
    Ok(())
}

/// Encoded size of an adjacency file with the given key and value counts.
pub fn encoded_size(keys: usize, values: usize) -> usize {
    keys * RECORD_HEADER_SIZE + values * ID_SIZE
}

fn read_id(bytes: &[u8], offset: usize) -> ObjectId {
    let mut raw = [0u8; ID_SIZE];
    raw.copy_from_slice(&bytes[offset..offset + ID_SIZE]);
    i64::from_le_bytes(raw) as u64
}

fn read_count(bytes: &[u8], offset: usize) -> i32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[offset..offset + 4]);
    i32::from_le_bytes(raw)
}

fn encode_record<'a>(
    buf: &mut Vec<u8>,
    key: ObjectId,
    values: impl ExactSizeIterator<Item = &'a ObjectId>,
    path: &Path,
) -> Result<()> {
    let count = i32::try_from(values.len()).map_err(|_| {
        AnalysisError::invalid_format(path, format!("key {key}: {} values exceed i32", values.len()))
    })?;
    buf.extend_from_slice(&(key as i64).to_le_bytes());
    buf.extend_from_slice(&count.to_le_bytes());
    for &value in values {
        buf.extend_from_slice(&(value as i64).to_le_bytes());
    }
    Ok(())
}

/// Open and memory-map a file. Returns `None` for a zero-length file.
fn map_file(path: &Path) -> Result<Option<Mmap>> {
    let file = File::open(path).map_err(|e| AnalysisError::io(path, e))?;
    let len = file.metadata().map_err(|e| AnalysisError::io(path, e))?.len();
    if len == 0 {
        return Ok(None);
    }
    advise_sequential(&file);
    let mmap = unsafe { Mmap::map(&file) }.map_err(|e| AnalysisError::io(path, e))?;
    Ok(Some(mmap))
}

// ── Adjacency records ───────────────────────────────────────────────

/// Walk every `(key, values)` record in `bytes`.
///
/// Truncated records and negative counts are rejected.
pub fn parse_records<F>(bytes: &[u8], path: &Path, mut on_record: F) -> Result<()>
where
    F: FnMut(ObjectId, &mut dyn Iterator<Item = ObjectId>) -> Result<()>,
{
    let mut offset = 0usize;
    while offset < bytes.len() {
        if bytes.len() - offset < RECORD_HEADER_SIZE {
            return Err(AnalysisError::invalid_format(
                path,
                format!("truncated record header at offset {offset}"),
            ));
        }
        let key = read_id(bytes, offset);
        let count = read_count(bytes, offset + ID_SIZE);
        if count < 0 {
            return Err(AnalysisError::invalid_format(
                path,
                format!("negative value count {count} for key {key}"),
            ));
        }
        let start = offset + RECORD_HEADER_SIZE;
        let end = start + count as usize * ID_SIZE;
        if end > bytes.len() {
            return Err(AnalysisError::invalid_format(
                path,
                format!("record for key {key} runs past end of file"),
            ));
        }

        let mut values = (start..end).step_by(ID_SIZE).map(|o| read_id(bytes, o));
        on_record(key, &mut values)?;
        offset = end;
    }
    Ok(())
}

/// Decode adjacency records from a byte slice into an array-valued map.
pub fn decode_adjacency(bytes: &[u8], path: &Path) -> Result<AdjacencyMap> {
    let mut map = AdjacencyMap::new();
    parse_records(bytes, path, |key, values| match map.entry(key) {
        Entry::Vacant(slot) => {
            slot.insert(values.collect());
            Ok(())
        }
        Entry::Occupied(_) => Err(AnalysisError::invalid_format(
            path,
            format!("duplicate key {key}"),
        )),
    })?;
    Ok(map)
}

/// Read a forward map file (or a reverse map as parent arrays).
pub fn read_adjacency_map(path: &Path) -> Result<AdjacencyMap> {
    match map_file(path)? {
        Some(mmap) => decode_adjacency(&mmap, path),
        None => Ok(AdjacencyMap::new()),
    }
}

/// Read a `.brf` file into a set-valued reverse map.
pub fn read_reverse_map(path: &Path) -> Result<ReverseMap> {
    let mut map = ReverseMap::new();
    if let Some(mmap) = map_file(path)? {
        parse_records(&mmap, path, |key, values| {
            if map.insert(key, values.collect()).is_some() {
                return Err(AnalysisError::invalid_format(path, format!("duplicate key {key}")));
            }
            Ok(())
        })?;
    }
    Ok(map)
}

// ── AdjacencyWriter ─────────────────────────────────────────────────

/// Streaming writer for array-valued maps.
///
/// Records accumulate in a primary buffer of fixed capacity, which is
/// written out whenever the next record does not fit. A record larger than
/// the whole primary buffer is encoded into an extra buffer of its own.
pub struct AdjacencyWriter {
    file: File,
    path: PathBuf,
    buffer: Vec<u8>,
    capacity: usize,
}

impl AdjacencyWriter {
    /// Create (or truncate) `path` with the given primary buffer capacity.
    pub fn create(path: &Path, capacity: usize) -> Result<Self> {
        let file = File::create(path).map_err(|e| AnalysisError::io(path, e))?;
        let capacity = capacity.max(RECORD_HEADER_SIZE);
        Ok(Self {
            file,
            path: path.to_path_buf(),
            buffer: Vec::with_capacity(capacity),
            capacity,
        })
    }

    pub fn push(&mut self, key: ObjectId, values: &[ObjectId]) -> Result<()> {
        let need = encoded_size(1, values.len());
        if self.buffer.len() + need > self.capacity {
            self.flush_buffer()?;
        }
        if need > self.capacity {
            let mut extra = Vec::with_capacity(need);
            encode_record(&mut extra, key, values.iter(), &self.path)?;
            return write_fully(&mut self.file, &extra, &self.path);
        }
        encode_record(&mut self.buffer, key, values.iter(), &self.path)
    }

    fn flush_buffer(&mut self) -> Result<()> {
        write_fully(&mut self.file, &self.buffer, &self.path)?;
        self.buffer.clear();
        Ok(())
    }

    /// Write out whatever is buffered. Consumes self.
    pub fn finish(mut self) -> Result<()> {
        self.flush_buffer()?;
        self.file.flush().map_err(|e| AnalysisError::io(&self.path, e))
    }
}

/// Write an array-valued map through [`AdjacencyWriter`].
pub fn write_adjacency_map(path: &Path, map: &AdjacencyMap, buffer_capacity: usize) -> Result<()> {
    let mut writer = AdjacencyWriter::create(path, buffer_capacity)?;
    for (&key, values) in map {
        writer.push(key, values)?;
    }
    writer.finish()
}

// ── Exact-size writers ──────────────────────────────────────────────

fn write_exact<'a, I, V>(path: &Path, entries: I, size: usize) -> Result<()>
where
    I: Iterator<Item = (ObjectId, V)>,
    V: ExactSizeIterator<Item = &'a ObjectId>,
{
    let mut buf = Vec::with_capacity(size);
    for (key, values) in entries {
        encode_record(&mut buf, key, values, path)?;
    }
    debug_assert_eq!(buf.len(), size);

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| AnalysisError::io(path, e))?;
    write_fully(&mut file, &buf, path)
}

/// Write a reverse map using an exact, precomputed buffer size.
pub fn write_reverse_map(path: &Path, map: &ReverseMap) -> Result<()> {
    let values: usize = map.values().map(|s| s.len()).sum();
    let size = encoded_size(map.len(), values);
    write_exact(path, map.iter().map(|(&k, v)| (k, v.iter())), size)
}

// ── Id sets ─────────────────────────────────────────────────────────

/// Decode a flat id sequence. The length must be a multiple of 8.
pub fn decode_ids(bytes: &[u8], path: &Path) -> Result<Vec<ObjectId>> {
    if bytes.len() % ID_SIZE != 0 {
        return Err(AnalysisError::invalid_format(
            path,
            format!("id file length {} is not a multiple of {ID_SIZE}", bytes.len()),
        ));
    }
    Ok((0..bytes.len())
        .step_by(ID_SIZE)
        .map(|o| read_id(bytes, o))
        .collect())
}

/// Append ids to `buf` as a flat little-endian sequence.
pub fn encode_ids<'a>(buf: &mut Vec<u8>, ids: impl IntoIterator<Item = &'a ObjectId>) {
    for &id in ids {
        buf.extend_from_slice(&(id as i64).to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::tempdir;

    fn sample_map() -> AdjacencyMap {
        let mut map = AdjacencyMap::new();
        map.insert(1, vec![7, 3, 7]);
        map.insert(2, vec![]);
        map.insert(u64::MAX, vec![0, 1]);
        map
    }

    #[test]
    fn test_record_layout_is_little_endian() {
        let mut map = AdjacencyMap::new();
        map.insert(0x0102, vec![0x0A]);
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.dat");
        write_adjacency_map(&path, &map, DEFAULT_WRITE_BUFFER).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[0..8], &[0x02, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[8..12], &[1, 0, 0, 0]);
        assert_eq!(&bytes[12..20], &[0x0A, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_adjacency_roundtrip_keeps_value_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.dat");
        let map = sample_map();
        write_adjacency_map(&path, &map, DEFAULT_WRITE_BUFFER).unwrap();
        assert_eq!(read_adjacency_map(&path).unwrap(), map);
    }

    #[test]
    fn test_small_primary_buffer_spills_into_extra_buffer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.dat");
        let mut map = sample_map();
        map.insert(9, (0..100).collect());
        // 16 bytes only fits a header; every record with values overflows.
        write_adjacency_map(&path, &map, 16).unwrap();
        assert_eq!(read_adjacency_map(&path).unwrap(), map);
    }

    #[test]
    fn test_empty_file_reads_as_empty_map() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("empty.dat");
        std::fs::write(&path, b"").unwrap();
        assert!(read_adjacency_map(&path).unwrap().is_empty());
        assert!(read_reverse_map(&path).unwrap().is_empty());
    }

    #[test]
    fn test_truncated_record_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.dat");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&5i64.to_le_bytes());
        bytes.extend_from_slice(&2i32.to_le_bytes());
        bytes.extend_from_slice(&1i64.to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let err = read_adjacency_map(&path).unwrap_err();
        assert!(matches!(err, AnalysisError::InvalidFormat { .. }), "{err}");
    }

    #[test]
    fn test_negative_count_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.dat");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&5i64.to_le_bytes());
        bytes.extend_from_slice(&(-1i32).to_le_bytes());
        std::fs::write(&path, &bytes).unwrap();

        assert!(read_adjacency_map(&path).is_err());
    }

    #[test]
    fn test_duplicate_key_is_rejected() {
        let mut bytes = Vec::new();
        let path = Path::new("dup.dat");
        encode_record(&mut bytes, 4, [1u64].iter(), path).unwrap();
        encode_record(&mut bytes, 4, [2u64].iter(), path).unwrap();
        assert!(decode_adjacency(&bytes, path).is_err());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempdir().unwrap();
        let err = read_adjacency_map(&dir.path().join("nope.dat")).unwrap_err();
        assert!(matches!(err, AnalysisError::Io { .. }));
    }

    #[test]
    fn test_reverse_map_exact_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("s.brf");
        let mut map = ReverseMap::new();
        map.insert(10, BTreeSet::from([1, 2, 3]));
        map.insert(11, BTreeSet::from([4]));
        write_reverse_map(&path, &map).unwrap();

        let len = std::fs::metadata(&path).unwrap().len() as usize;
        assert_eq!(len, encoded_size(2, 4));
        assert_eq!(read_reverse_map(&path).unwrap(), map);
    }

    #[test]
    fn test_decode_ids_rejects_partial_id() {
        let path = Path::new("x.ref");
        assert!(decode_ids(&[0u8; 12], path).is_err());

        let mut buf = Vec::new();
        encode_ids(&mut buf, &[3, u64::MAX]);
        assert_eq!(decode_ids(&buf, path).unwrap(), vec![3, u64::MAX]);
    }

    #[test]
    fn test_short_write_is_fatal() {
        struct HalfWriter;
        impl Write for HalfWriter {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                Ok(buf.len() / 2)
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let err = write_fully(&mut HalfWriter, &[0u8; 8], Path::new("x")).unwrap_err();
        match err {
            AnalysisError::ShortWrite { expected, written, .. } => {
                assert_eq!(expected, 8);
                assert_eq!(written, 4);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
