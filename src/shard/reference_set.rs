//! External-reference sets.
//!
//! The external-reference set of a shard holds every id its forward map
//! references but does not itself define. Reducing it against every other
//! shard's key set leaves exactly the ids defined nowhere.
//!
//! A set owns its backing `.ref` file handle for the whole run. Content can
//! be dropped (`unload`) and re-read (`load`) any number of times while the
//! handle stays open, which is what bounds resident memory in the
//! missing-object pipeline.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::config::ObjectIdRange;
use crate::error::{AnalysisError, Result};
use crate::pipeline::CancelToken;
use crate::shard::codec::{decode_ids, encode_ids, write_fully, ID_SIZE};
use crate::shard::types::{AdjacencyMap, ObjectId};

/// Ids referenced by one shard that the shard does not define.
#[derive(Debug)]
pub struct ExternalReferenceSet {
    shard: usize,
    path: PathBuf,
    ids: HashSet<ObjectId>,
    file: Option<File>,
    write_buffer: Option<Vec<u8>>,
    loaded: bool,
    empty: bool,
}

fn open_handle<'a>(slot: &'a mut Option<File>, path: &Path, create: bool) -> Result<&'a mut File> {
    let file = match slot.take() {
        Some(file) => file,
        None => OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(path)
            .map_err(|e| AnalysisError::io(path, e))?,
    };
    Ok(slot.insert(file))
}

impl ExternalReferenceSet {
    /// Derive the set from a forward map.
    ///
    /// Keeps every referenced id that lies in `id_range` and is not a key of
    /// `map`. The result is loaded but not yet written.
    pub fn build(shard: usize, path: &Path, map: &AdjacencyMap, id_range: &ObjectIdRange) -> Self {
        let ids: HashSet<ObjectId> = map
            .values()
            .flatten()
            .copied()
            .filter(|id| id_range.contains(*id) && !map.contains_key(id))
            .collect();
        let empty = ids.is_empty();
        Self {
            shard,
            path: path.to_path_buf(),
            ids,
            file: None,
            write_buffer: None,
            loaded: true,
            empty,
        }
    }

    /// Refer to an existing `.ref` file without reading it yet.
    pub fn open(shard: usize, path: &Path) -> Self {
        Self {
            shard,
            path: path.to_path_buf(),
            ids: HashSet::new(),
            file: None,
            write_buffer: None,
            loaded: false,
            empty: false,
        }
    }

    pub fn shard(&self) -> usize {
        self.shard
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn ids(&self) -> &HashSet<ObjectId> {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    /// Latched once the set has been observed empty; never resets.
    pub fn is_known_empty(&self) -> bool {
        self.empty
    }

    /// Ids in ascending order.
    pub fn sorted_ids(&self) -> Vec<ObjectId> {
        let mut ids: Vec<ObjectId> = self.ids.iter().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Remove every id that `other` defines. Returns how many were removed.
    pub fn reduce(&mut self, other: &AdjacencyMap) -> usize {
        debug_assert!(self.loaded, "reduce on an unloaded reference set");
        let before = self.ids.len();
        if self.ids.len() <= other.len() {
            self.ids.retain(|id| !other.contains_key(id));
        } else {
            for key in other.keys() {
                self.ids.remove(key);
            }
        }
        if self.loaded && self.ids.is_empty() {
            self.empty = true;
        }
        before - self.ids.len()
    }

    /// Read the full backing file into memory.
    ///
    /// With `truncate`, the file is cut to zero length right after reading
    /// so the next `store` rewrites it. A cancellation observed around the
    /// I/O yields `AnalysisError::Cancelled`; any other failure closes the
    /// handle before it is returned.
    pub fn load(&mut self, truncate: bool, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        if let Err(err) = self.read_contents(truncate) {
            self.file = None;
            if cancel.is_cancelled() {
                return Err(AnalysisError::Cancelled);
            }
            return Err(err);
        }
        cancel.check()
    }

    fn read_contents(&mut self, truncate: bool) -> Result<()> {
        let path = self.path.as_path();
        let file = open_handle(&mut self.file, path, false)?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| AnalysisError::io(path, e))?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| AnalysisError::io(path, e))?;
        if truncate {
            file.set_len(0).map_err(|e| AnalysisError::io(path, e))?;
        }

        self.ids = decode_ids(&bytes, path)?.into_iter().collect();
        self.loaded = true;
        if self.ids.is_empty() {
            self.empty = true;
        }
        Ok(())
    }

    /// Write all ids to the backing file, replacing its contents.
    ///
    /// The write buffer is sized lazily to `len × 8` and reused across
    /// calls; the file handle stays open.
    pub fn store(&mut self) -> Result<()> {
        let path = self.path.as_path();
        let needed = self.ids.len() * ID_SIZE;
        let buf = self
            .write_buffer
            .get_or_insert_with(|| Vec::with_capacity(needed));
        buf.clear();
        encode_ids(buf, &self.ids);

        let file = open_handle(&mut self.file, path, true)?;
        file.seek(SeekFrom::Start(0))
            .map_err(|e| AnalysisError::io(path, e))?;
        write_fully(file, buf, path)?;
        file.set_len(buf.len() as u64)
            .map_err(|e| AnalysisError::io(path, e))?;
        Ok(())
    }

    /// Drop in-memory content; the file handle stays open.
    pub fn unload(&mut self) {
        self.ids = HashSet::new();
        self.write_buffer = None;
        self.loaded = false;
    }

    /// Drop content and close the file handle.
    pub fn release(&mut self) {
        self.unload();
        self.file = None;
    }
}
