//! The records graph: every extracted archive entry becomes a record
//! object whose payload lives in an SGL, in a spill file, or back in
//! the source archive (offset store).

use memsys::Sgl;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Sgl,
    Disk,
    Offset,
}

enum Store {
    Sgl(Arc<Sgl>),
    Disk(PathBuf),
    Offset,
}

/// One extracted object. `metadata` is the verbatim archive header
/// (one tar block); `offset`, when known, is the payload position in
/// the source shard, enabling the offset store type.
pub struct RecordObj {
    pub size: u64,
    pub metadata: Vec<u8>,
    archive: Option<PathBuf>,
    offset: Option<u64>,
    store: Mutex<Store>,
}

impl RecordObj {
    pub fn in_sgl(sgl: Arc<Sgl>, metadata: Vec<u8>, archive: Option<PathBuf>, offset: Option<u64>) -> Arc<RecordObj> {
        let size = sgl.len() as u64;
        Arc::new(RecordObj {
            size,
            metadata,
            archive,
            offset,
            store: Mutex::new(Store::Sgl(sgl)),
        })
    }

    pub fn on_disk(path: PathBuf, size: u64, metadata: Vec<u8>) -> Arc<RecordObj> {
        Arc::new(RecordObj {
            size,
            metadata,
            archive: None,
            offset: None,
            store: Mutex::new(Store::Disk(path)),
        })
    }

    pub fn at_offset(archive: PathBuf, offset: u64, size: u64, metadata: Vec<u8>) -> Arc<RecordObj> {
        Arc::new(RecordObj {
            size,
            metadata,
            archive: Some(archive),
            offset: Some(offset),
            store: Mutex::new(Store::Offset),
        })
    }

    pub fn metadata_size(&self) -> u64 {
        self.metadata.len() as u64
    }

    pub fn store_kind(&self) -> StoreKind {
        match *self.store.lock().unwrap() {
            Store::Sgl(_) => StoreKind::Sgl,
            Store::Disk(_) => StoreKind::Disk,
            Store::Offset => StoreKind::Offset,
        }
    }

    /// Payload position in the source archive, when extraction ran
    /// over a seekable plain archive.
    pub fn archive_offset(&self) -> Option<(&Path, u64)> {
        match (&self.archive, self.offset) {
            (Some(a), Some(o)) => Some((a.as_path(), o)),
            _ => None,
        }
    }

    /// Move an SGL-backed payload out of memory: back to the source
    /// archive when the offset is known, else to a spill file under
    /// `workdir`. Returns the bytes freed (0 when not SGL-backed).
    /// The conversion is one-way; nothing ever flips back to SGL.
    pub fn spill(&self, workdir: &Path) -> std::io::Result<u64> {
        let mut store = self.store.lock().unwrap();
        let sgl = match &*store {
            Store::Sgl(sgl) => sgl.clone(),
            _ => return Ok(0),
        };

        if self.offset.is_some() {
            *store = Store::Offset;
            return Ok(self.size);
        }

        let path = workdir.join(format!("spill-{}", uuid::Uuid::new_v4().simple()));
        let mut f = std::fs::File::create(&path)?;
        std::io::copy(&mut sgl.reader(), &mut f)?;
        f.sync_all()?;
        *store = Store::Disk(path);
        Ok(self.size)
    }

    /// Open the payload for reading, whatever the store type.
    pub fn payload_reader(&self) -> crate::Result<Box<dyn std::io::Read + Send>> {
        use std::io::{Seek, SeekFrom};
        let store = self.store.lock().unwrap();
        match &*store {
            Store::Sgl(sgl) => Ok(Box::new(sgl.reader())),
            Store::Disk(path) => Ok(Box::new(std::fs::File::open(path)?)),
            Store::Offset => {
                let (archive, offset) = match (&self.archive, self.offset) {
                    (Some(a), Some(o)) => (a, o),
                    _ => return Err(crate::Error::NoContent("offset store without offset".into())),
                };
                let mut f = std::fs::File::open(archive)?;
                f.seek(SeekFrom::Start(offset))?;
                Ok(Box::new(std::io::Read::take(f, self.size)))
            }
        }
    }
}

impl std::fmt::Debug for RecordObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordObj")
            .field("size", &self.size)
            .field("store", &self.store_kind())
            .finish_non_exhaustive()
    }
}

/// One record: a key plus the objects sharing it (e.g. `img.jpg` and
/// `img.cls` extracted from a training shard).
#[derive(Debug, Clone)]
pub struct Record {
    pub key: String,
    pub name: String,
    pub objs: Vec<Arc<RecordObj>>,
}

impl Record {
    pub fn total_size(&self) -> u64 {
        self.objs.iter().map(|o| o.size + o.metadata_size()).sum()
    }
}

/// Ordered, key-deduplicating collection of records.
#[derive(Debug, Default)]
pub struct Records {
    arr: Vec<Record>,
    index: std::collections::HashMap<String, usize>,
}

impl Records {
    pub fn new() -> Records {
        Records::default()
    }

    /// Insert, merging object lists when the key already exists.
    pub fn insert(&mut self, rec: Record) {
        match self.index.get(&rec.key) {
            Some(&i) => self.arr[i].objs.extend(rec.objs),
            None => {
                self.index.insert(rec.key.clone(), self.arr.len());
                self.arr.push(rec);
            }
        }
    }

    pub fn merge(&mut self, other: Records) {
        for rec in other.arr {
            self.insert(rec);
        }
    }

    pub fn len(&self) -> usize {
        self.arr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arr.is_empty()
    }

    pub fn total_objs(&self) -> usize {
        self.arr.iter().map(|r| r.objs.len()).sum()
    }

    pub fn total_size(&self) -> u64 {
        self.arr.iter().map(|r| r.total_size()).sum()
    }

    pub fn all(&self) -> &[Record] {
        &self.arr
    }

    pub fn sort_by_key(&mut self) {
        self.arr.sort_by(|a, b| a.key.cmp(&b.key));
        self.reindex();
    }

    /// Drop the first `n` records, keeping the suffix of length
    /// `max(0, len - n)`.
    pub fn discard_first_entries(&mut self, n: usize) {
        if n >= self.arr.len() {
            self.arr.clear();
        } else {
            self.arr.drain(..n);
        }
        self.reindex();
    }

    /// Consume into the underlying record list, in order.
    pub fn into_records(self) -> Vec<Record> {
        self.arr
    }

    fn reindex(&mut self) {
        self.index = self
            .arr
            .iter()
            .enumerate()
            .map(|(i, r)| (r.key.clone(), i))
            .collect();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use memsys::MemPool;
    use std::io::{Read, Write};

    fn sgl_obj(pool: &Arc<MemPool>, body: &[u8]) -> Arc<RecordObj> {
        let mut sgl = pool.alloc_sgl(body.len());
        sgl.write_all(body).unwrap();
        RecordObj::in_sgl(Arc::new(sgl), vec![0; 512], None, None)
    }

    fn rec(key: &str, objs: Vec<Arc<RecordObj>>) -> Record {
        Record {
            key: key.to_string(),
            name: key.to_string(),
            objs,
        }
    }

    #[test]
    fn insert_dedups_by_key() {
        let pool = MemPool::new();
        let mut records = Records::new();
        records.insert(rec("a", vec![sgl_obj(&pool, b"one")]));
        records.insert(rec("b", vec![sgl_obj(&pool, b"two")]));
        records.insert(rec("a", vec![sgl_obj(&pool, b"three")]));

        assert_eq!(records.len(), 2);
        assert_eq!(records.total_objs(), 3);
        assert_eq!(records.all()[0].objs.len(), 2);
    }

    #[test]
    fn discard_first_entries_keeps_suffix() {
        let pool = MemPool::new();
        let mut records = Records::new();
        for i in 0..5 {
            records.insert(rec(&format!("k{i}"), vec![sgl_obj(&pool, b"x")]));
        }

        records.discard_first_entries(2);
        assert_eq!(records.len(), 3);
        assert_eq!(records.all()[0].key, "k2");

        // Discarding more than remain empties, never panics.
        records.discard_first_entries(10);
        assert!(records.is_empty());
        records.discard_first_entries(1);
        assert!(records.is_empty());
    }

    #[test]
    fn sort_by_key_orders_records() {
        let pool = MemPool::new();
        let mut records = Records::new();
        for key in ["delta", "alpha", "charlie", "bravo"] {
            records.insert(rec(key, vec![sgl_obj(&pool, b"x")]));
        }
        records.sort_by_key();
        let keys: Vec<&str> = records.all().iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, ["alpha", "bravo", "charlie", "delta"]);
    }

    #[test]
    fn spill_sgl_to_disk_and_offset() {
        let pool = MemPool::new();
        let dir = tempfile::tempdir().unwrap();

        // Without a known offset, spilling writes a file.
        let obj = sgl_obj(&pool, b"payload-bytes");
        assert_eq!(obj.store_kind(), StoreKind::Sgl);
        let freed = obj.spill(dir.path()).unwrap();
        assert_eq!(freed, 13);
        assert_eq!(obj.store_kind(), StoreKind::Disk);

        let mut out = Vec::new();
        obj.payload_reader().unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"payload-bytes");

        // Spilling again is a no-op: conversion is one-way.
        assert_eq!(obj.spill(dir.path()).unwrap(), 0);

        // With a known offset the payload goes back to the archive.
        let archive = dir.path().join("src.tar");
        std::fs::write(&archive, b"xxxxHELLOyyyy").unwrap();
        let mut sgl = pool.alloc_sgl(5);
        sgl.write_all(b"HELLO").unwrap();
        let obj = RecordObj::in_sgl(Arc::new(sgl), vec![0; 512], Some(archive), Some(4));
        assert_eq!(obj.spill(dir.path()).unwrap(), 5);
        assert_eq!(obj.store_kind(), StoreKind::Offset);

        let mut out = Vec::new();
        obj.payload_reader().unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"HELLO");
    }
}
