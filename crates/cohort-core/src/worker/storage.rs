//! Persisted worker state.
//!
//! One storage directory per (worker, dataset) holds everything the worker
//! owns: the dataset metadata, its dictionaries, buckets and CBlocks. Each
//! unit is a single file with a fixed header (magic, version, entry count,
//! xxh3 validity hash) followed by a zstd-compressed bincode body. The whole
//! directory is reloaded at process start; a hash mismatch fails the load.

use crate::concepts::Dataset;
use crate::dictionary::Dictionary;
use crate::error::{Error, Result};
use crate::events::{Bucket, CBlock};
use crate::schema::{BucketId, CBlockId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use xxhash_rust::xxh3::xxh3_64;

const MAGIC: &[u8; 4] = b"CHRT";
const VERSION: u16 = 1;
const ZSTD_LEVEL: i32 = 3;

/// Identity and partition of one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Worker name, unique within the cluster
    pub name: String,
    /// Dataset the worker serves
    pub dataset: String,
    /// Half-open range of bucket numbers this worker is responsible for.
    /// Assigned at import time; rebalancing requires re-import.
    pub bucket_range: (u32, u32),
}

impl WorkerInfo {
    /// Whether this worker owns `bucket`.
    pub fn responsible_for(&self, bucket: u32) -> bool {
        bucket >= self.bucket_range.0 && bucket < self.bucket_range.1
    }
}

/// In-memory image of one worker's persisted state.
pub struct WorkerStorage {
    directory: PathBuf,
    info: WorkerInfo,
    dataset: Arc<Dataset>,
    dictionaries: HashMap<String, Arc<Dictionary>>,
    buckets: HashMap<BucketId, Arc<Bucket>>,
    cblocks: HashMap<CBlockId, Arc<CBlock>>,
}

impl WorkerStorage {
    /// Fresh storage for a new worker.
    pub fn create(directory: impl Into<PathBuf>, info: WorkerInfo, dataset: Dataset) -> Self {
        Self {
            directory: directory.into(),
            info,
            dataset: Arc::new(dataset),
            dictionaries: HashMap::new(),
            buckets: HashMap::new(),
            cblocks: HashMap::new(),
        }
    }

    /// Worker identity.
    pub fn info(&self) -> &WorkerInfo {
        &self.info
    }

    /// Dataset metadata.
    pub fn dataset(&self) -> &Arc<Dataset> {
        &self.dataset
    }

    /// All owned buckets.
    pub fn buckets(&self) -> impl Iterator<Item = &Arc<Bucket>> {
        self.buckets.values()
    }

    /// All owned CBlocks.
    pub fn cblocks(&self) -> impl Iterator<Item = &Arc<CBlock>> {
        self.cblocks.values()
    }

    /// Dictionary by name.
    pub fn dictionary(&self, name: &str) -> Option<&Arc<Dictionary>> {
        self.dictionaries.get(name)
    }

    /// Register a dictionary.
    pub fn add_dictionary(&mut self, dictionary: Arc<Dictionary>) {
        self.dictionaries
            .insert(dictionary.name().to_string(), dictionary);
    }

    /// Register a bucket.
    pub fn add_bucket(&mut self, bucket: Arc<Bucket>) {
        self.buckets.insert(bucket.id(), bucket);
    }

    /// Register a CBlock.
    pub fn add_cblock(&mut self, cblock: Arc<CBlock>) {
        self.cblocks.insert(cblock.id(), cblock);
    }

    /// Drop every bucket and CBlock of an import, ahead of a re-import.
    pub fn remove_import(&mut self, import: crate::schema::ImportId) {
        self.buckets.retain(|id, _| id.import != import);
        self.cblocks.retain(|id, _| id.bucket.import != import);
    }

    /// Write the full state to the storage directory.
    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.directory)?;
        write_unit(&self.directory.join("info.bin"), 1, &self.info)?;
        write_unit(&self.directory.join("dataset.bin"), 1, self.dataset.as_ref())?;

        let mut dictionaries: Vec<&Dictionary> =
            self.dictionaries.values().map(Arc::as_ref).collect();
        dictionaries.sort_by(|a, b| a.name().cmp(b.name()));
        write_unit(
            &self.directory.join("dictionaries.bin"),
            dictionaries.len() as u32,
            &dictionaries,
        )?;

        let mut buckets: Vec<&Bucket> = self.buckets.values().map(Arc::as_ref).collect();
        buckets.sort_by_key(|b| b.id());
        write_unit(
            &self.directory.join("buckets.bin"),
            buckets.len() as u32,
            &buckets,
        )?;

        let mut cblocks: Vec<&CBlock> = self.cblocks.values().map(Arc::as_ref).collect();
        cblocks.sort_by_key(|c| c.id());
        write_unit(
            &self.directory.join("cblocks.bin"),
            cblocks.len() as u32,
            &cblocks,
        )?;

        tracing::info!(
            "saved worker storage {} ({} buckets, {} cblocks, {} dictionaries)",
            self.info.name,
            self.buckets.len(),
            self.cblocks.len(),
            self.dictionaries.len()
        );
        Ok(())
    }

    /// Reload the full state from a storage directory.
    pub fn load(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        let (_, info): (u32, WorkerInfo) = read_unit(&directory.join("info.bin"))?;
        let (_, mut dataset): (u32, Dataset) = read_unit(&directory.join("dataset.bin"))?;
        dataset.rebuild_indexes();

        let (_, mut dictionaries): (u32, Vec<Dictionary>) =
            read_unit(&directory.join("dictionaries.bin"))?;
        let dictionaries: HashMap<String, Arc<Dictionary>> = dictionaries
            .drain(..)
            .map(|mut d| {
                d.rebuild_index();
                (d.name().to_string(), Arc::new(d))
            })
            .collect();

        let (_, buckets): (u32, Vec<Bucket>) = read_unit(&directory.join("buckets.bin"))?;
        let buckets: HashMap<BucketId, Arc<Bucket>> = buckets
            .into_iter()
            .map(|mut b| {
                b.attach_dictionaries(&dictionaries);
                (b.id(), Arc::new(b))
            })
            .collect();

        let (_, cblocks): (u32, Vec<CBlock>) = read_unit(&directory.join("cblocks.bin"))?;
        let cblocks: HashMap<CBlockId, Arc<CBlock>> = cblocks
            .into_iter()
            .map(|c| (c.id(), Arc::new(c)))
            .collect();

        tracing::info!(
            "loaded worker storage {} ({} buckets, {} cblocks, {} dictionaries)",
            info.name,
            buckets.len(),
            cblocks.len(),
            dictionaries.len()
        );

        Ok(Self {
            directory,
            info,
            dataset: Arc::new(dataset),
            dictionaries,
            buckets,
            cblocks,
        })
    }
}

/// Write one storage unit: header + compressed body.
fn write_unit<T: Serialize>(path: &Path, count: u32, value: &T) -> Result<()> {
    let body = bincode::serialize(value)
        .map_err(|e| Error::storage(format!("serializing {}: {e}", path.display())))?;
    let compressed = zstd::encode_all(body.as_slice(), ZSTD_LEVEL)
        .map_err(|e| Error::storage(format!("compressing {}: {e}", path.display())))?;
    let hash = xxh3_64(&compressed);

    let mut file = fs::File::create(path)?;
    file.write_all(MAGIC)?;
    file.write_all(&VERSION.to_le_bytes())?;
    file.write_all(&count.to_le_bytes())?;
    file.write_all(&hash.to_le_bytes())?;
    file.write_all(&compressed)?;
    file.sync_all()?;
    Ok(())
}

/// Read one storage unit, verifying magic, version and validity hash.
fn read_unit<T: DeserializeOwned>(path: &Path) -> Result<(u32, T)> {
    let mut file = fs::File::open(path)?;
    let mut header = [0u8; 4 + 2 + 4 + 8];
    file.read_exact(&mut header)?;

    if &header[..4] != MAGIC {
        return Err(Error::storage(format!("bad magic in {}", path.display())));
    }
    let version = u16::from_le_bytes(header[4..6].try_into().expect("fixed slice"));
    if version != VERSION {
        return Err(Error::storage(format!(
            "unsupported storage version {version} in {}",
            path.display()
        )));
    }
    let count = u32::from_le_bytes(header[6..10].try_into().expect("fixed slice"));
    let stored_hash = u64::from_le_bytes(header[10..18].try_into().expect("fixed slice"));

    let mut compressed = Vec::new();
    file.read_to_end(&mut compressed)?;
    if xxh3_64(&compressed) != stored_hash {
        return Err(Error::storage(format!(
            "validity hash mismatch in {}",
            path.display()
        )));
    }

    let body = zstd::decode_all(compressed.as_slice())
        .map_err(|e| Error::storage(format!("decompressing {}: {e}", path.display())))?;
    let value = bincode::deserialize(&body)
        .map_err(|e| Error::storage(format!("deserializing {}: {e}", path.display())))?;
    Ok((count, value))
}
