//! RocksDB-backed record store.
//!
//! Column families:
//! - `records`: bincode-encoded records, LZ4 compressed, keyed by
//!   `<len(partition_key) as u32 BE><partition_key><id>` so one partition's
//!   records are contiguous
//!
//! Conditional replace is a read-compare-write performed under a store-wide
//! write mutex. Reads never take the mutex.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteOptions,
};
use tally_core::{InteractionRecord, RecordKey};

use super::{RecordStore, StoreError};

const CF_RECORDS: &str = "records";

const COLUMN_FAMILIES: &[&str] = &[CF_RECORDS];

/// Width of the partition key length prefix inside a storage key.
const KEY_PREFIX_LEN: usize = 4;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tally_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable record store.
pub struct RocksRecordStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Serializes conditional writes so compare and put are atomic.
    write_lock: Mutex<()>,
}

impl RocksRecordStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened record store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            write_lock: Mutex::new(()),
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);

        // Values are already LZ4 framed
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    /// Path of the database directory.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(CF_RECORDS)
            .ok_or_else(|| StoreError::Database(format!("Column family '{CF_RECORDS}' not found")))
    }

    fn storage_key(key: &RecordKey) -> Vec<u8> {
        let partition = key.partition_key.as_bytes();
        let mut out = Vec::with_capacity(KEY_PREFIX_LEN + partition.len() + key.id.len());
        out.extend_from_slice(&(partition.len() as u32).to_be_bytes());
        out.extend_from_slice(partition);
        out.extend_from_slice(key.id.as_bytes());
        out
    }

    fn parse_storage_key(raw: &[u8]) -> Option<RecordKey> {
        let (prefix, rest) = raw.split_at_checked(KEY_PREFIX_LEN)?;
        let len = u32::from_be_bytes(prefix.try_into().ok()?) as usize;
        let (partition_key, id) = rest.split_at_checked(len)?;
        let partition_key = std::str::from_utf8(partition_key).ok()?;
        let id = std::str::from_utf8(id).ok()?;
        Some(RecordKey::new(id, partition_key))
    }

    fn encode(record: &InteractionRecord) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec(record, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    fn decode(bytes: &[u8]) -> Result<InteractionRecord, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let (record, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(record)
    }

    fn get(&self, key: &RecordKey) -> Result<Option<InteractionRecord>, StoreError> {
        let cf = self.cf()?;
        match self.db.get_cf(cf, Self::storage_key(key))? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &RecordKey, record: &InteractionRecord) -> Result<(), StoreError> {
        let cf = self.cf()?;
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db
            .put_cf_opt(cf, Self::storage_key(key), Self::encode(record)?, &write_opts)?;
        Ok(())
    }
}

impl RecordStore for RocksRecordStore {
    fn read(&self, key: &RecordKey) -> Result<InteractionRecord, StoreError> {
        self.get(key)?.ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    fn conditional_replace(
        &self,
        key: &RecordKey,
        record: &InteractionRecord,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))?;

        let current = self.get(key)?.ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                key: key.clone(),
                expected: expected_version,
                actual: current.version,
            });
        }

        let mut next = record.clone();
        next.version = expected_version + 1;
        self.put(key, &next)?;
        Ok(next.version)
    }

    fn insert(&self, record: InteractionRecord) -> Result<u64, StoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))?;

        let key = record.key();
        if self.get(&key)?.is_some() {
            return Err(StoreError::AlreadyExists(key));
        }
        self.put(&key, &record)?;
        Ok(record.version)
    }

    fn keys(&self) -> Result<Vec<RecordKey>, StoreError> {
        let cf = self.cf()?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (raw, _) = item?;
            match Self::parse_storage_key(&raw) {
                Some(key) => keys.push(key),
                None => log::warn!("Skipping malformed storage key ({} bytes)", raw.len()),
            }
        }
        Ok(keys)
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tally_core::{InteractionField, UserId};

    fn open_temp() -> (tempfile::TempDir, RocksRecordStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RocksRecordStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_open_creates_directory() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
    }

    #[test]
    fn test_insert_read() {
        let (_dir, store) = open_temp();
        let mut record = InteractionRecord::new("opp-1", "2025-01-15");
        record.toggle(InteractionField::Archived, &UserId::new("alice"), Utc::now());
        store.insert(record.clone()).unwrap();

        let loaded = store.read(&record.key()).unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_conditional_replace() {
        let (_dir, store) = open_temp();
        let record = InteractionRecord::new("opp-1", "p");
        let key = record.key();
        store.insert(record.clone()).unwrap();

        assert_eq!(store.conditional_replace(&key, &record, 0).unwrap(), 1);
        assert!(matches!(
            store.conditional_replace(&key, &record, 0),
            Err(StoreError::VersionConflict { actual: 1, .. })
        ));
        assert_eq!(store.read(&key).unwrap().version, 1);
    }

    #[test]
    fn test_missing_record() {
        let (_dir, store) = open_temp();
        let key = RecordKey::new("ghost", "p");
        assert_eq!(store.read(&key), Err(StoreError::NotFound(key.clone())));
        assert_eq!(
            store.conditional_replace(&key, &InteractionRecord::new("ghost", "p"), 0),
            Err(StoreError::NotFound(key))
        );
    }

    #[test]
    fn test_keys_roundtrip_through_storage_key() {
        let (_dir, store) = open_temp();
        store.insert(InteractionRecord::new("b", "2025-01-16")).unwrap();
        store.insert(InteractionRecord::new("a", "2025-01-15")).unwrap();
        let keys = store.keys().unwrap();
        assert_eq!(
            keys,
            vec![RecordKey::new("a", "2025-01-15"), RecordKey::new("b", "2025-01-16")]
        );
    }

    #[test]
    fn test_keys_with_nul_bytes_stay_distinct() {
        let (_dir, store) = open_temp();
        let stored = RecordKey::new("c", "a\0b");
        let lookalike = RecordKey::new("b\0c", "a");
        assert_ne!(RocksRecordStore::storage_key(&stored), RocksRecordStore::storage_key(&lookalike));

        store.insert(InteractionRecord::new("c", "a\0b")).unwrap();
        assert_eq!(store.read(&lookalike), Err(StoreError::NotFound(lookalike.clone())));
        assert_eq!(store.keys().unwrap(), vec![stored]);
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        let key = RecordKey::new("opp-1", "p");
        {
            let store = RocksRecordStore::open(StoreConfig::for_testing(&path)).unwrap();
            store.insert(InteractionRecord::new("opp-1", "p")).unwrap();
            let mut record = store.read(&key).unwrap();
            record.toggle(InteractionField::Saved, &UserId::new("bob"), Utc::now());
            store.conditional_replace(&key, &record, 0).unwrap();
        }
        let store = RocksRecordStore::open(StoreConfig::for_testing(&path)).unwrap();
        let record = store.read(&key).unwrap();
        assert_eq!(record.version, 1);
        assert!(record.is_active(InteractionField::Saved, &UserId::new("bob")));
    }
}
