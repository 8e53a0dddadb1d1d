use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobLog};

/// Filesystem-backed key/value store used as the default KV engine.
#[derive(Clone)]
pub struct FsKv {
    root: PathBuf,
}

/// In-process key/value store; contents vanish with the last clone.
#[derive(Clone, Default)]
pub struct MemKv {
    map: Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>,
}

/// Minimal key/value interface over byte keys and values.
pub trait Kv: Clone + Send + Sync + 'static {
    /// Get value bytes for `key`, if present.
    fn get(&self, key: &[u8]) -> io::Result<Option<Vec<u8>>>;
    /// Set value bytes for `key`, overwriting if it exists.
    fn put(&self, key: &[u8], val: &[u8]) -> io::Result<()>;
}

/// Serde helpers layered on top of any [`Kv`] implementation.
pub trait KvSerde: Kv {
    /// Deserialize type `T` stored at `key` using `bincode`.
    fn get_t<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>> {
        match self.get(key).with_context(|| format!("kv get {}", key_str(key)))? {
            Some(bytes) => {
                let v = bincode::deserialize::<T>(&bytes)
                    .with_context(|| "bincode deserialize")?;
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }
    /// Serialize `val` with `bincode` and store at `key`.
    fn put_t<T: Serialize>(&self, key: &[u8], val: &T) -> Result<()> {
        let buf = bincode::serialize(val).with_context(|| "bincode serialize")?;
        self.put(key, &buf).with_context(|| format!("kv put {}", key_str(key)))?;
        Ok(())
    }
    /// Deserialize JSON stored at `key`. Used for records carrying free-form
    /// `serde_json::Value`s, which bincode cannot decode.
    fn get_json<T: DeserializeOwned>(&self, key: &[u8]) -> QueueResult<Option<T>> {
        let bytes = self.get(key).map_err(|source| QueueError::Store { key: key_str(key), source })?;
        match bytes {
            Some(b) => serde_json::from_slice(&b)
                .map(Some)
                .map_err(|source| QueueError::Codec { key: key_str(key), source }),
            None => Ok(None),
        }
    }
    /// Serialize `val` as JSON and store at `key`.
    fn put_json<T: Serialize + ?Sized>(&self, key: &[u8], val: &T) -> QueueResult<()> {
        let buf = serde_json::to_vec(val).map_err(|source| QueueError::Codec { key: key_str(key), source })?;
        self.put(key, &buf).map_err(|source| QueueError::Store { key: key_str(key), source })
    }
}
impl<T: Kv> KvSerde for T {}

/// Default KV type exported by this crate (FS-backed).
pub type DefaultKv = FsKv;

/// Open an FS-backed KV rooted at `dir` (created if missing).
pub fn open_default<P: AsRef<Path>>(dir: P) -> Result<DefaultKv> {
    let root = dir.as_ref().to_path_buf();
    fs::create_dir_all(&root)
        .with_context(|| format!("create kv dir {}", root.display()))?;
    Ok(FsKv { root })
}

/// Build a namespaced key as bytes: `"{ns}:{key}"`.
pub fn ns(ns: &str, key: &str) -> Vec<u8> {
    let mut s = String::with_capacity(ns.len() + 1 + key.len());
    s.push_str(ns);
    s.push(':');
    s.push_str(key);
    s.into_bytes()
}

fn key_str(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

/* --------------------- impl FsKv --------------------- */

impl FsKv {
    fn path_for(&self, key: &[u8]) -> PathBuf {
        // Windows-safe: map arbitrary bytes to a hex file name.
        let mut name = String::with_capacity(key.len() * 2);
        for &b in key {
            name.push(hex_digit(b >> 4));
            name.push(hex_digit(b & 0xF));
        }
        self.root.join(name)
    }

    /// Directory holding the store files.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn hex_digit(n: u8) -> char {
    match n {
        0..=9 => (b'0' + n) as char,
        10..=15 => (b'a' + (n - 10)) as char,
        _ => '?',
    }
}

impl Kv for FsKv {
    fn get(&self, key: &[u8]) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)) {
            Ok(buf) => Ok(Some(buf)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn put(&self, key: &[u8], val: &[u8]) -> io::Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Private temp file per write, then rename: concurrent writers of one
        // key never share an inode and readers never see a torn file.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(val)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

/* --------------------- impl MemKv --------------------- */

impl MemKv {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, HashMap<Vec<u8>, Vec<u8>>>> {
        self.map.lock().map_err(|_| io::Error::new(io::ErrorKind::Other, "mem kv poisoned"))
    }
}

impl Kv for MemKv {
    fn get(&self, key: &[u8]) -> io::Result<Option<Vec<u8>>> {
        Ok(self.lock()?.get(key).cloned())
    }

    fn put(&self, key: &[u8], val: &[u8]) -> io::Result<()> {
        self.lock()?.insert(key.to_vec(), val.to_vec());
        Ok(())
    }
}

/* --------------------- job repository --------------------- */

/// Whole-list persistence for jobs and their logs.
///
/// Every mutation is load-all / save-all. Nothing here serializes writers
/// across processes: the last `save_*` wins.
pub trait JobRepo: Send + Sync + 'static {
    /// Every persisted job, in insertion order.
    fn load_jobs(&self) -> QueueResult<Vec<Job>>;
    /// Replace the persisted job list.
    fn save_jobs(&self, jobs: &[Job]) -> QueueResult<()>;
    /// Every persisted log entry, oldest first.
    fn load_logs(&self) -> QueueResult<Vec<JobLog>>;
    /// Replace the persisted log list.
    fn save_logs(&self, logs: &[JobLog]) -> QueueResult<()>;
}

/// [`JobRepo`] storing both lists as JSON documents in a [`Kv`].
#[derive(Clone)]
pub struct KvJobRepo<K: Kv> {
    kv: K,
}

impl<K: Kv> KvJobRepo<K> {
    /// Wrap `kv`.
    pub fn new(kv: K) -> Self {
        Self { kv }
    }

    /// The backing store.
    pub fn kv(&self) -> &K {
        &self.kv
    }
}

fn jobs_key() -> Vec<u8> { ns("jobs", "all") }
fn logs_key() -> Vec<u8> { ns("jobs", "logs") }

impl<K: Kv> JobRepo for KvJobRepo<K> {
    fn load_jobs(&self) -> QueueResult<Vec<Job>> {
        Ok(self.kv.get_json(&jobs_key())?.unwrap_or_default())
    }

    fn save_jobs(&self, jobs: &[Job]) -> QueueResult<()> {
        self.kv.put_json(&jobs_key(), jobs)
    }

    fn load_logs(&self) -> QueueResult<Vec<JobLog>> {
        Ok(self.kv.get_json(&logs_key())?.unwrap_or_default())
    }

    fn save_logs(&self, logs: &[JobLog]) -> QueueResult<()> {
        self.kv.put_json(&logs_key(), logs)
    }
}
