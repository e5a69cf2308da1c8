//! Stitch storage contracts: a byte key-value store and a byte set store,
//! plus in-RAM implementations used by tests and single-node runs.

#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use rustc_hash::FxHashMap;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("empty key")]
    EmptyKey,
    #[error("storage backend: {0}")]
    Backend(String),
}

/// Options for [`Kv::set`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Leave an existing value untouched.
    pub skip_if_exists: bool,
    /// Return the value stored under the key before the call.
    pub return_previous: bool,
}

impl SetOptions {
    pub fn skip_if_exists(mut self) -> Self { self.skip_if_exists = true; self }
    pub fn return_previous(mut self) -> Self { self.return_previous = true; self }
}

pub trait Kv: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store `value` under `key`. With `skip_if_exists` the check and the write are atomic.
    fn set(&self, key: &[u8], value: &[u8], opts: SetOptions) -> Result<Option<Vec<u8>>, StorageError>;

    fn delete(&self, key: &[u8]) -> Result<(), StorageError>;

    /// Make buffered writes durable.
    fn flush(&self) -> Result<(), StorageError> { Ok(()) }
}

pub trait SetStore: Send + Sync {
    /// Add a member; adding an existing member is a no-op.
    fn add(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;
    fn all(&self, key: &[u8]) -> Result<Vec<Vec<u8>>, StorageError>;
    fn delete(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;
    /// Remove the whole set.
    fn drop_all(&self, key: &[u8]) -> Result<(), StorageError>;

    fn flush(&self) -> Result<(), StorageError> { Ok(()) }
}

fn check_key(key: &[u8]) -> Result<(), StorageError> {
    if key.is_empty() { Err(StorageError::EmptyKey) } else { Ok(()) }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug, Default)]
pub struct InMemoryKv {
    map: RwLock<FxHashMap<Vec<u8>, Vec<u8>>>,
}

impl InMemoryKv {
    pub fn new() -> Self { Self::default() }
    pub fn len(&self) -> usize { read(&self.map).len() }
    pub fn is_empty(&self) -> bool { read(&self.map).is_empty() }
}

impl Kv for InMemoryKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StorageError> {
        check_key(key)?;
        Ok(read(&self.map).get(key).cloned())
    }

    fn set(&self, key: &[u8], value: &[u8], opts: SetOptions) -> Result<Option<Vec<u8>>, StorageError> {
        check_key(key)?;
        let mut map = write(&self.map);
        let previous = map.get(key).cloned();
        if !(opts.skip_if_exists && previous.is_some()) {
            map.insert(key.to_vec(), value.to_vec());
        }
        Ok(if opts.return_previous { previous } else { None })
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        check_key(key)?;
        write(&self.map).remove(key);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemorySet {
    sets: RwLock<FxHashMap<Vec<u8>, BTreeSet<Vec<u8>>>>,
}

impl InMemorySet {
    pub fn new() -> Self { Self::default() }
    /// Number of non-empty sets.
    pub fn len(&self) -> usize { read(&self.sets).len() }
    pub fn is_empty(&self) -> bool { read(&self.sets).is_empty() }
}

impl SetStore for InMemorySet {
    fn add(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        check_key(key)?;
        let added = write(&self.sets).entry(key.to_vec()).or_default().insert(value.to_vec());
        if !added {
            trace!(key = %String::from_utf8_lossy(key), "set member already present");
        }
        Ok(())
    }

    fn all(&self, key: &[u8]) -> Result<Vec<Vec<u8>>, StorageError> {
        check_key(key)?;
        Ok(read(&self.sets).get(key).map(|s| s.iter().cloned().collect()).unwrap_or_default())
    }

    fn delete(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        check_key(key)?;
        let mut sets = write(&self.sets);
        if let Some(s) = sets.get_mut(key) {
            s.remove(value);
            if s.is_empty() {
                sets.remove(key);
            }
        }
        Ok(())
    }

    fn drop_all(&self, key: &[u8]) -> Result<(), StorageError> {
        check_key(key)?;
        write(&self.sets).remove(key);
        Ok(())
    }
}
