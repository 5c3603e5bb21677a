//! Two-tier keyed tensor storage.
//!
//! A [`TensorStore`] keeps tensors in memory until a configurable byte budget
//! would be exceeded, after which tensors are moved to an on-disk
//! [`Overflow`] tier. Every key lives in exactly one tier at a time; writing a
//! key replaces its previous value wherever that value was held.
//!
//! Which tensor goes to disk when the budget is reached is governed by
//! [`EvictionPolicy`]:
//! - [`SpillOldest`][EvictionPolicy::SpillOldest] moves resident tensors to
//!   disk in the order they were written until the incoming tensor fits.
//! - [`SpillIncoming`][EvictionPolicy::SpillIncoming] leaves resident
//!   tensors alone and sends the incoming tensor straight to disk.
//!
//! In either case, a single tensor larger than the whole budget always goes to
//! disk and is reported with a warning.

use std::{
    collections::BTreeMap,
    io,
    path::{ Path, PathBuf },
};
use rustc_hash::FxHashMap as HashMap;
use serde::{ Deserialize, Serialize };
use thiserror::Error;
use tracing::{ debug, warn };
use crate::{
    env::Side,
    overflow::Overflow,
    tensor::{ nbytes, Tensor },
};

#[derive(Debug, Error)]
pub enum StoreError {
    /// Returned when a key has no value in either tier.
    #[error("no tensor stored under {key}")]
    NotFound { key: Key },

    /// Returned when an overflow shape record cannot be decoded.
    #[error("corrupt shape record for {key}")]
    CorruptShape { key: Key },

    /// Returned when an overflow payload does not match its shape record.
    #[error("corrupt payload for {key}: expected {expected} bytes, found {found}")]
    CorruptPayload { key: Key, expected: u64, found: u64 },

    /// I/O error while reading or writing an overflow file.
    #[error("i/o error on {key}: {source}")]
    Io { key: Key, source: io::Error },

    /// I/O error reported asynchronously by the background writer.
    #[error("background flush failed on {key}: {source}")]
    FlushFailed { key: Key, source: io::Error },

    /// Returned when the background writer has exited unexpectedly.
    #[error("background writer is no longer running")]
    DeadFlusher,

    /// I/O error while creating the overflow namespace.
    #[error("could not set up overflow directory: {0}")]
    Setup(io::Error),
}
use StoreError::*;
pub type StoreResult<T> = Result<T, StoreError>;

/// Identifies a tensor held by a store.
///
/// Site tensors, bond spectra, and environment blocks occupy disjoint
/// namespaces, both in memory and on disk.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Key {
    /// MPS site tensor.
    Site(usize),
    /// Singular values on the bond to the right of a site.
    Bond(usize),
    /// Accumulated environment block.
    Env(Side, usize),
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Site(i) => write!(f, "site {i}"),
            Self::Bond(i) => write!(f, "bond {i}"),
            Self::Env(side, i) => write!(f, "{side} environment {i}"),
        }
    }
}

/// The tier holding a particular key.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Tier {
    Resident,
    Overflow,
}

/// Decides which tensor is moved to disk when the memory budget is reached.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Move the earliest-written resident tensors to disk.
    #[default]
    SpillOldest,
    /// Send the incoming tensor to disk.
    SpillIncoming,
}

/// Settings for a [`TensorStore`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory under which per-run overflow namespaces are created.
    pub root: PathBuf,
    /// Memory budget in bytes for the resident tier.
    pub budget_bytes: usize,
    /// Eviction policy applied when the budget is reached.
    pub eviction: EvictionPolicy,
    /// Hand overflow writes to a background thread.
    pub background_flush: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: std::env::temp_dir(),
            budget_bytes: 4 << 30,
            eviction: EvictionPolicy::default(),
            background_flush: false,
        }
    }
}

/// Common interface to a storage tier.
pub trait Backend {
    /// Store `tensor` under `key`, replacing any previous value.
    fn put(&mut self, key: Key, tensor: Tensor) -> StoreResult<()>;

    /// Retrieve a copy of the tensor under `key`, if present.
    fn get(&self, key: &Key) -> StoreResult<Option<Tensor>>;

    /// Delete `key`, returning `true` if it was present.
    fn remove(&mut self, key: &Key) -> StoreResult<bool>;

    /// Return `true` if `key` is present.
    fn contains(&self, key: &Key) -> bool;

    /// Number of stored keys.
    fn len(&self) -> usize;

    /// Return `true` if no keys are stored.
    fn is_empty(&self) -> bool { self.len() == 0 }
}

/// In-memory tier, tracking write order and the total size of its contents.
#[derive(Clone, Debug, Default)]
pub struct Resident {
    data: HashMap<Key, (u64, Tensor)>,
    order: BTreeMap<u64, Key>,
    bytes: usize,
    counter: u64,
}

impl Resident {
    /// Total number of bytes held.
    pub fn bytes(&self) -> usize { self.bytes }

    /// Borrow the earliest-written tensor.
    pub fn oldest(&self) -> Option<(Key, &Tensor)> {
        let (_, key) = self.order.first_key_value()?;
        self.data.get(key).map(|(_, t)| (*key, t))
    }

    /// Remove and return the tensor under `key`.
    pub fn take(&mut self, key: &Key) -> Option<Tensor> {
        let (k, tensor) = self.data.remove(key)?;
        self.order.remove(&k);
        self.bytes -= nbytes(&tensor);
        Some(tensor)
    }
}

impl Backend for Resident {
    fn put(&mut self, key: Key, tensor: Tensor) -> StoreResult<()> {
        self.remove(&key)?;
        self.counter += 1;
        self.bytes += nbytes(&tensor);
        self.order.insert(self.counter, key);
        self.data.insert(key, (self.counter, tensor));
        Ok(())
    }

    fn get(&self, key: &Key) -> StoreResult<Option<Tensor>> {
        Ok(self.data.get(key).map(|(_, t)| t.clone()))
    }

    fn remove(&mut self, key: &Key) -> StoreResult<bool> {
        Ok(self.take(key).is_some())
    }

    fn contains(&self, key: &Key) -> bool { self.data.contains_key(key) }

    fn len(&self) -> usize { self.data.len() }
}

impl Backend for Overflow {
    fn put(&mut self, key: Key, tensor: Tensor) -> StoreResult<()> {
        Overflow::put(self, key, tensor)
    }

    fn get(&self, key: &Key) -> StoreResult<Option<Tensor>> {
        Overflow::get(self, key)
    }

    fn remove(&mut self, key: &Key) -> StoreResult<bool> {
        Overflow::remove(self, key)
    }

    fn contains(&self, key: &Key) -> bool { Overflow::contains(self, key) }

    fn len(&self) -> usize { Overflow::len(self) }
}

/// Snapshot of a store's occupancy.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct StoreUsage {
    /// Bytes held in memory.
    pub resident_bytes: usize,
    /// Number of keys held in memory.
    pub resident_count: usize,
    /// Number of keys held on disk.
    pub overflow_count: usize,
    /// Configured memory budget.
    pub budget_bytes: usize,
    /// Number of tensors moved to disk so far.
    pub spills: usize,
}

/// Keyed tensor storage with a memory budget and disk overflow.
pub struct TensorStore {
    budget: usize,
    eviction: EvictionPolicy,
    resident: Resident,
    overflow: Overflow,
    spills: usize,
}

impl TensorStore {
    /// Create a new, empty store.
    ///
    /// `label` is used to name the overflow namespace so that, e.g., MPS and
    /// environment data from the same run can be told apart on disk.
    pub fn new(config: &StoreConfig, label: &str) -> StoreResult<Self> {
        let overflow
            = Overflow::new(&config.root, label, config.background_flush)?;
        Ok(Self {
            budget: config.budget_bytes,
            eviction: config.eviction,
            resident: Resident::default(),
            overflow,
            spills: 0,
        })
    }

    /// Path of the on-disk namespace.
    pub fn namespace(&self) -> &Path { self.overflow.path() }

    /// Store `tensor` under `key`, replacing any previous value in either
    /// tier, and return the tier it was placed in.
    ///
    /// If the write fails, no tensor held in memory before the call is lost.
    pub fn write(&mut self, key: Key, tensor: Tensor) -> StoreResult<Tier> {
        self.overflow.check()?;
        let previous = self.resident.take(&key);
        let placed = self.place(key, tensor);
        if placed.is_err() {
            if let Some(t) = previous { self.resident.put(key, t)?; }
        }
        placed
    }

    fn place(&mut self, key: Key, tensor: Tensor) -> StoreResult<Tier> {
        let size = nbytes(&tensor);
        if size > self.budget {
            warn!(
                %key, bytes = size, budget = self.budget,
                "tensor exceeds the memory budget on its own; writing to disk",
            );
            self.overflow.put(key, tensor)?;
            self.spills += 1;
            return Ok(Tier::Overflow);
        }
        match self.eviction {
            EvictionPolicy::SpillIncoming => {
                if self.resident.bytes() + size > self.budget {
                    debug!(%key, bytes = size, "budget reached; spilling incoming");
                    self.overflow.put(key, tensor)?;
                    self.spills += 1;
                    return Ok(Tier::Overflow);
                }
            },
            EvictionPolicy::SpillOldest => {
                while self.resident.bytes() + size > self.budget {
                    let Some((old, t)) = self.resident.oldest()
                        else { break; };
                    let t = t.clone();
                    debug!(key = %old, bytes = nbytes(&t), "budget reached; spilling oldest");
                    // only drop the resident copy once the disk copy exists
                    self.overflow.put(old, t)?;
                    self.resident.remove(&old)?;
                    self.spills += 1;
                }
            },
        }
        self.overflow.remove(&key)?;
        self.resident.put(key, tensor)?;
        Ok(Tier::Resident)
    }

    /// Retrieve a copy of the tensor under `key`.
    pub fn read(&self, key: &Key) -> StoreResult<Tensor> {
        self.overflow.check()?;
        if let Some(t) = self.resident.get(key)? { return Ok(t); }
        self.overflow.get(key)?.ok_or(NotFound { key: *key })
    }

    /// Delete `key` from whichever tier holds it, returning `true` if it was
    /// present.
    pub fn delete(&mut self, key: &Key) -> StoreResult<bool> {
        let in_mem = self.resident.remove(key)?;
        let on_disk = self.overflow.remove(key)?;
        Ok(in_mem || on_disk)
    }

    /// Return `true` if `key` is present in either tier.
    pub fn contains(&self, key: &Key) -> bool {
        self.resident.contains(key) || self.overflow.contains(key)
    }

    /// Return the tier holding `key`, if any.
    pub fn tier(&self, key: &Key) -> Option<Tier> {
        if self.resident.contains(key) {
            Some(Tier::Resident)
        } else if self.overflow.contains(key) {
            Some(Tier::Overflow)
        } else {
            None
        }
    }

    /// Report current occupancy.
    pub fn usage(&self) -> StoreUsage {
        StoreUsage {
            resident_bytes: self.resident.bytes(),
            resident_count: self.resident.len(),
            overflow_count: self.overflow.len(),
            budget_bytes: self.budget,
            spills: self.spills,
        }
    }

    /// Block until all pending overflow writes have reached disk.
    pub fn flush(&self) -> StoreResult<()> { self.overflow.flush() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray as nd;
    use num_complex::Complex64 as C64;

    fn filled(len: usize, val: f64) -> Tensor {
        nd::ArrayD::from_elem(nd::IxDyn(&[len]), C64::from(val))
    }

    fn config(root: &Path, budget: usize, eviction: EvictionPolicy) -> StoreConfig {
        StoreConfig {
            root: root.to_path_buf(),
            budget_bytes: budget,
            eviction,
            background_flush: false,
        }
    }

    #[test]
    fn overwrite_replaces_value() {
        let root = tempfile::tempdir().unwrap();
        let mut store
            = TensorStore::new(&config(root.path(), 1 << 20, EvictionPolicy::SpillOldest), "t")
            .unwrap();
        store.write(Key::Site(0), filled(4, 1.0)).unwrap();
        store.write(Key::Site(0), filled(2, 2.0)).unwrap();
        assert_eq!(store.read(&Key::Site(0)).unwrap(), filled(2, 2.0));
        assert_eq!(store.usage().resident_bytes, 2 * 16);
        assert!(store.delete(&Key::Site(0)).unwrap());
        assert!(matches!(store.read(&Key::Site(0)), Err(NotFound { .. })));
        assert!(!store.delete(&Key::Site(0)).unwrap());
    }

    #[test]
    fn namespaces_are_disjoint() {
        let root = tempfile::tempdir().unwrap();
        let mut store
            = TensorStore::new(&config(root.path(), 1 << 20, EvictionPolicy::SpillOldest), "t")
            .unwrap();
        store.write(Key::Site(1), filled(1, 1.0)).unwrap();
        store.write(Key::Bond(1), filled(1, 2.0)).unwrap();
        store.write(Key::Env(Side::Left, 1), filled(1, 3.0)).unwrap();
        store.write(Key::Env(Side::Right, 1), filled(1, 4.0)).unwrap();
        assert_eq!(store.read(&Key::Site(1)).unwrap(), filled(1, 1.0));
        assert_eq!(store.read(&Key::Bond(1)).unwrap(), filled(1, 2.0));
        assert_eq!(store.read(&Key::Env(Side::Left, 1)).unwrap(), filled(1, 3.0));
        assert_eq!(store.read(&Key::Env(Side::Right, 1)).unwrap(), filled(1, 4.0));
    }

    #[test]
    fn spill_oldest_moves_earliest_writes() {
        let root = tempfile::tempdir().unwrap();
        // room for three 4-element tensors
        let mut store
            = TensorStore::new(&config(root.path(), 3 * 64, EvictionPolicy::SpillOldest), "t")
            .unwrap();
        for k in 0..5 {
            assert_eq!(store.write(Key::Site(k), filled(4, k as f64)).unwrap(), Tier::Resident);
        }
        assert_eq!(store.tier(&Key::Site(0)), Some(Tier::Overflow));
        assert_eq!(store.tier(&Key::Site(1)), Some(Tier::Overflow));
        for k in 2..5 {
            assert_eq!(store.tier(&Key::Site(k)), Some(Tier::Resident));
        }
        for k in 0..5 {
            assert_eq!(store.read(&Key::Site(k)).unwrap(), filled(4, k as f64));
        }
        let usage = store.usage();
        assert!(usage.resident_bytes <= usage.budget_bytes);
        assert_eq!(usage.resident_count, 3);
        assert_eq!(usage.overflow_count, 2);
        assert_eq!(usage.spills, 2);

        // rewriting a spilled key brings it back to memory and removes the
        // disk copy
        store.write(Key::Site(0), filled(4, 9.0)).unwrap();
        assert_eq!(store.tier(&Key::Site(0)), Some(Tier::Resident));
        assert_eq!(store.read(&Key::Site(0)).unwrap(), filled(4, 9.0));
        assert_eq!(store.usage().resident_count + store.usage().overflow_count, 5);
    }

    #[test]
    fn spill_incoming_keeps_resident_set() {
        let root = tempfile::tempdir().unwrap();
        let mut store
            = TensorStore::new(&config(root.path(), 2 * 64, EvictionPolicy::SpillIncoming), "t")
            .unwrap();
        store.write(Key::Site(0), filled(4, 0.0)).unwrap();
        store.write(Key::Site(1), filled(4, 1.0)).unwrap();
        assert_eq!(store.write(Key::Site(2), filled(4, 2.0)).unwrap(), Tier::Overflow);
        assert_eq!(store.tier(&Key::Site(0)), Some(Tier::Resident));
        assert_eq!(store.read(&Key::Site(2)).unwrap(), filled(4, 2.0));
    }

    #[test]
    fn oversized_tensor_goes_to_disk() {
        let root = tempfile::tempdir().unwrap();
        let mut store
            = TensorStore::new(&config(root.path(), 32, EvictionPolicy::SpillOldest), "t")
            .unwrap();
        store.write(Key::Site(0), filled(1, 1.0)).unwrap();
        assert_eq!(store.write(Key::Site(1), filled(8, 1.0)).unwrap(), Tier::Overflow);
        assert_eq!(store.tier(&Key::Site(0)), Some(Tier::Resident));
        assert_eq!(store.read(&Key::Site(1)).unwrap(), filled(8, 1.0));
    }

    #[test]
    fn failed_spill_keeps_every_key_readable() {
        let root = tempfile::tempdir().unwrap();
        let mut store
            = TensorStore::new(&config(root.path(), 2 * 64, EvictionPolicy::SpillOldest), "t")
            .unwrap();
        store.write(Key::Site(0), filled(4, 0.0)).unwrap();
        store.write(Key::Site(1), filled(4, 1.0)).unwrap();
        std::fs::remove_dir_all(store.namespace()).unwrap();

        // the oldest tensor cannot be moved to disk, so the write fails
        assert!(matches!(store.write(Key::Site(2), filled(4, 2.0)), Err(Io { .. })));
        assert_eq!(store.read(&Key::Site(0)).unwrap(), filled(4, 0.0));
        assert_eq!(store.read(&Key::Site(1)).unwrap(), filled(4, 1.0));
        assert!(!store.contains(&Key::Site(2)));
        assert_eq!(store.usage().spills, 0);
        assert_eq!(store.usage().resident_bytes, 2 * 64);

        // same for an overwrite: the previous value survives
        assert!(store.write(Key::Site(1), filled(16, 5.0)).is_err());
        assert_eq!(store.read(&Key::Site(1)).unwrap(), filled(4, 1.0));
    }

    #[test]
    fn corrupt_shape_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let mut store
            = TensorStore::new(&config(root.path(), 0, EvictionPolicy::SpillOldest), "t")
            .unwrap();
        store.write(Key::Bond(2), filled(3, 1.0)).unwrap();
        let shape = store.namespace().join("mps/S/bond_2.shape");
        std::fs::write(shape, [1_u8, 2, 3]).unwrap();
        assert!(matches!(store.read(&Key::Bond(2)), Err(CorruptShape { .. })));
    }
}
