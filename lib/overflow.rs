//! Disk-backed overflow tier for [`TensorStore`][crate::store::TensorStore].
//!
//! Each key maps to two files inside a per-run namespace directory: a raw
//! payload (`<stem>.dat`, the tensor's elements in row-major order as native
//! `f64` pairs) and a shape sidecar (`<stem>.shape`, a fixed-width record of
//! little-endian `u64`s: the rank followed by each dimension). MPS site
//! tensors, bond spectra, and the two sides of the contraction environment
//! live in separate subdirectories:
//!
//! ```text
//! <root>/dmrg-<label>-XXXXXX/
//!     mps/site_<i>.{dat,shape}
//!     mps/S/bond_<i>.{dat,shape}
//!     env/LEFT/cont_<i>.{dat,shape}
//!     env/RIGHT/cont_<i>.{dat,shape}
//! ```
//!
//! Writes can optionally be handed off to a background thread (see
//! [`Flusher`]), in which case the written tensor is held in a pending table
//! until it has landed on disk so that reads never observe a stale file.

use std::{
    fs::{ self, File },
    io::{ self, BufWriter, Read, Write },
    path::{ Path, PathBuf },
    sync::{ Arc, Mutex },
    thread,
};
use crossbeam::channel;
use ndarray as nd;
use num_complex::Complex64 as C64;
use num_traits::Zero;
use rustc_hash::{ FxHashMap as HashMap, FxHashSet as HashSet };
use tracing::debug;
use crate::{
    env::Side,
    store::{ Key, StoreError, StoreResult },
    tensor::Tensor,
};

const SHAPE_WORD: usize = std::mem::size_of::<u64>();
const ELEM_BYTES: usize = std::mem::size_of::<C64>();

/// Structured shape descriptor written next to every overflow payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShapeRecord(pub Vec<u64>);

impl ShapeRecord {
    /// Describe the shape of `t`.
    pub fn of(t: &Tensor) -> Self {
        Self(t.shape().iter().map(|d| *d as u64).collect())
    }

    /// Number of elements described by the record, or `None` if it does not
    /// fit in a `usize`.
    pub fn len(&self) -> Option<usize> {
        self.0.iter()
            .try_fold(1_usize, |acc, d| acc.checked_mul(usize::try_from(*d).ok()?))
    }

    /// Return `true` if the record describes an array with no elements.
    pub fn is_empty(&self) -> bool { self.0.iter().any(|d| *d == 0) }

    /// Serialize as `[rank, dim_0, ..., dim_{rank-1}]`, each a little-endian
    /// `u64`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes: Vec<u8>
            = Vec::with_capacity(SHAPE_WORD * (self.0.len() + 1));
        bytes.extend_from_slice(&(self.0.len() as u64).to_le_bytes());
        self.0.iter()
            .for_each(|d| bytes.extend_from_slice(&d.to_le_bytes()));
        bytes
    }

    /// Inverse of [`Self::to_bytes`].
    ///
    /// Returns `None` if the byte count does not match the declared rank.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < SHAPE_WORD || bytes.len() % SHAPE_WORD != 0 {
            return None;
        }
        let words: Vec<u64>
            = bytes.chunks_exact(SHAPE_WORD)
            .map(|w| {
                let mut buf = [0_u8; SHAPE_WORD];
                buf.copy_from_slice(w);
                u64::from_le_bytes(buf)
            })
            .collect();
        (words[0] == (words.len() - 1) as u64).then(|| Self(words[1..].to_vec()))
    }

    fn dims(&self) -> Vec<usize> {
        self.0.iter().map(|d| *d as usize).collect()
    }
}

fn stem(base: &Path, key: &Key) -> PathBuf {
    match key {
        Key::Site(i) => base.join("mps").join(format!("site_{i}")),
        Key::Bond(i) => base.join("mps").join("S").join(format!("bond_{i}")),
        Key::Env(Side::Left, i)
            => base.join("env").join("LEFT").join(format!("cont_{i}")),
        Key::Env(Side::Right, i)
            => base.join("env").join("RIGHT").join(format!("cont_{i}")),
    }
}

fn payload_path(base: &Path, key: &Key) -> PathBuf {
    stem(base, key).with_extension("dat")
}

fn shape_path(base: &Path, key: &Key) -> PathBuf {
    stem(base, key).with_extension("shape")
}

fn write_files(base: &Path, key: &Key, tensor: &Tensor) -> io::Result<()> {
    let elems: Vec<C64> = tensor.iter().copied().collect();
    let mut payload = BufWriter::new(File::create(payload_path(base, key))?);
    payload.write_all(bytemuck::cast_slice(&elems))?;
    payload.flush()?;
    fs::write(shape_path(base, key), ShapeRecord::of(tensor).to_bytes())?;
    Ok(())
}

fn read_files(base: &Path, key: &Key) -> StoreResult<Tensor> {
    let shape_bytes = fs::read(shape_path(base, key))
        .map_err(|source| StoreError::Io { key: *key, source })?;
    let record = ShapeRecord::from_bytes(&shape_bytes)
        .ok_or(StoreError::CorruptShape { key: *key })?;
    let mut payload = File::open(payload_path(base, key))
        .map_err(|source| StoreError::Io { key: *key, source })?;
    let found = payload.metadata()
        .map_err(|source| StoreError::Io { key: *key, source })?
        .len();
    let len
        = record.len()
        .filter(|n| n.checked_mul(ELEM_BYTES).is_some())
        .ok_or(StoreError::CorruptShape { key: *key })?;
    let expected = (len * ELEM_BYTES) as u64;
    // check against the file before allocating anything
    if found != expected {
        return Err(StoreError::CorruptPayload { key: *key, expected, found });
    }
    let mut elems: Vec<C64> = vec![C64::zero(); len];
    payload.read_exact(bytemuck::cast_slice_mut(&mut elems))
        .map_err(|source| StoreError::Io { key: *key, source })?;
    nd::ArrayD::from_shape_vec(nd::IxDyn(&record.dims()), elems)
        .map_err(|_| StoreError::CorruptShape { key: *key })
}

fn remove_files(base: &Path, key: &Key) -> io::Result<()> {
    for path in [payload_path(base, key), shape_path(base, key)] {
        match fs::remove_file(path) {
            Ok(()) => { },
            Err(err) if err.kind() == io::ErrorKind::NotFound => { },
            Err(err) => { return Err(err); },
        }
    }
    Ok(())
}

type Pending = Arc<Mutex<HashMap<Key, (u64, Arc<Tensor>)>>>;

#[allow(clippy::large_enum_variant)]
enum ToWriter {
    Stop,
    Write(Key, u64, Arc<Tensor>),
    Remove(Key),
    Barrier(channel::Sender<()>),
}

/// Background writer for overflow payloads.
///
/// Jobs are processed strictly in submission order over a single channel, so
/// a removal queued after a write of the same key always wins, and the last of
/// several writes to one key is the one left on disk.
pub struct Flusher {
    thread: Option<thread::JoinHandle<()>>,
    jobs: channel::Sender<ToWriter>,
    errors: channel::Receiver<(Key, io::Error)>,
    pending: Pending,
    seq: u64,
}

impl Flusher {
    fn new(base: PathBuf) -> Self {
        let (tx_jobs, rx_jobs) = channel::unbounded::<ToWriter>();
        let (tx_err, rx_err) = channel::unbounded();
        let pending: Pending = Arc::new(Mutex::new(HashMap::default()));
        let worker_pending = Arc::clone(&pending);
        let th = thread::spawn(move || loop {
            match rx_jobs.recv() {
                Ok(ToWriter::Stop) | Err(_) => { break; },
                Ok(ToWriter::Write(key, seq, tensor)) => {
                    match write_files(&base, &key, &tensor) {
                        Ok(()) => {
                            let mut pending = worker_pending.lock()
                                .unwrap_or_else(|poisoned| poisoned.into_inner());
                            if pending.get(&key).is_some_and(|(s, _)| *s == seq) {
                                pending.remove(&key);
                            }
                        },
                        Err(err) => { tx_err.send((key, err)).ok(); },
                    }
                },
                Ok(ToWriter::Remove(key)) => {
                    if let Err(err) = remove_files(&base, &key) {
                        tx_err.send((key, err)).ok();
                    }
                },
                Ok(ToWriter::Barrier(done)) => { done.send(()).ok(); },
            }
        });
        Self {
            thread: Some(th),
            jobs: tx_jobs,
            errors: rx_err,
            pending,
            seq: 0,
        }
    }

    fn check(&self) -> StoreResult<()> {
        match self.errors.try_recv() {
            Ok((key, source)) => Err(StoreError::FlushFailed { key, source }),
            Err(_) => Ok(()),
        }
    }

    fn is_alive(&self) -> bool {
        self.thread.as_ref().is_some_and(|th| !th.is_finished())
    }

    fn submit(&mut self, key: Key, tensor: Tensor) -> StoreResult<()> {
        if !self.is_alive() { return Err(StoreError::DeadFlusher); }
        self.seq += 1;
        let tensor = Arc::new(tensor);
        self.pending.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, (self.seq, Arc::clone(&tensor)));
        self.jobs.send(ToWriter::Write(key, self.seq, tensor))
            .map_err(|_| StoreError::DeadFlusher)
    }

    fn remove(&mut self, key: Key) -> StoreResult<()> {
        self.pending.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&key);
        self.jobs.send(ToWriter::Remove(key))
            .map_err(|_| StoreError::DeadFlusher)
    }

    fn pending(&self, key: &Key) -> Option<Tensor> {
        self.pending.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .map(|(_, t)| t.as_ref().clone())
    }

    fn num_pending(&self) -> usize {
        self.pending.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn wait(&self) -> StoreResult<()> {
        let (tx, rx) = channel::bounded(1);
        self.jobs.send(ToWriter::Barrier(tx))
            .map_err(|_| StoreError::DeadFlusher)?;
        rx.recv().map_err(|_| StoreError::DeadFlusher)?;
        self.check()
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        self.jobs.send(ToWriter::Stop).ok();
        if let Some(th) = self.thread.take() { th.join().ok(); }
    }
}

/// The overflow tier: tensors persisted as files under a run-specific
/// namespace directory, which is removed when the tier is dropped.
pub struct Overflow {
    // drop order matters here: the flusher must finish before the directory
    // is removed
    flusher: Option<Flusher>,
    dir: tempfile::TempDir,
    present: HashSet<Key>,
}

impl Overflow {
    /// Create a new, empty overflow namespace under `root`.
    pub fn new(root: &Path, label: &str, background: bool) -> StoreResult<Self> {
        fs::create_dir_all(root).map_err(StoreError::Setup)?;
        let dir = tempfile::Builder::new()
            .prefix(&format!("dmrg-{label}-"))
            .tempdir_in(root)
            .map_err(StoreError::Setup)?;
        for sub in [
            dir.path().join("mps").join("S"),
            dir.path().join("env").join("LEFT"),
            dir.path().join("env").join("RIGHT"),
        ] {
            fs::create_dir_all(sub).map_err(StoreError::Setup)?;
        }
        let flusher = background.then(|| Flusher::new(dir.path().to_path_buf()));
        debug!(path = %dir.path().display(), background, "created overflow namespace");
        Ok(Self { flusher, dir, present: HashSet::default() })
    }

    /// Path of the namespace directory.
    pub fn path(&self) -> &Path { self.dir.path() }

    /// Return `true` if the key is (logically) held by this tier.
    pub fn contains(&self, key: &Key) -> bool { self.present.contains(key) }

    /// Number of keys held by this tier.
    pub fn len(&self) -> usize { self.present.len() }

    /// Return `true` if no keys are held.
    pub fn is_empty(&self) -> bool { self.present.is_empty() }

    /// Surface any error reported by the background writer.
    pub fn check(&self) -> StoreResult<()> {
        self.flusher.as_ref().map_or(Ok(()), |f| f.check())
    }

    /// Persist `tensor` under `key`, replacing any previous payload.
    pub fn put(&mut self, key: Key, tensor: Tensor) -> StoreResult<()> {
        match self.flusher.as_mut() {
            Some(flusher) => { flusher.submit(key, tensor)?; },
            None => {
                write_files(self.dir.path(), &key, &tensor)
                    .map_err(|source| StoreError::Io { key, source })?;
            },
        }
        self.present.insert(key);
        Ok(())
    }

    /// Load the tensor stored under `key`, if any.
    pub fn get(&self, key: &Key) -> StoreResult<Option<Tensor>> {
        if !self.present.contains(key) { return Ok(None); }
        if let Some(t) = self.flusher.as_ref().and_then(|f| f.pending(key)) {
            return Ok(Some(t));
        }
        read_files(self.dir.path(), key).map(Some)
    }

    /// Delete the payload stored under `key`, returning `true` if there was
    /// one.
    pub fn remove(&mut self, key: &Key) -> StoreResult<bool> {
        if !self.present.remove(key) { return Ok(false); }
        match self.flusher.as_mut() {
            Some(flusher) => { flusher.remove(*key)?; },
            None => {
                remove_files(self.dir.path(), key)
                    .map_err(|source| StoreError::Io { key: *key, source })?;
            },
        }
        Ok(true)
    }

    /// Number of writes still in flight on the background writer.
    pub fn num_pending(&self) -> usize {
        self.flusher.as_ref().map_or(0, |f| f.num_pending())
    }

    /// Block until every queued write has been persisted.
    pub fn flush(&self) -> StoreResult<()> {
        self.flusher.as_ref().map_or(Ok(()), |f| f.wait())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(shape: &[usize]) -> Tensor {
        let mut k = 0.0;
        nd::ArrayD::from_shape_fn(nd::IxDyn(shape), |_| {
            k += 1.0;
            C64::new(k, -0.5 * k)
        })
    }

    #[test]
    fn shape_record_roundtrip_and_rejects_garbage() {
        let rec = ShapeRecord(vec![2, 7, 3]);
        let bytes = rec.to_bytes();
        assert_eq!(bytes.len(), 4 * SHAPE_WORD);
        assert_eq!(ShapeRecord::from_bytes(&bytes), Some(rec));
        assert_eq!(ShapeRecord::from_bytes(&bytes[..bytes.len() - 1]), None);
        assert_eq!(ShapeRecord::from_bytes(&bytes[..2 * SHAPE_WORD]), None);
        assert_eq!(ShapeRecord::from_bytes(&u64::MAX.to_le_bytes()), None);
    }

    #[test]
    fn huge_shape_record_is_rejected_before_reading() {
        assert_eq!(ShapeRecord(vec![u64::MAX, u64::MAX]).len(), None);
        assert_eq!(ShapeRecord(vec![]).len(), Some(1));
        assert!(ShapeRecord(vec![3, 0]).is_empty());

        let root = tempfile::tempdir().unwrap();
        let mut tier = Overflow::new(root.path(), "test", false).unwrap();
        tier.put(Key::Site(0), sample(&[2, 2])).unwrap();
        tier.put(Key::Site(1), sample(&[2, 2])).unwrap();
        let base = tier.path().to_path_buf();
        fs::write(
            base.join("mps/site_0.shape"),
            ShapeRecord(vec![u64::MAX, u64::MAX, 2]).to_bytes(),
        ).unwrap();
        assert!(matches!(tier.get(&Key::Site(0)), Err(StoreError::CorruptShape { .. })));
        // representable but far larger than the payload on disk
        fs::write(
            base.join("mps/site_1.shape"),
            ShapeRecord(vec![1 << 20, 1 << 20]).to_bytes(),
        ).unwrap();
        assert!(matches!(
            tier.get(&Key::Site(1)),
            Err(StoreError::CorruptPayload { found: 64, .. })
        ));
    }

    #[test]
    fn files_land_in_separate_namespaces() {
        let root = tempfile::tempdir().unwrap();
        let mut tier = Overflow::new(root.path(), "test", false).unwrap();
        tier.put(Key::Site(3), sample(&[2, 1, 2])).unwrap();
        tier.put(Key::Env(Side::Left, 3), sample(&[2, 3, 2])).unwrap();
        tier.put(Key::Env(Side::Right, 3), sample(&[2, 3, 2])).unwrap();
        let base = tier.path().to_path_buf();
        assert!(base.join("mps/site_3.dat").exists());
        assert!(base.join("mps/site_3.shape").exists());
        assert!(base.join("env/LEFT/cont_3.dat").exists());
        assert!(base.join("env/RIGHT/cont_3.dat").exists());
        assert_eq!(tier.get(&Key::Site(3)).unwrap(), Some(sample(&[2, 1, 2])));
        assert!(tier.remove(&Key::Site(3)).unwrap());
        assert!(!base.join("mps/site_3.dat").exists());
        assert!(!tier.remove(&Key::Site(3)).unwrap());
    }

    #[test]
    fn two_runs_do_not_collide() {
        let root = tempfile::tempdir().unwrap();
        let mut a = Overflow::new(root.path(), "run", false).unwrap();
        let mut b = Overflow::new(root.path(), "run", false).unwrap();
        assert_ne!(a.path(), b.path());
        a.put(Key::Bond(0), sample(&[4])).unwrap();
        b.put(Key::Bond(0), sample(&[5])).unwrap();
        assert_eq!(a.get(&Key::Bond(0)).unwrap().unwrap().len(), 4);
        assert_eq!(b.get(&Key::Bond(0)).unwrap().unwrap().len(), 5);
    }

    #[test]
    fn background_writes_are_never_stale() {
        let root = tempfile::tempdir().unwrap();
        let mut tier = Overflow::new(root.path(), "bg", true).unwrap();
        for k in 1..=20 {
            tier.put(Key::Site(0), sample(&[k])).unwrap();
            assert_eq!(tier.get(&Key::Site(0)).unwrap().unwrap().len(), k);
        }
        tier.flush().unwrap();
        assert_eq!(tier.num_pending(), 0);
        assert_eq!(tier.get(&Key::Site(0)).unwrap(), Some(sample(&[20])));
        assert!(tier.remove(&Key::Site(0)).unwrap());
        assert_eq!(tier.get(&Key::Site(0)).unwrap(), None);
        tier.flush().unwrap();
        assert!(!tier.path().join("mps/site_0.dat").exists());
    }
}
