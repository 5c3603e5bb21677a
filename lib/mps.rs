//! Matrix product states held in a [`TensorStore`].
//!
//! Site tensors use the index order `A[s, a, b]` (physical, left bond, right
//! bond). The chain is kept in mixed-canonical form around a single active
//! bond: sites to the left of the bond are left-isometric,
//! ```text
//! Σ_{s, a} A*[s, a, b] A[s, a, b'] = δ_{b, b'}
//! ```
//! sites to the right are right-isometric,
//! ```text
//! Σ_{s, b} B[s, a, b] B*[s, a', b] = δ_{a, a'}
//! ```
//! and the singular values on the active bond are stored separately. Spectra
//! of bonds that are no longer active are deleted.
//!
//! The two chain ends are fixed identity-like embeddings: site `0` is
//! `(d, 1, d)` and site `L - 1` is `(d, d, 1)`. For odd `L`, site `1` is seeded
//! with the isometric embedding `(d, d, d²)` so that growth can proceed
//! symmetrically from the remaining `L - 1` sites.

use std::{
    fs::File,
    io::{ BufReader, BufWriter, Write },
    path::Path,
};
use ndarray as nd;
use num_complex::Complex64 as C64;
use num_traits::{ One, Zero };
use serde::{ Deserialize, Serialize };
use thiserror::Error;
use crate::{
    schedule::{ Direction, MIN_LENGTH },
    store::{ Key, StoreError, StoreUsage, TensorStore },
    tensor::{ into_rank3, reshape, tensordot, TensorError },
};

#[derive(Debug, Error)]
pub enum MPSError {
    /// Returned when a chain is too short to be swept.
    #[error("chain length {0} is too short: must be at least {min}", min = MIN_LENGTH)]
    ShortChain(usize),

    /// Returned when a site index is out of bounds.
    #[error("site {site} is out of bounds for a chain of length {length}")]
    SiteOutOfBounds { site: usize, length: usize },

    /// Returned when a factor matrix does not have a row/column count that is
    /// a multiple of the physical dimension.
    #[error("cannot split a factor of shape {shape:?} at site {site} with physical dimension {d}")]
    BadFactor { site: usize, shape: Vec<usize>, d: usize },

    /// Returned when a neighboring pair of site tensors have mismatched bond
    /// dimensions.
    #[error("bond dimension mismatch between sites {site} and {}: {left} != {right}", .site + 1)]
    BondMismatch { site: usize, left: usize, right: usize },

    /// Returned when a stored spectrum does not match its bond.
    #[error("spectrum at bond {bond} has length {got}, expected {expected}")]
    SpectrumMismatch { bond: usize, expected: usize, got: usize },

    /// Returned when a saved chain does not describe a valid MPS.
    #[error("invalid saved chain: {0}")]
    BadSnapshot(String),

    #[error("store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("i/o error: {0}")]
    IOError(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("tensor error: {0}")]
    TensorError(#[from] TensorError),
}
use MPSError::*;
pub type MPSResult<T> = Result<T, MPSError>;

/// Von Neumann entropy `-Σ s² ln s²` of a set of singular values.
///
/// Zero singular values contribute nothing.
pub fn entropy(spectrum: &nd::Array1<f64>) -> f64 {
    spectrum.iter()
        .filter(|sk| **sk > 0.0)
        .map(|sk| {
            let sk2 = sk * sk;
            -sk2 * sk2.ln()
        })
        .sum()
}

// on-disk form of a whole chain; unset sites are `None`
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    length: usize,
    d: usize,
    sites: Vec<Option<nd::Array3<C64>>>,
    spectra: Vec<(usize, nd::Array1<f64>)>,
}

/// A matrix product state of fixed length.
pub struct MPS {
    length: usize,
    d: usize,
    store: TensorStore,
}

impl MPS {
    /// Create a new chain of `length` sites with physical dimension `d`,
    /// writing the boundary seed tensors into `store`.
    ///
    /// Interior site tensors are left unset until written by the growth phase.
    pub fn new(length: usize, d: usize, mut store: TensorStore) -> MPSResult<Self> {
        if length < MIN_LENGTH { return Err(ShortChain(length)); }
        let delta = |a: usize, b: usize| if a == b { C64::one() } else { C64::zero() };
        let first: nd::Array3<C64>
            = nd::Array3::from_shape_fn((d, 1, d), |(s, _, b)| delta(s, b));
        let last: nd::Array3<C64>
            = nd::Array3::from_shape_fn((d, d, 1), |(s, a, _)| delta(s, a));
        store.write(Key::Site(0), first.into_dyn())?;
        store.write(Key::Site(length - 1), last.into_dyn())?;
        if length % 2 == 1 {
            let second: nd::Array3<C64>
                = nd::Array3::from_shape_fn((d, d, d * d), |(s, a, b)| delta(b, a * d + s));
            store.write(Key::Site(1), second.into_dyn())?;
        }
        Ok(Self { length, d, store })
    }

    /// Number of sites.
    pub fn len(&self) -> usize { self.length }

    /// Always `false`: chains have at least [`MIN_LENGTH`] sites.
    pub fn is_empty(&self) -> bool { false }

    /// Physical dimension.
    pub fn phys_dim(&self) -> usize { self.d }

    fn check_site(&self, site: usize) -> MPSResult<()> {
        if site >= self.length {
            Err(SiteOutOfBounds { site, length: self.length })
        } else {
            Ok(())
        }
    }

    /// Read the tensor at `site`.
    pub fn read(&self, site: usize) -> MPSResult<nd::Array3<C64>> {
        self.check_site(site)?;
        Ok(into_rank3(self.store.read(&Key::Site(site))?)?)
    }

    /// Overwrite the tensor at `site`.
    pub fn write(&mut self, site: usize, tensor: nd::Array3<C64>) -> MPSResult<()> {
        self.check_site(site)?;
        self.store.write(Key::Site(site), tensor.into_dyn())?;
        Ok(())
    }

    /// Store a left-isometric site tensor from a matrix `U[(a, s), b]` whose
    /// row index runs over the left bond and physical index, with the
    /// physical index varying fastest.
    pub fn write_left(&mut self, site: usize, u: &nd::Array2<C64>) -> MPSResult<()> {
        let (rows, cols) = u.dim();
        if rows % self.d != 0 {
            return Err(BadFactor { site, shape: vec![rows, cols], d: self.d });
        }
        let t = reshape(u, &[rows / self.d, self.d, cols])?
            .permuted_axes(vec![1, 0, 2]);
        self.write(site, into_rank3(t)?)
    }

    /// Store a right-isometric site tensor from a matrix `V†[a, (s, c)]` whose
    /// column index runs over the physical index and right bond, with the
    /// right bond varying fastest.
    pub fn write_right(&mut self, site: usize, vt: &nd::Array2<C64>) -> MPSResult<()> {
        let (rows, cols) = vt.dim();
        if cols % self.d != 0 {
            return Err(BadFactor { site, shape: vec![rows, cols], d: self.d });
        }
        let t = reshape(vt, &[rows, self.d, cols / self.d])?
            .permuted_axes(vec![1, 0, 2]);
        self.write(site, into_rank3(t)?)
    }

    /// Store the singular values on `bond` (between sites `bond` and `bond +
    /// 1`).
    pub fn write_spectrum(&mut self, bond: usize, spectrum: &nd::Array1<f64>)
        -> MPSResult<()>
    {
        self.check_site(bond + 1)?;
        let t: nd::ArrayD<C64> = spectrum.mapv(C64::from).into_dyn();
        self.store.write(Key::Bond(bond), t)?;
        Ok(())
    }

    /// Read the singular values on `bond`.
    pub fn read_spectrum(&self, bond: usize) -> MPSResult<nd::Array1<f64>> {
        self.check_site(bond + 1)?;
        let t = self.store.read(&Key::Bond(bond))?;
        Ok(t.iter().map(|sk| sk.re).collect())
    }

    /// Delete the singular values on `bond`, returning `true` if they were
    /// present.
    pub fn delete_spectrum(&mut self, bond: usize) -> MPSResult<bool> {
        Ok(self.store.delete(&Key::Bond(bond))?)
    }

    /// Return `true` if singular values are stored for `bond`.
    pub fn has_spectrum(&self, bond: usize) -> bool {
        self.store.contains(&Key::Bond(bond))
    }

    /// Von Neumann entropy across `bond`.
    pub fn entropy(&self, bond: usize) -> MPSResult<f64> {
        Ok(entropy(&self.read_spectrum(bond)?))
    }

    /// Bond dimension between sites `bond` and `bond + 1`.
    pub fn bond_dim(&self, bond: usize) -> MPSResult<usize> {
        Ok(self.read(bond)?.shape()[2])
    }

    /// Rebuild the two-site wavefunction `θ[a, s1, s2, c]` on sites `(site,
    /// site + 1)` from the stored tensors, placing the singular values of the
    /// active bond according to the direction the center is travelling.
    ///
    /// For [`Direction::Right`] the center sits on bond `site - 1` and its
    /// spectrum multiplies the left bond of `site`; for [`Direction::Left`] it
    /// sits on bond `site + 1` and multiplies the right bond of `site + 1`.
    pub fn two_site(&self, site: usize, dir: Direction) -> MPSResult<nd::Array4<C64>> {
        self.check_site(site + 1)?;
        let mut a1 = self.read(site)?;
        let mut a2 = self.read(site + 1)?;
        match dir {
            Direction::Right => {
                if site == 0 { return Err(SiteOutOfBounds { site, length: self.length }); }
                let s = self.read_spectrum(site - 1)?;
                if s.len() != a1.shape()[1] {
                    return Err(SpectrumMismatch {
                        bond: site - 1, expected: a1.shape()[1], got: s.len() });
                }
                a1.axis_iter_mut(nd::Axis(1)).zip(&s)
                    .for_each(|(mut v, sk)| { v.mapv_inplace(|x| x * *sk); });
            },
            Direction::Left => {
                let s = self.read_spectrum(site + 1)?;
                if s.len() != a2.shape()[2] {
                    return Err(SpectrumMismatch {
                        bond: site + 1, expected: a2.shape()[2], got: s.len() });
                }
                a2.axis_iter_mut(nd::Axis(2)).zip(&s)
                    .for_each(|(mut v, sk)| { v.mapv_inplace(|x| x * *sk); });
            },
        }
        if a1.shape()[2] != a2.shape()[1] {
            return Err(BondMismatch {
                site, left: a1.shape()[2], right: a2.shape()[1] });
        }
        // [s1, a, s2, c]
        let theta = tensordot(&a1.into_dyn(), &a2.into_dyn(), &[2], &[1])
            .permuted_axes(vec![1, 0, 2, 3]);
        let theta = reshape(&theta, &theta.shape().to_vec())?;
        Ok(theta.into_dimensionality::<nd::Ix4>().map_err(TensorError::from)?)
    }

    /// Write the whole chain (length, physical dimension, every site tensor
    /// that has been set, and every stored bond spectrum) to a JSON file at
    /// `path`.
    pub fn save(&self, path: &Path) -> MPSResult<()> {
        let sites: Vec<Option<nd::Array3<C64>>>
            = (0..self.length)
            .map(|k| {
                self.store.contains(&Key::Site(k))
                    .then(|| self.read(k))
                    .transpose()
            })
            .collect::<MPSResult<_>>()?;
        let spectra: Vec<(usize, nd::Array1<f64>)>
            = (0..self.length - 1)
            .filter(|b| self.has_spectrum(*b))
            .map(|b| self.read_spectrum(b).map(|s| (b, s)))
            .collect::<MPSResult<_>>()?;
        let snapshot = Snapshot { length: self.length, d: self.d, sites, spectra };
        let mut out = BufWriter::new(File::create(path)?);
        serde_json::to_writer(&mut out, &snapshot)?;
        out.flush()?;
        Ok(())
    }

    /// Restore a chain written by [`Self::save`] into `store`.
    pub fn load(path: &Path, mut store: TensorStore) -> MPSResult<Self> {
        let snapshot: Snapshot
            = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        let Snapshot { length, d, sites, spectra } = snapshot;
        if length < MIN_LENGTH { return Err(ShortChain(length)); }
        if sites.len() != length {
            return Err(BadSnapshot(
                format!("{} site entries for a chain of length {length}", sites.len())));
        }
        for (k, site) in sites.into_iter().enumerate() {
            let Some(a) = site else { continue; };
            if a.shape()[0] != d {
                return Err(BadSnapshot(
                    format!("site {k} has physical dimension {}, expected {d}", a.shape()[0])));
            }
            store.write(Key::Site(k), a.into_dyn())?;
        }
        for (bond, s) in spectra.into_iter() {
            if bond + 1 >= length {
                return Err(BadSnapshot(format!("spectrum on nonexistent bond {bond}")));
            }
            store.write(Key::Bond(bond), s.mapv(C64::from).into_dyn())?;
        }
        Ok(Self { length, d, store })
    }

    /// Report the occupancy of the underlying store.
    pub fn memory_usage(&self) -> StoreUsage { self.store.usage() }

    /// Access the underlying store.
    pub fn store(&self) -> &TensorStore { &self.store }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ store::StoreConfig, tensor::eye };
    use approx::assert_abs_diff_eq;

    fn store(root: &std::path::Path) -> TensorStore {
        let config = StoreConfig { root: root.to_path_buf(), ..StoreConfig::default() };
        TensorStore::new(&config, "mps").unwrap()
    }

    fn left_gram(a: &nd::Array3<C64>) -> nd::Array2<C64> {
        let (d, c1, c2) = a.dim();
        nd::Array2::from_shape_fn((c2, c2), |(b, bp)| {
            let mut acc = C64::zero();
            for s in 0..d { for x in 0..c1 { acc += a[[s, x, b]].conj() * a[[s, x, bp]]; } }
            acc
        })
    }

    fn right_gram(a: &nd::Array3<C64>) -> nd::Array2<C64> {
        let (d, c1, c2) = a.dim();
        nd::Array2::from_shape_fn((c1, c1), |(x, xp)| {
            let mut acc = C64::zero();
            for s in 0..d { for b in 0..c2 { acc += a[[s, x, b]] * a[[s, xp, b]].conj(); } }
            acc
        })
    }

    fn assert_identity(m: &nd::Array2<C64>) {
        let id = eye(m.nrows());
        m.iter().zip(&id).for_each(|(x, y)| assert_abs_diff_eq!((x - y).norm(), 0.0, epsilon = 1e-12));
    }

    #[test]
    fn seeds_are_isometric() {
        let root = tempfile::tempdir().unwrap();
        let mps = MPS::new(7, 2, store(root.path())).unwrap();
        assert_eq!(mps.read(0).unwrap().dim(), (2, 1, 2));
        assert_eq!(mps.read(1).unwrap().dim(), (2, 2, 4));
        assert_eq!(mps.read(6).unwrap().dim(), (2, 2, 1));
        assert_identity(&left_gram(&mps.read(0).unwrap()));
        assert_identity(&left_gram(&mps.read(1).unwrap()));
        assert_identity(&right_gram(&mps.read(6).unwrap()));
        assert!(matches!(mps.read(3), Err(StoreError(_))));
        assert!(matches!(mps.read(7), Err(SiteOutOfBounds { .. })));
        assert!(matches!(MPS::new(3, 2, store(root.path())), Err(ShortChain(3))));
    }

    #[test]
    fn factor_layout() {
        let root = tempfile::tempdir().unwrap();
        let mut mps = MPS::new(6, 2, store(root.path())).unwrap();
        // U[(a, s), b] with c1 = 3, d = 2, rank 4
        let u: nd::Array2<C64>
            = nd::Array2::from_shape_fn((6, 4), |(i, j)| C64::from((10 * i + j) as f64));
        mps.write_left(2, &u).unwrap();
        let a = mps.read(2).unwrap();
        assert_eq!(a.dim(), (2, 3, 4));
        assert_eq!(a[[1, 2, 3]], u[[2 * 2 + 1, 3]]);
        // V†[a, (s, c)] with rank 4, d = 2, c2 = 3
        let vt: nd::Array2<C64>
            = nd::Array2::from_shape_fn((4, 6), |(i, j)| C64::from((10 * i + j) as f64));
        mps.write_right(3, &vt).unwrap();
        let b = mps.read(3).unwrap();
        assert_eq!(b.dim(), (2, 4, 3));
        assert_eq!(b[[1, 2, 0]], vt[[2, 3]]);
        assert!(matches!(mps.write_left(2, &nd::Array2::zeros((5, 2))), Err(BadFactor { .. })));
    }

    #[test]
    fn save_and_load_whole_chain() {
        let root = tempfile::tempdir().unwrap();
        let mut mps = MPS::new(5, 2, store(root.path())).unwrap();
        let a: nd::Array3<C64>
            = nd::Array3::from_shape_fn((2, 2, 3), |(s, a, b)| C64::new(s as f64, (a + b) as f64 / 3.0));
        mps.write(2, a.clone()).unwrap();
        let s: nd::Array1<f64> = nd::array![0.75, 0.5, 0.25];
        mps.write_spectrum(2, &s).unwrap();

        let path = root.path().join("chain.json");
        mps.save(&path).unwrap();
        let loaded = MPS::load(&path, store(root.path())).unwrap();
        assert_eq!(loaded.len(), 5);
        assert_eq!(loaded.phys_dim(), 2);
        for k in [0, 1, 2, 4] {
            let (x, y) = (mps.read(k).unwrap(), loaded.read(k).unwrap());
            assert_eq!(x.dim(), y.dim());
            x.iter().zip(&y)
                .for_each(|(p, q)| assert_abs_diff_eq!((p - q).norm(), 0.0, epsilon = 1e-14));
        }
        // never-written sites stay unset
        assert!(matches!(loaded.read(3), Err(StoreError(_))));
        assert!(loaded.has_spectrum(2));
        assert!(!loaded.has_spectrum(1));
        loaded.read_spectrum(2).unwrap().iter().zip(&s)
            .for_each(|(p, q)| assert_abs_diff_eq!(*p, *q, epsilon = 1e-14));
    }

    #[test]
    fn inconsistent_saved_chain_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("chain.json");
        let mps = MPS::new(4, 2, store(root.path())).unwrap();
        mps.save(&path).unwrap();

        let mut raw: serde_json::Value
            = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        raw["d"] = serde_json::json!(3);
        std::fs::write(&path, raw.to_string()).unwrap();
        assert!(matches!(MPS::load(&path, store(root.path())), Err(BadSnapshot(_))));

        raw["d"] = serde_json::json!(2);
        raw["length"] = serde_json::json!(6);
        std::fs::write(&path, raw.to_string()).unwrap();
        assert!(matches!(MPS::load(&path, store(root.path())), Err(BadSnapshot(_))));

        std::fs::write(&path, "{").unwrap();
        assert!(matches!(MPS::load(&path, store(root.path())), Err(JsonError(_))));
        let missing = root.path().join("missing.json");
        assert!(matches!(MPS::load(&missing, store(root.path())), Err(IOError(_))));
    }

    #[test]
    fn spectra_and_two_site() {
        let root = tempfile::tempdir().unwrap();
        let mut mps = MPS::new(4, 2, store(root.path())).unwrap();
        let s: nd::Array1<f64> = nd::array![0.8_f64.sqrt(), 0.2_f64.sqrt()];
        mps.write_spectrum(0, &s).unwrap();
        assert_abs_diff_eq!(mps.entropy(0).unwrap(), -(0.8 * 0.8_f64.ln() + 0.2 * 0.2_f64.ln()), epsilon = 1e-12);
        let b: nd::Array3<C64>
            = nd::Array3::from_shape_fn((2, 2, 2), |(s, a, c)| C64::from((s + 2 * a + 4 * c) as f64));
        mps.write(1, b.clone()).unwrap();
        let theta = mps.two_site(1, Direction::Right).unwrap();
        assert_eq!(theta.dim(), (2, 2, 2, 1));
        // θ[a, s1, s2, c] = Σ_b S[a] B[s1, a, b] A3[s2, b, c]
        let last = mps.read(3).unwrap();
        for a in 0..2 { for s1 in 0..2 { for s2 in 0..2 {
            let expected: C64
                = (0..2).map(|x| b[[s1, a, x]] * last[[s2, x, 0]] * s[a]).sum();
            assert_abs_diff_eq!((theta[[a, s1, s2, 0]] - expected).norm(), 0.0, epsilon = 1e-12);
        }}}
        assert!(mps.delete_spectrum(0).unwrap());
        assert!(!mps.has_spectrum(0));
        assert!(matches!(mps.two_site(1, Direction::Right), Err(StoreError(_))));
    }
}
