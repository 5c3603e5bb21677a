//! Contraction environments for two-site DMRG.
//!
//! An environment block `E[a, w, a']` is the contraction of the ket chain, the
//! operator chain, and the conjugated (bra) chain over a contiguous run of
//! sites touching one end of the chain. The three remaining indices are the
//! open ket bond, operator bond, and bra bond on the inner side of the run.
//!
//! `Left[i]` covers sites `0..=i` and `Right[i]` covers sites `i..L`. Blocks
//! are stored in their own [`TensorStore`] and updated in place: after a site
//! tensor changes, [`Environment::add`] rebuilds the one block that includes
//! it from its already-valid neighbor, so that a sweep step costs a constant
//! number of contractions regardless of the chain length.

use ndarray as nd;
use num_complex::Complex64 as C64;
use num_traits::One;
use thiserror::Error;
use crate::{
    mpo::{ MPOError, OperatorProvider },
    mps::{ MPSError, MPS },
    store::{ Key, StoreError, TensorStore },
    tensor::{ conj, tensordot, Tensor },
};

#[derive(Debug, Error)]
pub enum EnvError {
    /// Returned when a block that should have been built is missing from the
    /// store.
    #[error("missing {side} environment block at site {site}")]
    Missing { side: Side, site: usize },

    /// Returned when a block would extend past the end of the chain.
    #[error("cannot extend the {side} environment to site {site} on a chain of length {length}")]
    OutOfBounds { side: Side, site: usize, length: usize },

    #[error("store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("MPS error: {0}")]
    MPSError(#[from] MPSError),

    #[error("MPO error: {0}")]
    MPOError(#[from] MPOError),
}
use EnvError::*;
pub type EnvResult<T> = Result<T, EnvError>;

/// The end of the chain an environment block is attached to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Side {
    Left,
    Right,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Left => write!(f, "left"),
            Self::Right => write!(f, "right"),
        }
    }
}

/// The trivial block `E[0, 0, 0] = 1` lying outside either end of the chain.
pub fn vacuum() -> Tensor {
    nd::ArrayD::from_elem(nd::IxDyn(&[1, 1, 1]), C64::one())
}

/// Grow a left block `E[a, w, a']` by one site, returning `E'[b, w', b']`.
pub fn extend_left(env: &Tensor, a: &nd::Array3<C64>, w: &nd::Array4<C64>)
    -> Tensor
{
    let a = a.view().into_dyn();
    let w = w.view().into_dyn();
    // [w, a', s, b]
    let t = tensordot(env, &a, &[0], &[1]);
    // [a', b, s', w']
    let t = tensordot(&t, &w, &[0, 2], &[2, 0]);
    // [b, w', b']
    tensordot(&t, &conj(&a), &[0, 2], &[1, 0])
}

/// Grow a right block `E[b, w', b']` by one site, returning `E'[a, w, a']`.
pub fn extend_right(env: &Tensor, a: &nd::Array3<C64>, w: &nd::Array4<C64>)
    -> Tensor
{
    let a = a.view().into_dyn();
    let w = w.view().into_dyn();
    // [w', b', s, a]
    let t = tensordot(env, &a, &[0], &[2]);
    // [b', a, s', w]
    let t = tensordot(&t, &w, &[0, 2], &[3, 0]);
    // [a, w, a']
    tensordot(&t, &conj(&a), &[0, 2], &[2, 0])
}

/// Stored left and right environment blocks for a single chain.
pub struct Environment {
    length: usize,
    store: TensorStore,
}

impl Environment {
    /// Create a new, empty set of blocks for a chain of `length` sites.
    pub fn new(length: usize, store: TensorStore) -> Self {
        Self { length, store }
    }

    /// Number of sites in the chain.
    pub fn len(&self) -> usize { self.length }

    /// Return `true` if the chain has no sites.
    pub fn is_empty(&self) -> bool { self.length == 0 }

    /// Read a stored block.
    pub fn read(&self, side: Side, site: usize) -> EnvResult<Tensor> {
        self.store.read(&Key::Env(side, site))
            .map_err(|err| match err {
                StoreError::NotFound { .. } => Missing { side, site },
                err => err.into(),
            })
    }

    /// Overwrite a stored block.
    pub fn write(&mut self, side: Side, site: usize, block: Tensor) -> EnvResult<()> {
        self.store.write(Key::Env(side, site), block)?;
        Ok(())
    }

    /// Return `true` if a block is stored.
    pub fn contains(&self, side: Side, site: usize) -> bool {
        self.store.contains(&Key::Env(side, site))
    }

    /// Contract everything from site `0` through `site` inclusive, without
    /// reading or writing any stored blocks.
    pub fn left<H>(&self, mps: &MPS, mpo: &H, site: usize) -> EnvResult<Tensor>
    where H: OperatorProvider + ?Sized
    {
        if site >= self.length {
            return Err(OutOfBounds { side: Side::Left, site, length: self.length });
        }
        (0..=site).try_fold(vacuum(), |env, k| -> EnvResult<Tensor> {
            let a = mps.read(k)?;
            let w = mpo.site_operator(k, self.length)?;
            Ok(extend_left(&env, &a, &w))
        })
    }

    /// Contract everything from the last site down to `site` inclusive,
    /// without reading or writing any stored blocks.
    pub fn right<H>(&self, mps: &MPS, mpo: &H, site: usize) -> EnvResult<Tensor>
    where H: OperatorProvider + ?Sized
    {
        if site >= self.length {
            return Err(OutOfBounds { side: Side::Right, site, length: self.length });
        }
        (site..self.length).rev().try_fold(vacuum(), |env, k| -> EnvResult<Tensor> {
            let a = mps.read(k)?;
            let w = mpo.site_operator(k, self.length)?;
            Ok(extend_right(&env, &a, &w))
        })
    }

    /// Rebuild the block on `side` that ends at `site` from its stored
    /// neighbor (`Left[site - 1]` or `Right[site + 1]`) and the current tensors
    /// at `site`, store it, and return it.
    pub fn add<H>(&mut self, mps: &MPS, mpo: &H, site: usize, side: Side)
        -> EnvResult<Tensor>
    where H: OperatorProvider + ?Sized
    {
        let oob = OutOfBounds { side, site, length: self.length };
        let a = mps.read(site)?;
        let w = mpo.site_operator(site, self.length)?;
        let block = match side {
            Side::Left => {
                if site == 0 || site >= self.length { return Err(oob); }
                extend_left(&self.read(Side::Left, site - 1)?, &a, &w)
            },
            Side::Right => {
                if site + 1 >= self.length { return Err(oob); }
                extend_right(&self.read(Side::Right, site + 1)?, &a, &w)
            },
        };
        self.write(side, site, block.clone())?;
        Ok(block)
    }

    /// Build and store the blocks needed before growth begins: `Left[0]` (and
    /// `Left[1]` for odd chain lengths) and `Right[L - 1]`.
    pub fn init_boundary<H>(&mut self, mps: &MPS, mpo: &H) -> EnvResult<()>
    where H: OperatorProvider + ?Sized
    {
        let w0 = mpo.site_operator(0, self.length)?;
        let mut block = extend_left(&vacuum(), &mps.read(0)?, &w0);
        self.write(Side::Left, 0, block.clone())?;
        for k in 1..=self.length % 2 {
            let w = mpo.site_operator(k, self.length)?;
            block = extend_left(&block, &mps.read(k)?, &w);
            self.write(Side::Left, k, block.clone())?;
        }
        let last = self.length - 1;
        let w = mpo.site_operator(last, self.length)?;
        let block = extend_right(&vacuum(), &mps.read(last)?, &w);
        self.write(Side::Right, last, block)?;
        Ok(())
    }

    /// Return the blocks adjacent to the window `(site, site + 1)`:
    /// `(Left[site - 1], Right[site + 2])`.
    pub fn env_prep(&self, site: usize) -> EnvResult<(Tensor, Tensor)> {
        if site == 0 || site + 2 >= self.length {
            return Err(OutOfBounds { side: Side::Left, site, length: self.length });
        }
        Ok((self.read(Side::Left, site - 1)?, self.read(Side::Right, site + 2)?))
    }

    /// Access the underlying store.
    pub fn store(&self) -> &TensorStore { &self.store }
}
