//! Truncated singular value decomposition of two-site wavefunctions.

use ndarray as nd;
use ndarray_linalg::{ error::LinalgError, SVDInto };
use num_complex::Complex64 as C64;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TruncError {
    /// Returned when no singular value survives the cutoff.
    #[error("no singular values above cutoff {cutoff:e}")]
    EmptySpectrum { cutoff: f64 },

    /// Returned when the maximum bond dimension is zero.
    #[error("maximum bond dimension must be nonzero")]
    ZeroChi,

    #[error("linalg error: {0}")]
    LinalgError(#[from] LinalgError),
}
use TruncError::*;
pub type TruncResult<T> = Result<T, TruncError>;

/// Output of [`truncate`].
#[derive(Clone, Debug)]
pub struct Truncation {
    /// Left factor with orthonormal columns, `(rows, rank)`.
    pub u: nd::Array2<C64>,
    /// Retained singular values, normalized to unit weight.
    pub s: nd::Array1<f64>,
    /// Right factor with orthonormal rows, `(rank, cols)`.
    pub vt: nd::Array2<C64>,
    /// Number of retained singular values.
    pub rank: usize,
    /// Sum of the squares of the discarded singular values, relative to the
    /// total weight of the input.
    pub discarded: f64,
}

/// Compute the SVD of `q` and keep at most `chi` singular values, each
/// strictly greater than `cutoff`.
///
/// Singular values are taken relative to the norm of `q`, so a normalized
/// wavefunction gives the usual Schmidt coefficients. The retained values are
/// renormalized so that their squares sum to one.
pub fn truncate(q: nd::Array2<C64>, chi: usize, cutoff: f64) -> TruncResult<Truncation> {
    if chi == 0 { return Err(ZeroChi); }
    let (Some(u), mut s, Some(vt)) = q.svd_into(true, true)?
        else { unreachable!() };
    let norm: f64 = s.iter().map(|sk| sk * sk).sum::<f64>().sqrt();
    if norm > 0.0 { s.mapv_inplace(|sk| sk / norm); }
    let rank = s.iter().take_while(|sk| **sk > cutoff).count().min(chi);
    if rank == 0 { return Err(EmptySpectrum { cutoff }); }
    let discarded: f64 = s.iter().skip(rank).map(|sk| sk * sk).sum();
    let mut s = s.slice(nd::s![..rank]).to_owned();
    let kept: f64 = s.iter().map(|sk| sk * sk).sum::<f64>().sqrt();
    s.mapv_inplace(|sk| sk / kept);
    let u = u.slice(nd::s![.., ..rank]).to_owned();
    let vt = vt.slice(nd::s![..rank, ..]).to_owned();
    Ok(Truncation { u, s, vt, rank, discarded })
}
