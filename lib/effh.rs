//! Effective Hamiltonian on a two-site window.
//!
//! With the rest of the chain summarized by a left block `L[a, w, a']` and a
//! right block `R[c, w'', c']`, the Hamiltonian restricted to sites `(i, i +
//! 1)` acts on two-site wavefunctions `θ[a, s1, s2, c]` as
//! ```text
//! (Hθ)[a', s1', s2', c']
//!     = Σ L[a, w, a'] W1[s1, s1', w, w'] W2[s2, s2', w', w''] R[c, w'', c'] θ[a, s1, s2, c]
//! ```
//! The map is applied by a sequence of pairwise contractions and the dense
//! `(c1 d²c2) × (c1 d² c2)` matrix is never formed.

use ndarray as nd;
use num_complex::Complex64 as C64;
use thiserror::Error;
use crate::{
    lanczos::LinearOperator,
    tensor::{ flatten, reshape, tensordot, Tensor },
};

#[derive(Debug, Error)]
pub enum EffHError {
    /// Returned when the environment blocks and operators do not fit together.
    #[error("incompatible {what}: expected {expected:?}, got {got:?}")]
    ShapeMismatch { what: &'static str, expected: Vec<usize>, got: Vec<usize> },
}
use EffHError::*;
pub type EffHResult<T> = Result<T, EffHError>;

/// Matrix-free two-site effective Hamiltonian.
#[derive(Clone, Debug)]
pub struct EffH {
    left: Tensor,
    w1: Tensor,
    w2: Tensor,
    right: Tensor,
    c1: usize,
    d: usize,
    c2: usize,
}

fn expect_shape(what: &'static str, got: &[usize], expected: &[usize]) -> EffHResult<()> {
    if got == expected {
        Ok(())
    } else {
        Err(ShapeMismatch { what, expected: expected.to_vec(), got: got.to_vec() })
    }
}

impl EffH {
    /// Assemble the effective Hamiltonian from its four pieces, checking that
    /// every shared index has matching dimension.
    pub fn new(
        left: Tensor,
        w1: nd::Array4<C64>,
        w2: nd::Array4<C64>,
        right: Tensor,
    ) -> EffHResult<Self>
    {
        if left.ndim() != 3 {
            return Err(ShapeMismatch {
                what: "left block rank", expected: vec![3], got: vec![left.ndim()] });
        }
        if right.ndim() != 3 {
            return Err(ShapeMismatch {
                what: "right block rank", expected: vec![3], got: vec![right.ndim()] });
        }
        let (c1, wl, _) = (left.shape()[0], left.shape()[1], left.shape()[2]);
        let (c2, wr, _) = (right.shape()[0], right.shape()[1], right.shape()[2]);
        let d = w1.shape()[0];
        expect_shape("left block", left.shape(), &[c1, wl, c1])?;
        expect_shape("right block", right.shape(), &[c2, wr, c2])?;
        let wm = w1.shape()[3];
        expect_shape("left operator", w1.shape(), &[d, d, wl, wm])?;
        expect_shape("right operator", w2.shape(), &[d, d, wm, wr])?;
        Ok(Self {
            left,
            w1: w1.into_dyn(),
            w2: w2.into_dyn(),
            right,
            c1,
            d,
            c2,
        })
    }

    /// Dimensions `(c1, d, c2)` of the two-site wavefunction.
    pub fn dims(&self) -> (usize, usize, usize) { (self.c1, self.d, self.c2) }

    /// Apply to a two-site wavefunction given as a rank-4 tensor
    /// `θ[a, s1, s2, c]`.
    pub fn apply(&self, theta: &Tensor) -> Tensor {
        // [a, a', s1, s1', w']
        let x = tensordot(&self.left, &self.w1, &[1], &[2]);
        // [a', s1', w', s2, c]
        let x = tensordot(&x, theta, &[0, 2], &[0, 1]);
        // [a', s1', c, s2', w'']
        let x = tensordot(&x, &self.w2, &[2, 3], &[2, 0]);
        // [a', s1', s2', c']
        tensordot(&x, &self.right, &[4, 2], &[1, 0])
    }

    /// Build the dense matrix `H[out, in]` column by column.
    ///
    /// Only practical for small windows.
    pub fn to_dense(&self) -> nd::Array2<C64> {
        let n = self.dim();
        let mut h: nd::Array2<C64> = nd::Array2::zeros((n, n));
        let mut e: nd::Array1<C64> = nd::Array1::zeros(n);
        for k in 0..n {
            e[k] = C64::from(1.0);
            h.column_mut(k).assign(&self.matvec(&e));
            e[k] = C64::from(0.0);
        }
        h
    }
}

impl LinearOperator for EffH {
    fn dim(&self) -> usize { self.c1 * self.d * self.d * self.c2 }

    fn matvec(&self, v: &nd::Array1<C64>) -> nd::Array1<C64> {
        assert_eq!(v.len(), self.dim(), "EffH::matvec: wrong vector length");
        let theta = reshape(v, &[self.c1, self.d, self.d, self.c2])
            .expect("EffH::matvec: length checked above");
        flatten(&self.apply(&theta))
    }
}
