//! Matrix product operators for one-dimensional chains.
//!
//! An [`OperatorProvider`] hands out the rank-4 bulk tensor for each interior
//! site and rank-3 tensors for the two chain ends. All operator tensors use
//! the index order `W[s, s', w, w']`, where `s` is the physical index acted on
//! (ket), `s'` the physical index produced (bra), and `w`, `w'` the left and
//! right virtual bonds. In this convention a single-site operator *O* appears
//! as
//! ```text
//! W[s, s', w, w'] = ⟨s'|O|s⟩
//! ```
//! i.e. as the transpose of its usual matrix.
//!
//! The left boundary is `WL[s, s', w']` and the right boundary is
//! `WR[s, s', w]`; the full Hamiltonian is the product
//! `WL · W(1) · ... · W(L-2) · WR` over virtual bonds.

use itertools::Itertools;
use ndarray as nd;
use num_complex::Complex64 as C64;
use num_traits::{ One, Zero };
use once_cell::sync::Lazy;
use thiserror::Error;
use crate::tensor::{ eye, reshape, tensordot, to_matrix, TensorError };

#[derive(Debug, Error)]
pub enum MPOError {
    /// Returned when an operator is requested for a site beyond the end of the
    /// chain.
    #[error("site {site} is out of bounds for a chain of length {length}")]
    SiteOutOfBounds { site: usize, length: usize },

    /// Returned when a provider's tensors have inconsistent shapes.
    #[error("inconsistent operator shape at {what}: expected {expected:?}, got {got:?}")]
    BadShape { what: String, expected: Vec<usize>, got: Vec<usize> },

    /// Returned when a dense operator is requested for too long a chain.
    #[error("refusing to build a dense operator on {0} sites")]
    TooLarge(usize),

    #[error("tensor error: {0}")]
    TensorError(#[from] TensorError),
}
use MPOError::*;
pub type MPOResult<T> = Result<T, MPOError>;

/// Make the Pauli X matrix.
pub fn make_x() -> nd::Array2<C64> {
    nd::array![
        [C64::zero(), C64::one() ],
        [C64::one(),  C64::zero()],
    ]
}

/// Lazy-static version of [`make_x`].
pub static XMAT: Lazy<nd::Array2<C64>> = Lazy::new(make_x);

/// Make the Pauli Z matrix.
pub fn make_z() -> nd::Array2<C64> {
    nd::array![
        [C64::one(),   C64::zero()],
        [C64::zero(), -C64::one() ],
    ]
}

/// Lazy-static version of [`make_z`].
pub static ZMAT: Lazy<nd::Array2<C64>> = Lazy::new(make_z);

/// Make the spin raising operator |0⟩⟨1|.
pub fn make_sp() -> nd::Array2<C64> {
    nd::array![
        [C64::zero(), C64::one() ],
        [C64::zero(), C64::zero()],
    ]
}

/// Lazy-static version of [`make_sp`].
pub static SPMAT: Lazy<nd::Array2<C64>> = Lazy::new(make_sp);

/// Make the spin lowering operator |1⟩⟨0|.
pub fn make_sm() -> nd::Array2<C64> {
    nd::array![
        [C64::zero(), C64::zero()],
        [C64::one(),  C64::zero()],
    ]
}

/// Lazy-static version of [`make_sm`].
pub static SMMAT: Lazy<nd::Array2<C64>> = Lazy::new(make_sm);

/// Make the projector onto |1⟩, (1 - Z) / 2.
pub fn make_pz() -> nd::Array2<C64> {
    nd::array![
        [C64::zero(), C64::zero()],
        [C64::zero(), C64::one() ],
    ]
}

/// Lazy-static version of [`make_pz`].
pub static PZMAT: Lazy<nd::Array2<C64>> = Lazy::new(make_pz);

// place a single-site operator in a bulk tensor slot
fn put4(w: &mut nd::Array4<C64>, l: usize, r: usize, op: &nd::Array2<C64>) {
    w.slice_mut(nd::s![.., .., l, r]).assign(&op.t());
}

// place a single-site operator in a boundary tensor slot
fn put3(w: &mut nd::Array3<C64>, k: usize, op: &nd::Array2<C64>) {
    w.slice_mut(nd::s![.., .., k]).assign(&op.t());
}

/// Source of the operator tensors making up a Hamiltonian MPO.
///
/// Implementors must return Hermitian-consistent tensors: the MPO as a whole
/// has to represent a Hermitian operator for the ground-state search to be
/// meaningful.
pub trait OperatorProvider {
    /// Physical (local Hilbert space) dimension.
    fn phys_dim(&self) -> usize;

    /// Bulk operator `W[s, s', w, w']` for interior site `site`.
    fn bulk(&self, site: usize) -> nd::Array4<C64>;

    /// Left boundary operator `WL[s, s', w']`.
    fn left_boundary(&self) -> nd::Array3<C64>;

    /// Right boundary operator `WR[s, s', w]`.
    fn right_boundary(&self) -> nd::Array3<C64>;

    /// Return the operator for `site` in a chain of `length` sites, with the
    /// boundary tensors given a unit outer virtual bond so that every site
    /// carries a rank-4 tensor.
    fn site_operator(&self, site: usize, length: usize)
        -> MPOResult<nd::Array4<C64>>
    {
        if site >= length {
            Err(SiteOutOfBounds { site, length })
        } else if site == 0 {
            Ok(self.left_boundary().insert_axis(nd::Axis(2)))
        } else if site == length - 1 {
            Ok(self.right_boundary().insert_axis(nd::Axis(3)))
        } else {
            Ok(self.bulk(site))
        }
    }

    /// Check that every tensor the provider would return for a chain of
    /// `length` sites has a shape consistent with its neighbors.
    fn check_shapes(&self, length: usize) -> MPOResult<()> {
        let d = self.phys_dim();
        let mut bond = 1;
        for site in 0..length {
            let w = self.site_operator(site, length)?;
            let sh = w.shape();
            if sh[0] != d || sh[1] != d || sh[2] != bond {
                return Err(BadShape {
                    what: format!("site {site}"),
                    expected: vec![d, d, bond, sh[3]],
                    got: sh.to_vec(),
                });
            }
            bond = sh[3];
        }
        if bond != 1 {
            return Err(BadShape {
                what: "right boundary".into(),
                expected: vec![1],
                got: vec![bond],
            });
        }
        Ok(())
    }
}

impl<T> OperatorProvider for &T
where T: OperatorProvider + ?Sized
{
    fn phys_dim(&self) -> usize { (**self).phys_dim() }

    fn bulk(&self, site: usize) -> nd::Array4<C64> { (**self).bulk(site) }

    fn left_boundary(&self) -> nd::Array3<C64> { (**self).left_boundary() }

    fn right_boundary(&self) -> nd::Array3<C64> { (**self).right_boundary() }
}

/// Transverse-field Ising chain,
/// ```text
/// H = -J Σ_i Z_i Z_{i+1} - h_x Σ_i X_i  [ - b (Z_0 + Z_{L-1}) ]
/// ```
/// where the bracketed polarizing term is present only if `boundary_field` is
/// `Some(b)`.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TFIM {
    /// Nearest-neighbor coupling.
    pub j: f64,
    /// Transverse field strength.
    pub h_x: f64,
    /// Optional longitudinal field applied to both chain ends.
    pub boundary_field: Option<f64>,
}

impl TFIM {
    /// Default strength of the polarizing boundary field.
    pub const DEFAULT_BOUNDARY_FIELD: f64 = 10.0;

    /// Create a new transverse-field Ising model with free ends.
    pub fn new(j: f64, h_x: f64) -> Self {
        Self { j, h_x, boundary_field: None }
    }

    /// Add a polarizing field to both chain ends.
    pub fn polarized(self, b: f64) -> Self {
        Self { boundary_field: Some(b), ..self }
    }

    fn end_field(&self) -> nd::Array2<C64> {
        let mut op = XMAT.mapv(|x| -self.h_x * x);
        if let Some(b) = self.boundary_field {
            op.zip_mut_with(&*ZMAT, |o, z| { *o -= b * z; });
        }
        op
    }
}

impl OperatorProvider for TFIM {
    fn phys_dim(&self) -> usize { 2 }

    fn bulk(&self, _site: usize) -> nd::Array4<C64> {
        let mut w: nd::Array4<C64> = nd::Array4::zeros((2, 2, 3, 3));
        put4(&mut w, 0, 0, &eye(2));
        put4(&mut w, 0, 1, &ZMAT.mapv(|z| -self.j * z));
        put4(&mut w, 0, 2, &XMAT.mapv(|x| -self.h_x * x));
        put4(&mut w, 1, 2, &ZMAT);
        put4(&mut w, 2, 2, &eye(2));
        w
    }

    fn left_boundary(&self) -> nd::Array3<C64> {
        let mut w: nd::Array3<C64> = nd::Array3::zeros((2, 2, 3));
        put3(&mut w, 0, &eye(2));
        put3(&mut w, 1, &ZMAT.mapv(|z| -self.j * z));
        put3(&mut w, 2, &self.end_field());
        w
    }

    fn right_boundary(&self) -> nd::Array3<C64> {
        let mut w: nd::Array3<C64> = nd::Array3::zeros((2, 2, 3));
        put3(&mut w, 0, &self.end_field());
        put3(&mut w, 1, &ZMAT);
        put3(&mut w, 2, &eye(2));
        w
    }
}

/// The zero Hamiltonian, written as two pass-through identity channels that
/// never combine into a nonzero term.
///
/// Every state is a ground state with energy 0, which makes this provider a
/// convenient check of the machinery independent of any physics.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IdentityMPO {
    pub d: usize,
}

impl Default for IdentityMPO {
    fn default() -> Self { Self { d: 2 } }
}

impl OperatorProvider for IdentityMPO {
    fn phys_dim(&self) -> usize { self.d }

    fn bulk(&self, _site: usize) -> nd::Array4<C64> {
        let mut w: nd::Array4<C64> = nd::Array4::zeros((self.d, self.d, 2, 2));
        put4(&mut w, 0, 0, &eye(self.d));
        put4(&mut w, 1, 1, &eye(self.d));
        w
    }

    fn left_boundary(&self) -> nd::Array3<C64> {
        let mut w: nd::Array3<C64> = nd::Array3::zeros((self.d, self.d, 2));
        put3(&mut w, 0, &eye(self.d));
        w
    }

    fn right_boundary(&self) -> nd::Array3<C64> {
        let mut w: nd::Array3<C64> = nd::Array3::zeros((self.d, self.d, 2));
        put3(&mut w, 1, &eye(self.d));
        w
    }
}

/// Supersymmetric lattice fermion chain with constrained hopping.
///
/// Occupation is tracked by the projector `P = (1 - Z) / 2`. Besides the
/// occupation energy (`2P` in the bulk, `P` on the two end sites), the model
/// contains the Hermitian pair of four-site terms
/// ```text
/// -J P_i (σ⁺P)_{i+1} (Pσ⁻)_{i+2} P_{i+3} + h.c.
/// ```
/// which terminate early at the right end of the chain.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SUSY {
    pub j: f64,
}

impl Default for SUSY {
    fn default() -> Self { Self { j: 1.0 } }
}

impl SUSY {
    fn sp_pz(&self) -> nd::Array2<C64> { SPMAT.dot(&*PZMAT) }

    fn pz_sm(&self) -> nd::Array2<C64> { PZMAT.dot(&*SMMAT) }
}

impl OperatorProvider for SUSY {
    fn phys_dim(&self) -> usize { 2 }

    fn bulk(&self, _site: usize) -> nd::Array4<C64> {
        let mut w: nd::Array4<C64> = nd::Array4::zeros((2, 2, 7, 7));
        put4(&mut w, 0, 0, &eye(2));
        put4(&mut w, 0, 1, &PZMAT);
        put4(&mut w, 1, 2, &self.sp_pz().mapv(|x| -self.j * x));
        put4(&mut w, 1, 3, &self.pz_sm().mapv(|x| -self.j * x));
        put4(&mut w, 2, 4, &self.pz_sm());
        put4(&mut w, 3, 5, &self.sp_pz());
        put4(&mut w, 0, 6, &PZMAT.mapv(|x| 2.0 * x));
        put4(&mut w, 4, 6, &PZMAT);
        put4(&mut w, 5, 6, &PZMAT);
        put4(&mut w, 6, 6, &eye(2));
        w
    }

    fn left_boundary(&self) -> nd::Array3<C64> {
        let mut w: nd::Array3<C64> = nd::Array3::zeros((2, 2, 7));
        put3(&mut w, 0, &eye(2));
        put3(&mut w, 1, &PZMAT);
        put3(&mut w, 2, &self.sp_pz().mapv(|x| -self.j * x));
        put3(&mut w, 3, &self.pz_sm().mapv(|x| -self.j * x));
        put3(&mut w, 6, &PZMAT);
        w
    }

    fn right_boundary(&self) -> nd::Array3<C64> {
        let mut w: nd::Array3<C64> = nd::Array3::zeros((2, 2, 7));
        put3(&mut w, 0, &PZMAT);
        put3(&mut w, 2, &self.pz_sm());
        put3(&mut w, 3, &self.sp_pz());
        put3(&mut w, 4, &PZMAT);
        put3(&mut w, 5, &PZMAT);
        put3(&mut w, 6, &eye(2));
        w
    }
}

/// Provider with site-dependent bulk tensors, e.g. for disordered or impurity
/// models.
pub struct SiteDependent<F>
where F: Fn(usize) -> nd::Array4<C64>
{
    d: usize,
    left: nd::Array3<C64>,
    right: nd::Array3<C64>,
    bulk: F,
}

impl<F> SiteDependent<F>
where F: Fn(usize) -> nd::Array4<C64>
{
    /// Create a new provider from fixed boundary tensors and a function
    /// returning the bulk tensor for each interior site.
    pub fn new(
        d: usize,
        left: nd::Array3<C64>,
        right: nd::Array3<C64>,
        bulk: F,
    ) -> Self
    {
        Self { d, left, right, bulk }
    }
}

impl<F> OperatorProvider for SiteDependent<F>
where F: Fn(usize) -> nd::Array4<C64>
{
    fn phys_dim(&self) -> usize { self.d }

    fn bulk(&self, site: usize) -> nd::Array4<C64> { (self.bulk)(site) }

    fn left_boundary(&self) -> nd::Array3<C64> { self.left.clone() }

    fn right_boundary(&self) -> nd::Array3<C64> { self.right.clone() }
}

/// Largest chain for which [`dense_hamiltonian`] will build a matrix.
pub const DENSE_MAX_SITES: usize = 14;

/// Contract the full MPO into a dense `d^L × d^L` matrix `H[b, k] = ⟨b|H|k⟩`,
/// with site 0 as the most significant digit of both indices.
///
/// Intended for verification on small chains only.
pub fn dense_hamiltonian<H>(provider: &H, length: usize)
    -> MPOResult<nd::Array2<C64>>
where H: OperatorProvider + ?Sized
{
    if length > DENSE_MAX_SITES { return Err(TooLarge(length)); }
    provider.check_shapes(length)?;
    let d = provider.phys_dim();
    // acc[k, b, w]
    let w0 = provider.site_operator(0, length)?;
    let mut acc: nd::ArrayD<C64>
        = w0.index_axis(nd::Axis(2), 0).to_owned().into_dyn();
    let mut dim = d;
    for site in 1..length {
        let w = provider.site_operator(site, length)?.into_dyn();
        // [k, b, s, s', w']
        let t = tensordot(&acc, &w, &[2], &[2]);
        let wr = t.shape()[4];
        let t = t.permuted_axes(vec![0, 2, 1, 3, 4]);
        acc = reshape(&t, &[dim * d, dim * d, wr])?;
        dim *= d;
    }
    let kb = to_matrix(&acc, dim, dim)?;
    Ok(kb.reversed_axes())
}

/// Return `true` if `mat` is Hermitian to within `tol`, elementwise.
pub fn is_hermitian(mat: &nd::Array2<C64>, tol: f64) -> bool {
    let (n, m) = mat.dim();
    n == m
        && (0..n).cartesian_product(0..n)
            .all(|(i, j)| (mat[[i, j]] - mat[[j, i]].conj()).norm() <= tol)
}
