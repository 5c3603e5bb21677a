//! Expectation values on a mixed-canonical MPS.
//!
//! These functions assume the state left behind by a rightward two-site step
//! at `site`: every tensor left of `site` (and `site` itself) is
//! left-isometric, every tensor right of it is right-isometric, and the
//! spectrum of bond `site` is stored. This is exactly the state seen by the
//! callback of [`DMRG::final_sweep_with`][crate::dmrg::DMRG::final_sweep_with].
//!
//! Operators are plain `d × d` matrices `O[s', s] = ⟨s'|O|s⟩`.

use ndarray as nd;
use num_complex::Complex64 as C64;
use thiserror::Error;
use crate::{
    mps::{ MPSError, MPS },
    tensor::{ conj, tensordot, Tensor },
};

pub use crate::mps::entropy as entanglement_entropy;

#[derive(Debug, Error)]
pub enum ObsError {
    /// Returned when an operator does not act on the physical space.
    #[error("operator has shape {got:?} but the physical dimension is {d}")]
    BadOperator { got: Vec<usize>, d: usize },

    /// Returned when a site cannot serve as the orthogonality center.
    #[error("site {site} is out of bounds for a chain of length {length}")]
    SiteOutOfBounds { site: usize, length: usize },

    #[error("MPS error: {0}")]
    MPSError(#[from] MPSError),
}
use ObsError::*;
pub type ObsResult<T> = Result<T, ObsError>;

fn check_op(mps: &MPS, op: &nd::Array2<C64>) -> ObsResult<()> {
    let d = mps.phys_dim();
    if op.dim() == (d, d) {
        Ok(())
    } else {
        Err(BadOperator { got: op.shape().to_vec(), d })
    }
}

// left-isometric site tensor with the active bond spectrum absorbed into its
// right bond
fn center_tensor(mps: &MPS, site: usize) -> ObsResult<nd::Array3<C64>> {
    if site + 1 >= mps.len() {
        return Err(SiteOutOfBounds { site, length: mps.len() });
    }
    let mut c = mps.read(site)?;
    let s = mps.read_spectrum(site)?;
    c.axis_iter_mut(nd::Axis(2)).zip(&s)
        .for_each(|(mut v, sk)| { v.mapv_inplace(|x| x * *sk); });
    Ok(c)
}

// [s', a, b] = Σ_s O[s', s] A[s, a, b]
fn apply_op(op: &nd::Array2<C64>, a: &nd::Array3<C64>) -> Tensor {
    tensordot(&op.view().into_dyn(), &a.view().into_dyn(), &[1], &[0])
}

/// Expectation value `⟨O_site⟩`.
pub fn single_site(mps: &MPS, site: usize, op: &nd::Array2<C64>) -> ObsResult<C64> {
    check_op(mps, op)?;
    let c = center_tensor(mps, site)?;
    let oc = apply_op(op, &c);
    Ok(c.iter().zip(oc.iter()).map(|(x, y)| x.conj() * y).sum())
}

/// Two-point correlators `⟨O1_site O2_j⟩` for every `j` in `site + 1..L`,
/// in order of increasing `j`.
pub fn correlations(
    mps: &MPS,
    site: usize,
    op1: &nd::Array2<C64>,
    op2: &nd::Array2<C64>,
) -> ObsResult<Vec<C64>>
{
    check_op(mps, op1)?;
    check_op(mps, op2)?;
    let c = center_tensor(mps, site)?;
    let c_bra = conj(&c).into_dyn();
    // [b, b']
    let mut transfer: Tensor = tensordot(&apply_op(op1, &c), &c_bra, &[0, 1], &[0, 1]);
    let mut acc: Vec<C64> = Vec::with_capacity(mps.len() - site - 1);
    for j in site + 1..mps.len() {
        let b = mps.read(j)?;
        let b_ket = b.view().into_dyn();
        let b_bra = conj(&b).into_dyn();
        // [b', s', c]
        let x = tensordot(&transfer, &apply_op(op2, &b), &[0], &[1]);
        let val: C64
            = tensordot(&x, &b_bra, &[0, 1, 2], &[1, 0, 2])
            .iter().copied().sum();
        acc.push(val);
        // [b', s, c] then [c, c']
        let x = tensordot(&transfer, &b_ket, &[0], &[1]);
        transfer = tensordot(&x, &b_bra, &[0, 1], &[1, 0]);
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use num_traits::Zero;
    use crate::{
        mpo::{ XMAT, ZMAT },
        store::{ StoreConfig, TensorStore },
    };

    // product state |↑ → ↑ ...⟩ on six sites in mixed-canonical form around
    // bond 2: site 3 is |+⟩ = (|0⟩ + |1⟩)/√2, every other interior site is |0⟩
    fn product_state(root: &std::path::Path) -> MPS {
        let config = StoreConfig { root: root.to_path_buf(), ..StoreConfig::default() };
        let store = TensorStore::new(&config, "mps").unwrap();
        let mut mps = MPS::new(6, 2, store).unwrap();
        let one = C64::from(1.0);
        let select_left: nd::Array3<C64>
            = nd::Array3::from_shape_fn(
                (2, 2, 1), |(s, a, _)| if s == 0 && a == 0 { one } else { C64::zero() });
        let up: nd::Array3<C64>
            = nd::Array3::from_shape_fn(
                (2, 1, 1), |(s, _, _)| if s == 0 { one } else { C64::zero() });
        let plus: nd::Array3<C64>
            = nd::Array3::from_elem((2, 1, 1), C64::from(std::f64::consts::FRAC_1_SQRT_2));
        let select_right: nd::Array3<C64>
            = nd::Array3::from_shape_fn(
                (2, 1, 2), |(s, _, b)| if s == 0 && b == 0 { one } else { C64::zero() });
        mps.write(1, select_left).unwrap();
        mps.write(2, up).unwrap();
        mps.write(3, plus).unwrap();
        mps.write(4, select_right).unwrap();
        mps.write_spectrum(2, &nd::array![1.0]).unwrap();
        mps
    }

    #[test]
    fn product_state_expectations() {
        let root = tempfile::tempdir().unwrap();
        let mps = product_state(root.path());
        let z = single_site(&mps, 2, &ZMAT).unwrap();
        assert_abs_diff_eq!(z.re, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(z.im, 0.0, epsilon = 1e-12);
        let x = single_site(&mps, 2, &XMAT).unwrap();
        assert_abs_diff_eq!(x.norm(), 0.0, epsilon = 1e-12);

        // ⟨Z_2 Z_j⟩ for j = 3, 4, 5 and ⟨Z_2 X_3⟩
        let zz = correlations(&mps, 2, &ZMAT, &ZMAT).unwrap();
        assert_eq!(zz.len(), 3);
        assert_abs_diff_eq!(zz[0].re, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(zz[1].re, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(zz[2].re, 1.0, epsilon = 1e-12);
        let zx = correlations(&mps, 2, &ZMAT, &XMAT).unwrap();
        assert_abs_diff_eq!(zx[0].re, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn bad_inputs_are_rejected() {
        let root = tempfile::tempdir().unwrap();
        let mps = product_state(root.path());
        let big: nd::Array2<C64> = nd::Array2::zeros((3, 3));
        assert!(matches!(single_site(&mps, 2, &big), Err(BadOperator { .. })));
        assert!(matches!(single_site(&mps, 5, &ZMAT), Err(SiteOutOfBounds { .. })));
        assert!(matches!(single_site(&mps, 3, &ZMAT), Err(MPSError(_))));
    }

    #[test]
    fn entropy_of_bell_pair() {
        let s = nd::array![std::f64::consts::FRAC_1_SQRT_2, std::f64::consts::FRAC_1_SQRT_2];
        assert_abs_diff_eq!(entanglement_entropy(&s), std::f64::consts::LN_2, epsilon = 1e-12);
    }
}
