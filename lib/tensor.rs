//! Dense complex tensors and the handful of operations the rest of the crate
//! needs on them.
//!
//! Every tensor is an [`nd::ArrayD`] of [`C64`]. Contraction follows the usual
//! generalization of the matrix product: a subset of axes on each operand is
//! summed over pairwise, and the remaining ("free") axes of the left operand
//! are placed before those of the right operand in the result.
//!
//! <blockquote>
//!   <p style="font-size:20px">
//!     <i>C</i><sub>
//!       <i>a</i><sub>1</sub>,...,<i>a</i><sub><i>N</i></sub>,
//!       <i>b</i><sub>1</sub>,...,<i>b</i><sub><i>M</i></sub>
//!     </sub>
//!       = Σ<sub><i>α</i><sub>1</sub>,...,<i>α</i><sub><i>D</i></sub></sub> [
//!         <i>A</i><sub>
//!           <i>a</i><sub>1</sub>,...,<i>a</i><sub><i>N</i></sub>,
//!           <i>α</i><sub>1</sub>,...,<i>α</i><sub><i>D</i></sub>
//!         </sub>
//!         × <i>B</i><sub>
//!           <i>α</i><sub>1</sub>,...,<i>α</i><sub><i>D</i></sub>,
//!           <i>b</i><sub>1</sub>,...,<i>b</i><sub><i>M</i></sub>
//!         </sub>
//!       ]
//!   </p>
//! </blockquote>
//!
//! Internally, contracted axes are moved to the inner positions of both
//! operands, which are then fused into matrices so that the sum is a single
//! matrix-matrix product.
//!
//! ```
//! use ndarray as nd;
//! use num_complex::Complex64 as C64;
//! use dmrg_chain::tensor::tensordot;
//!
//! let a: nd::ArrayD<C64> = nd::ArrayD::from_elem(vec![3, 4], C64::from(1.0));
//! let b: nd::ArrayD<C64> = nd::ArrayD::from_elem(vec![4, 5], C64::from(2.0));
//! let c = tensordot(&a, &b, &[1], &[0]); // C_{a,c} = A_{a,b} B_{b,c}
//! assert_eq!(c.shape(), &[3, 5]);
//! assert_eq!(c[[0, 0]], C64::from(8.0));
//! ```

use ndarray as nd;
use num_complex::Complex64 as C64;
use num_traits::Zero;
use rand::Rng;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TensorError {
    /// Returned when a reshape is requested into a shape with a different
    /// total number of elements.
    #[error("error in reshape: cannot reshape {from:?} into {to:?}")]
    IncompatibleReshape { from: Vec<usize>, to: Vec<usize> },

    /// Returned when a tensor is expected to have a particular rank.
    #[error("error in tensor conversion: expected rank {expected}, got {got}")]
    WrongRank { expected: usize, got: usize },

    /// Wrapped `ndarray` shape error.
    #[error("ndarray shape error: {0}")]
    Shape(#[from] nd::ShapeError),
}
use TensorError::*;
pub type TensorResult<T> = Result<T, TensorError>;

/// A dense, dynamically ranked complex tensor.
pub type Tensor = nd::ArrayD<C64>;

/// Size in bytes of a single tensor element.
pub const ELEM_BYTES: usize = std::mem::size_of::<C64>();

/// Return the number of bytes occupied by the elements of `t`.
#[inline]
pub fn nbytes<S, D>(t: &nd::ArrayBase<S, D>) -> usize
where
    S: nd::Data<Elem = C64>,
    D: nd::Dimension,
{
    t.len() * ELEM_BYTES
}

// copy elements out in logical (row-major) order, regardless of the memory
// layout of `t`
fn logical_vec<S, D>(t: &nd::ArrayBase<S, D>) -> Vec<C64>
where
    S: nd::Data<Elem = C64>,
    D: nd::Dimension,
{
    t.iter().copied().collect()
}

/// Reshape a tensor in row-major order.
///
/// Unlike [`nd::ArrayBase::into_shape`], this never reinterprets a
/// column-major buffer, so the result is always the row-major reshape of the
/// logical array.
///
/// Fails if the total number of elements differs.
pub fn reshape<S, D>(t: &nd::ArrayBase<S, D>, shape: &[usize])
    -> TensorResult<Tensor>
where
    S: nd::Data<Elem = C64>,
    D: nd::Dimension,
{
    let len: usize = shape.iter().product();
    if len != t.len() {
        return Err(IncompatibleReshape {
            from: t.shape().to_vec(),
            to: shape.to_vec(),
        });
    }
    Ok(nd::ArrayD::from_shape_vec(nd::IxDyn(shape), logical_vec(t))?)
}

/// Reshape into a matrix in row-major order.
pub fn to_matrix<S, D>(t: &nd::ArrayBase<S, D>, rows: usize, cols: usize)
    -> TensorResult<nd::Array2<C64>>
where
    S: nd::Data<Elem = C64>,
    D: nd::Dimension,
{
    if rows * cols != t.len() {
        return Err(IncompatibleReshape {
            from: t.shape().to_vec(),
            to: vec![rows, cols],
        });
    }
    Ok(nd::Array2::from_shape_vec((rows, cols), logical_vec(t))?)
}

/// Flatten into a vector in row-major order.
pub fn flatten<S, D>(t: &nd::ArrayBase<S, D>) -> nd::Array1<C64>
where
    S: nd::Data<Elem = C64>,
    D: nd::Dimension,
{
    nd::Array1::from_vec(logical_vec(t))
}

/// Convert a dynamically ranked tensor into a rank-3 array.
pub fn into_rank3(t: Tensor) -> TensorResult<nd::Array3<C64>> {
    let got = t.ndim();
    t.into_dimensionality::<nd::Ix3>()
        .map_err(|_| WrongRank { expected: 3, got })
}

/// Contract `a` and `b` over the axis pairs `(axes_a[k], axes_b[k])`.
///
/// The result carries the free axes of `a` (in their original order)
/// followed by the free axes of `b`.
///
/// # Panics
/// Panics if `axes_a` and `axes_b` have different lengths or if any paired
/// axes have different dimensions, in the same way that
/// [`nd::ArrayBase::dot`] panics on incompatible shapes.
pub fn tensordot<S1, S2>(
    a: &nd::ArrayBase<S1, nd::IxDyn>,
    b: &nd::ArrayBase<S2, nd::IxDyn>,
    axes_a: &[usize],
    axes_b: &[usize],
) -> Tensor
where
    S1: nd::Data<Elem = C64>,
    S2: nd::Data<Elem = C64>,
{
    assert_eq!(
        axes_a.len(), axes_b.len(),
        "tensordot: mismatched number of contraction axes",
    );
    let sh_a = a.shape();
    let sh_b = b.shape();
    axes_a.iter().zip(axes_b)
        .for_each(|(ka, kb)| {
            assert_eq!(
                sh_a[*ka], sh_b[*kb],
                "tensordot: axis {ka} of lhs does not match axis {kb} of rhs",
            );
        });
    let free_a: Vec<usize>
        = (0..a.ndim()).filter(|k| !axes_a.contains(k)).collect();
    let free_b: Vec<usize>
        = (0..b.ndim()).filter(|k| !axes_b.contains(k)).collect();
    let m: usize = free_a.iter().map(|k| sh_a[*k]).product();
    let n: usize = free_b.iter().map(|k| sh_b[*k]).product();
    let inner: usize = axes_a.iter().map(|k| sh_a[*k]).product();

    let perm_a: Vec<usize>
        = free_a.iter().chain(axes_a.iter()).copied().collect();
    let perm_b: Vec<usize>
        = axes_b.iter().chain(free_b.iter()).copied().collect();
    let mat_a = nd::Array2::from_shape_vec(
        (m, inner), logical_vec(&a.view().permuted_axes(perm_a)))
        .expect("tensordot: lhs element count is m * inner by construction");
    let mat_b = nd::Array2::from_shape_vec(
        (inner, n), logical_vec(&b.view().permuted_axes(perm_b)))
        .expect("tensordot: rhs element count is inner * n by construction");
    let mat_c = mat_a.dot(&mat_b);

    let shape: Vec<usize>
        = free_a.iter().map(|k| sh_a[*k])
        .chain(free_b.iter().map(|k| sh_b[*k]))
        .collect();
    nd::ArrayD::from_shape_vec(nd::IxDyn(&shape), logical_vec(&mat_c))
        .expect("tensordot: result element count is m * n by construction")
}

/// Compute ⟨*a*|*b*⟩ = Σ<sub>*k*</sub> *a*<sub>*k*</sub><sup>*</sup>
/// *b*<sub>*k*</sub>.
#[inline]
pub fn inner(a: &nd::Array1<C64>, b: &nd::Array1<C64>) -> C64 {
    a.iter().zip(b)
        .map(|(ak, bk)| ak.conj() * bk)
        .fold(C64::zero(), |acc, x| acc + x)
}

/// Euclidean norm of a vector.
#[inline]
pub fn norm(a: &nd::Array1<C64>) -> f64 {
    a.iter().map(|ak| ak.norm_sqr()).sum::<f64>().sqrt()
}

/// Normalize a vector in place, returning its original norm.
///
/// Vectors of zero norm are left untouched.
#[inline]
pub fn normalize(a: &mut nd::Array1<C64>) -> f64 {
    let n = norm(a);
    if n > 0.0 { a.mapv_inplace(|ak| ak / n); }
    n
}

/// Element-wise complex conjugate.
#[inline]
pub fn conj<S, D>(t: &nd::ArrayBase<S, D>) -> nd::Array<C64, D>
where
    S: nd::Data<Elem = C64>,
    D: nd::Dimension,
{
    t.mapv(|tk| tk.conj())
}

/// Draw a random vector with independent components whose real and
/// imaginary parts are uniform on `[0, 1)`.
pub fn random_vector<R>(n: usize, rng: &mut R) -> nd::Array1<C64>
where R: Rng + ?Sized
{
    (0..n).map(|_| C64::new(rng.gen(), rng.gen())).collect()
}

/// Return the `n × n` identity as a complex matrix.
pub fn eye(n: usize) -> nd::Array2<C64> {
    nd::Array2::from_shape_fn((n, n), |(i, j)| {
        if i == j { C64::from(1.0) } else { C64::zero() }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{ rngs::StdRng, SeedableRng };

    fn random_tensor(shape: &[usize], rng: &mut StdRng) -> Tensor {
        nd::ArrayD::from_shape_fn(nd::IxDyn(shape), |_| {
            C64::new(rng.gen::<f64>() - 0.5, rng.gen::<f64>() - 0.5)
        })
    }

    #[test]
    fn tensordot_matches_explicit_sum() {
        let mut rng = StdRng::seed_from_u64(10);
        let a = random_tensor(&[2, 3, 4], &mut rng);
        let b = random_tensor(&[4, 5, 2], &mut rng);
        // C[j, l] = Σ_{i, k} A[i, j, k] B[k, l, i]
        let c = tensordot(&a, &b, &[0, 2], &[2, 0]);
        assert_eq!(c.shape(), &[3, 5]);
        for j in 0..3 {
            for l in 0..5 {
                let mut acc = C64::zero();
                for i in 0..2 {
                    for k in 0..4 {
                        acc += a[[i, j, k]] * b[[k, l, i]];
                    }
                }
                assert_abs_diff_eq!(c[[j, l]].re, acc.re, epsilon = 1e-12);
                assert_abs_diff_eq!(c[[j, l]].im, acc.im, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn tensordot_full_contraction_is_scalar() {
        let mut rng = StdRng::seed_from_u64(11);
        let a = random_tensor(&[3, 2], &mut rng);
        let c = tensordot(&a, &conj(&a), &[0, 1], &[0, 1]);
        assert_eq!(c.ndim(), 0);
        let expected: f64 = a.iter().map(|x| x.norm_sqr()).sum();
        let scalar = c.iter().next().copied().unwrap();
        assert_abs_diff_eq!(scalar.re, expected, epsilon = 1e-12);
        assert_abs_diff_eq!(scalar.im, 0.0, epsilon = 1e-12);
    }

    #[test]
    #[should_panic]
    fn tensordot_rejects_mismatched_axes() {
        let a: Tensor = nd::ArrayD::zeros(nd::IxDyn(&[2, 3]));
        let b: Tensor = nd::ArrayD::zeros(nd::IxDyn(&[2, 3]));
        tensordot(&a, &b, &[1], &[0]);
    }

    #[test]
    fn reshape_ignores_memory_layout() {
        let m: nd::Array2<C64>
            = nd::Array2::from_shape_fn((2, 3), |(i, j)| C64::from((3 * i + j) as f64));
        let mt = m.t(); // column-major view of the transpose
        let r = reshape(&mt, &[6]).unwrap();
        let expected = [0.0, 3.0, 1.0, 4.0, 2.0, 5.0];
        r.iter().zip(expected)
            .for_each(|(rk, ek)| assert_eq!(rk.re, ek));
        assert!(reshape(&m, &[4]).is_err());
    }
}
