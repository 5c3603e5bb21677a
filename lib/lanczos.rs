//! Lanczos iteration for the lowest eigenpair of a Hermitian operator.
//!
//! The operator is only ever applied to vectors (see [`LinearOperator`]). A
//! Krylov basis is built from a start vector, the projection of the operator
//! onto that basis is accumulated as a real symmetric tridiagonal matrix, and
//! the lowest eigenpair of the tridiagonal matrix is lifted back to the full
//! space.
//!
//! Two variants are available (see [`LanczosMode`]): the plain three-term
//! recurrence, which only orthogonalizes each new vector against the previous
//! two, and full reorthogonalization against the whole basis, which is more
//! expensive but keeps the basis orthonormal to working precision.
//!
//! Iteration stops early if the residual norm drops below a deflation
//! threshold (an invariant subspace has been found) or, optionally, if the
//! lowest Ritz value has stopped moving. Failures of the small eigenproblem
//! are never fatal: the solver falls back to a second eigensolver, and if that
//! also fails it returns the normalized start vector and its Rayleigh quotient
//! with a warning.

use nalgebra as na;
use ndarray as nd;
use ndarray_linalg::{ Eigh, UPLO };
use num_complex::Complex64 as C64;
use num_traits::Zero;
use rand::Rng;
use serde::{ Deserialize, Serialize };
use tracing::{ debug, warn };
use crate::tensor::{ inner, norm, normalize, random_vector };

/// A linear map on `C^n` that can be applied to vectors.
pub trait LinearOperator {
    /// Dimension `n` of the space acted on.
    fn dim(&self) -> usize;

    /// Apply the operator to `v`.
    fn matvec(&self, v: &nd::Array1<C64>) -> nd::Array1<C64>;
}

impl LinearOperator for nd::Array2<C64> {
    fn dim(&self) -> usize { self.nrows() }

    fn matvec(&self, v: &nd::Array1<C64>) -> nd::Array1<C64> { self.dot(v) }
}

/// Orthogonalization strategy for the Krylov basis.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LanczosMode {
    /// Three-term recurrence.
    #[default]
    ThreeTerm,
    /// Gram-Schmidt against every previous basis vector at each iteration.
    FullReorthogonalization,
}

/// Settings for [`lanczos`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanczosConfig {
    /// Maximum Krylov subspace dimension (capped by the problem dimension).
    pub krylov_dim: usize,
    /// Orthogonalization strategy.
    pub mode: LanczosMode,
    /// Residual norm below which the Krylov space is considered invariant.
    pub deflation_tol: f64,
    /// Relative change in the lowest Ritz value below which iteration stops;
    /// `None` disables the check.
    pub ritz_tol: Option<f64>,
    /// Number of iterations between Ritz value checks.
    pub ritz_check_interval: usize,
    /// Iteration budget of the tridiagonal eigensolver, per row.
    pub qr_iterations_per_dim: usize,
}

impl Default for LanczosConfig {
    fn default() -> Self {
        Self {
            krylov_dim: 300,
            mode: LanczosMode::default(),
            deflation_tol: 1e-8,
            ritz_tol: Some(1e-13),
            ritz_check_interval: 10,
            qr_iterations_per_dim: 30,
        }
    }
}

/// How the reported eigenpair was obtained.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LanczosStatus {
    /// The primary small eigensolver succeeded.
    Converged,
    /// The primary small eigensolver failed and the fallback succeeded.
    DenseFallback,
    /// Both small eigensolvers failed; the result is the start vector.
    Degraded,
}

/// Output of [`lanczos`].
#[derive(Clone, Debug)]
pub struct LanczosOutput {
    /// Lowest Ritz value.
    pub energy: f64,
    /// Normalized Ritz vector belonging to `energy`.
    pub vector: nd::Array1<C64>,
    /// Up to three lowest Ritz values, in ascending order.
    pub ritz: Vec<f64>,
    /// Number of Krylov basis vectors actually built.
    pub iterations: usize,
    /// How the eigenpair was obtained.
    pub status: LanczosStatus,
    /// `true` if the iteration stopped on an invariant subspace.
    pub deflated: bool,
}

// eigenvalues in ascending order, with the eigenvector of the lowest
struct SmallEigen {
    values: Vec<f64>,
    lowest: Vec<f64>,
}

fn tridiagonal(alpha: &[f64], beta: &[f64]) -> na::DMatrix<f64> {
    let m = alpha.len();
    na::DMatrix::from_fn(m, m, |i, j| {
        if i == j {
            alpha[i]
        } else if i == j + 1 {
            beta[j]
        } else if j == i + 1 {
            beta[i]
        } else {
            0.0
        }
    })
}

fn sorted(values: Vec<f64>, vectors: impl Fn(usize) -> Vec<f64>) -> SmallEigen {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|a, b| values[*a].total_cmp(&values[*b]));
    let lowest = vectors(order[0]);
    let values = order.into_iter().map(|k| values[k]).collect();
    SmallEigen { values, lowest }
}

// bounded-iteration QR solve; `None` if the iteration budget is exhausted
fn solve_qr(alpha: &[f64], beta: &[f64], iters_per_dim: usize) -> Option<SmallEigen> {
    let m = alpha.len();
    let max_iter = (iters_per_dim * m).max(1);
    let eig = na::SymmetricEigen::try_new(tridiagonal(alpha, beta), f64::EPSILON, max_iter)?;
    let values: Vec<f64> = eig.eigenvalues.iter().copied().collect();
    if values.iter().any(|x| !x.is_finite()) { return None; }
    let vecs = eig.eigenvectors;
    Some(sorted(values, |k| vecs.column(k).iter().copied().collect()))
}

// dense LAPACK solve
fn solve_dense(alpha: &[f64], beta: &[f64]) -> Option<SmallEigen> {
    let m = alpha.len();
    let t: nd::Array2<f64> = nd::Array2::from_shape_fn((m, m), |(i, j)| {
        if i == j {
            alpha[i]
        } else if i == j + 1 {
            beta[j]
        } else if j == i + 1 {
            beta[i]
        } else {
            0.0
        }
    });
    let (e, v) = t.eigh(UPLO::Lower).ok()?;
    let values: Vec<f64> = e.to_vec();
    if values.iter().any(|x| !x.is_finite()) { return None; }
    Some(sorted(values, |k| v.column(k).to_vec()))
}

// lowest eigenvalue of the tridiagonal matrix, for convergence checks only
fn lowest_ritz(alpha: &[f64], beta: &[f64], iters_per_dim: usize) -> Option<f64> {
    let m = alpha.len();
    let max_iter = (iters_per_dim * m).max(1);
    na::SymmetricEigen::try_new(tridiagonal(alpha, beta), f64::EPSILON, max_iter)
        .map(|eig| eig.eigenvalues.iter().copied().fold(f64::INFINITY, f64::min))
}

/// Find the lowest eigenpair of the Hermitian operator `op`.
///
/// The start vector is `seed` if it has the right length and is nonzero;
/// otherwise a random vector is drawn from `rng`.
pub fn lanczos<A, R>(
    op: &A,
    seed: Option<&nd::Array1<C64>>,
    config: &LanczosConfig,
    rng: &mut R,
) -> LanczosOutput
where
    A: LinearOperator + ?Sized,
    R: Rng + ?Sized,
{
    let n = op.dim();
    let k = config.krylov_dim.min(n).max(1);
    let mut v0: nd::Array1<C64>
        = match seed {
            Some(v) if v.len() == n && norm(v) > 0.0 => v.clone(),
            _ => random_vector(n, rng),
        };
    normalize(&mut v0);

    let mut basis: Vec<nd::Array1<C64>> = Vec::with_capacity(k);
    let mut alpha: Vec<f64> = Vec::with_capacity(k);
    let mut beta: Vec<f64> = Vec::with_capacity(k);

    let mut w = op.matvec(&v0);
    let a = inner(&v0, &w).re;
    w.scaled_add(-C64::from(a), &v0);
    alpha.push(a);
    basis.push(v0);

    let mut deflated = false;
    let mut prev_ritz: Option<f64> = None;
    for i in 1..k {
        if config.mode == LanczosMode::FullReorthogonalization {
            for q in basis.iter() {
                let overlap = inner(q, &w);
                w.scaled_add(-overlap, q);
            }
        }
        let b = norm(&w);
        if b < config.deflation_tol {
            deflated = true;
            break;
        }
        w.mapv_inplace(|x| x / b);
        basis.push(w);
        beta.push(b);

        let mut next = op.matvec(&basis[i]);
        next.scaled_add(-C64::from(b), &basis[i - 1]);
        let a = inner(&basis[i], &next).re;
        next.scaled_add(-C64::from(a), &basis[i]);
        alpha.push(a);
        w = next;

        if let Some(tol) = config.ritz_tol {
            if (i + 1) % config.ritz_check_interval.max(1) == 0 {
                if let Some(e) = lowest_ritz(&alpha, &beta, config.qr_iterations_per_dim) {
                    if prev_ritz.is_some_and(|p| (e - p).abs() < tol * e.abs().max(1.0)) {
                        break;
                    }
                    prev_ritz = Some(e);
                }
            }
        }
    }

    let m = alpha.len();
    let (solved, status)
        = match config.mode {
            LanczosMode::ThreeTerm => {
                match solve_qr(&alpha, &beta, config.qr_iterations_per_dim) {
                    Some(eig) => (Some(eig), LanczosStatus::Converged),
                    None => {
                        debug!(m, "tridiagonal eigensolver did not converge; falling back to dense");
                        (solve_dense(&alpha, &beta), LanczosStatus::DenseFallback)
                    },
                }
            },
            LanczosMode::FullReorthogonalization => {
                match solve_dense(&alpha, &beta) {
                    Some(eig) => (Some(eig), LanczosStatus::Converged),
                    None => {
                        debug!(m, "dense eigensolver failed; falling back to bounded QR");
                        (
                            solve_qr(&alpha, &beta, config.qr_iterations_per_dim),
                            LanczosStatus::DenseFallback,
                        )
                    },
                }
            },
        };

    match solved {
        Some(SmallEigen { values, lowest }) => {
            let mut vector: nd::Array1<C64> = nd::Array1::zeros(n);
            basis.iter().zip(&lowest)
                .for_each(|(q, c)| { vector.scaled_add(C64::from(*c), q); });
            normalize(&mut vector);
            LanczosOutput {
                energy: values[0],
                vector,
                ritz: values.into_iter().take(3).collect(),
                iterations: m,
                status,
                deflated,
            }
        },
        None => {
            warn!(m, "Lanczos eigensolvers failed; returning the start vector");
            let v0 = basis.swap_remove(0);
            LanczosOutput {
                energy: alpha[0],
                vector: v0,
                ritz: vec![alpha[0]],
                iterations: m,
                status: LanczosStatus::Degraded,
                deflated,
            }
        },
    }
}

/// Rayleigh quotient ⟨*v*|*A*|*v*⟩ / ⟨*v*|*v*⟩.
///
/// Returns zero for a zero vector.
pub fn rayleigh<A>(op: &A, v: &nd::Array1<C64>) -> f64
where A: LinearOperator + ?Sized
{
    let nn = inner(v, v).re;
    if nn == 0.0 { return f64::zero(); }
    inner(v, &op.matvec(v)).re / nn
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{ rngs::StdRng, SeedableRng };

    fn random_hermitian(n: usize, rng: &mut StdRng) -> nd::Array2<C64> {
        let a: nd::Array2<C64>
            = nd::Array2::from_shape_fn((n, n), |_| {
                C64::new(rng.gen::<f64>() - 0.5, rng.gen::<f64>() - 0.5)
            });
        let ah = a.t().mapv(|x| x.conj());
        (&a + &ah).mapv(|x| x * 0.5)
    }

    fn exact_ground(h: &nd::Array2<C64>) -> (f64, nd::Array1<C64>) {
        let (e, v) = h.eigh(UPLO::Lower).unwrap();
        let k = (0..e.len()).min_by(|a, b| e[*a].total_cmp(&e[*b])).unwrap();
        (e[k], v.column(k).to_owned())
    }

    #[test]
    fn matches_dense_ground_state() {
        let mut rng = StdRng::seed_from_u64(10546);
        let h = random_hermitian(40, &mut rng);
        let (e0, v0) = exact_ground(&h);
        for mode in [LanczosMode::ThreeTerm, LanczosMode::FullReorthogonalization] {
            let config = LanczosConfig { mode, ritz_tol: None, ..LanczosConfig::default() };
            let out = lanczos(&h, None, &config, &mut rng);
            assert_eq!(out.status, LanczosStatus::Converged);
            assert!(out.iterations <= 40);
            assert_abs_diff_eq!(out.energy, e0, epsilon = 1e-9);
            if mode == LanczosMode::FullReorthogonalization {
                assert_abs_diff_eq!(inner(&v0, &out.vector).norm(), 1.0, epsilon = 1e-6);
                assert_abs_diff_eq!(rayleigh(&h, &out.vector), e0, epsilon = 1e-9);
            }
            assert!(out.ritz.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn three_term_vector_matches_dense() {
        let mut rng = StdRng::seed_from_u64(10546);
        let a = random_hermitian(40, &mut rng);
        let (e, v) = a.eigh(UPLO::Lower).unwrap();
        // same eigenvectors, ground state pushed well below the rest
        let lam: nd::Array1<C64>
            = e.iter().enumerate()
            .map(|(k, x)| {
                if k == 0 { C64::from(-1.0) } else { C64::from((x - e[0]) / (e[39] - e[0])) }
            })
            .collect();
        let h: nd::Array2<C64>
            = v.dot(&nd::Array2::from_diag(&lam)).dot(&v.t().mapv(|x| x.conj()));
        let v0 = v.column(0).to_owned();

        let config = LanczosConfig::default();
        assert_eq!(config.mode, LanczosMode::ThreeTerm);
        let out = lanczos(&h, None, &config, &mut rng);
        assert_eq!(out.status, LanczosStatus::Converged);
        assert_abs_diff_eq!(out.energy, -1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(norm(&out.vector), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(inner(&v0, &out.vector).norm(), 1.0, epsilon = 1e-8);
        let mut resid = h.matvec(&out.vector);
        resid.scaled_add(-C64::from(out.energy), &out.vector);
        assert!(norm(&resid) < 1e-6, "residual {}", norm(&resid));
    }

    #[test]
    fn early_stop_on_ritz_convergence() {
        let mut rng = StdRng::seed_from_u64(3);
        let h = random_hermitian(200, &mut rng);
        let (e0, _) = exact_ground(&h);
        let config = LanczosConfig {
            mode: LanczosMode::FullReorthogonalization,
            ritz_tol: Some(1e-12),
            ..LanczosConfig::default()
        };
        let out = lanczos(&h, None, &config, &mut rng);
        assert!(out.iterations < 200);
        assert_abs_diff_eq!(out.energy, e0, epsilon = 1e-8);
    }

    #[test]
    fn deflation_on_invariant_start() {
        let mut rng = StdRng::seed_from_u64(5);
        let h = random_hermitian(16, &mut rng);
        let (e0, v0) = exact_ground(&h);
        let out = lanczos(&h, Some(&v0), &LanczosConfig::default(), &mut rng);
        assert!(out.deflated);
        assert_eq!(out.iterations, 1);
        assert_abs_diff_eq!(out.energy, e0, epsilon = 1e-10);

        // scalar multiple of the identity: every vector is an eigenvector
        let id: nd::Array2<C64> = nd::Array2::from_diag(&nd::Array1::from_elem(8, C64::from(2.5)));
        let out = lanczos(&id, None, &LanczosConfig::default(), &mut rng);
        assert!(out.deflated);
        assert_abs_diff_eq!(out.energy, 2.5, epsilon = 1e-12);
    }

    #[test]
    fn bad_seed_falls_back_to_random() {
        let mut rng = StdRng::seed_from_u64(6);
        let h = random_hermitian(12, &mut rng);
        let (e0, _) = exact_ground(&h);
        let zero: nd::Array1<C64> = nd::Array1::zeros(12);
        let short: nd::Array1<C64> = nd::Array1::ones(3);
        for seed in [&zero, &short] {
            let out = lanczos(&h, Some(seed), &LanczosConfig::default(), &mut rng);
            assert_abs_diff_eq!(out.energy, e0, epsilon = 1e-9);
        }
    }

    #[test]
    fn starved_qr_still_solves() {
        let mut rng = StdRng::seed_from_u64(8);
        let h = random_hermitian(30, &mut rng);
        let (e0, _) = exact_ground(&h);
        let config = LanczosConfig {
            qr_iterations_per_dim: 0,
            ritz_tol: None,
            ..LanczosConfig::default()
        };
        let out = lanczos(&h, None, &config, &mut rng);
        assert_ne!(out.status, LanczosStatus::Degraded);
        assert_abs_diff_eq!(out.energy, e0, epsilon = 1e-8);
    }
}
