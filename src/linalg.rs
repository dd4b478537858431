// SPDX-License-Identifier: MIT OR Apache-2.0

//! Dense linear-algebra kernels for the intervention stack.
//!
//! Candle does not ship matrix decompositions, so the two factorizations
//! this crate needs are implemented here as explicit CPU kernels over
//! extracted `Vec` data (the same extract-compute-rebuild pattern used
//! throughout the crate for numeric manipulation):
//!
//! - [`orthonormalize`] — Householder QR projection of a tall matrix to
//!   an orthonormal column basis.  Applied on every access to a rotation
//!   layer's weight, so orthonormality survives arbitrary optimizer steps.
//! - [`batched_cholesky_solve`] — solves a batch of symmetric
//!   positive-definite systems via Cholesky factorization followed by
//!   forward and back substitution.  Never forms an explicit inverse.
//!
//! All kernels compute in `f32` and return tensors in the input's dtype.

use candle_core::{DType, Device, Tensor};

use crate::error::{ReftError, Result};

// ---------------------------------------------------------------------------
// Householder QR orthonormalization
// ---------------------------------------------------------------------------

/// Project a tall matrix onto an orthonormal column basis.
///
/// Computes the thin Q factor of a Householder QR decomposition with the
/// sign convention `diag(R) >= 0`, which makes the projection
/// deterministic and idempotent: an already-orthonormal input is returned
/// unchanged (within rounding).
///
/// # Shapes
/// - `weight`: `[n, m]` with `n >= m`
/// - returns: `[n, m]` with orthonormal columns
///
/// # Errors
///
/// Returns [`ReftError::Shape`] if the matrix is not tall, and
/// [`ReftError::Numerical`] if a column is numerically rank-deficient.
pub fn orthonormalize(weight: &Tensor) -> Result<Tensor> {
    let (n, m) = weight.dims2()?;
    if n < m {
        return Err(ReftError::Shape(format!(
            "orthonormalize expects a tall matrix, got {n}x{m}"
        )));
    }

    // PROMOTE: QR runs in f32 regardless of storage dtype
    let mut a: Vec<Vec<f32>> = weight.to_dtype(DType::F32)?.to_vec2()?;

    // Householder vectors, one per column.
    let mut reflectors: Vec<Vec<f32>> = Vec::with_capacity(m);
    let mut r_diag_signs: Vec<f32> = Vec::with_capacity(m);

    for j in 0..m {
        // Column j below (and including) the diagonal.
        let mut v: Vec<f32> = (j..n).map(|i| col(&a, i, j)).collect();
        let norm = l2(&v);
        if norm < 1e-12 {
            return Err(ReftError::Numerical(format!(
                "rank-deficient column {j} in orthonormalization"
            )));
        }

        let head = first(&v);
        let alpha = if head >= 0.0 { -norm } else { norm };
        if let Some(h) = v.first_mut() {
            *h -= alpha;
        }
        let v_norm = l2(&v);
        if v_norm > 1e-12 {
            for x in &mut v {
                *x /= v_norm;
            }
        }

        // Apply the reflector H = I - 2 v v^T to the trailing columns.
        for k in j..m {
            let dot: f32 = v
                .iter()
                .enumerate()
                .map(|(i, &vi)| vi * col(&a, j + i, k))
                .sum();
            for (i, &vi) in v.iter().enumerate() {
                let updated = col(&a, j + i, k) - 2.0 * dot * vi;
                set_col(&mut a, j + i, k, updated);
            }
        }

        r_diag_signs.push(if col(&a, j, j) >= 0.0 { 1.0 } else { -1.0 });
        reflectors.push(v);
    }

    // Q = H_0 H_1 ... H_{m-1} applied to the first m columns of I.
    let mut q = vec![vec![0.0f32; m]; n];
    for (j, row) in q.iter_mut().enumerate().take(m) {
        if let Some(x) = row.get_mut(j) {
            *x = 1.0;
        }
    }
    for j in (0..m).rev() {
        let v = reflectors.get(j).map_or(&[] as &[f32], Vec::as_slice);
        for k in 0..m {
            let dot: f32 = v
                .iter()
                .enumerate()
                .map(|(i, &vi)| vi * col(&q, j + i, k))
                .sum();
            for (i, &vi) in v.iter().enumerate() {
                let updated = col(&q, j + i, k) - 2.0 * dot * vi;
                set_col(&mut q, j + i, k, updated);
            }
        }
    }

    // Sign convention: flip columns whose R diagonal came out negative.
    for (j, sign) in r_diag_signs.iter().enumerate() {
        if *sign < 0.0 {
            for row in &mut q {
                if let Some(x) = row.get_mut(j) {
                    *x = -*x;
                }
            }
        }
    }

    let flat: Vec<f32> = q.into_iter().flatten().collect();
    let out = Tensor::from_vec(flat, (n, m), weight.device())?;
    Ok(out.to_dtype(weight.dtype())?)
}

// ---------------------------------------------------------------------------
// Batched Cholesky ridge solve
// ---------------------------------------------------------------------------

/// Solve a batch of SPD linear systems `A x = B` via Cholesky.
///
/// Factors each `A` as `L L^T`, then performs a forward substitution
/// (`L y = B`) and a back substitution (`L^T x = y`) per right-hand-side
/// column.  Batch elements are independent; the loop over the batch axis
/// carries no ordering requirement.
///
/// # Shapes
/// - `gram`: `[batch, k, k]` — symmetric positive-definite per element
/// - `rhs`: `[batch, k, n]`
/// - returns: `[batch, k, n]` in the rhs dtype
///
/// # Errors
///
/// Returns [`ReftError::Numerical`] if a factorization pivot is
/// non-positive or non-finite (ill-conditioned regularized Gram matrix).
/// The failure propagates uncaught; there is no regularization bump or
/// retry.
pub fn batched_cholesky_solve(gram: &Tensor, rhs: &Tensor) -> Result<Tensor> {
    let (batch, k, k2) = gram.dims3()?;
    let (rbatch, rk, n) = rhs.dims3()?;
    if k != k2 || batch != rbatch || k != rk {
        return Err(ReftError::Shape(format!(
            "cholesky solve shape mismatch: gram {batch}x{k}x{k2}, rhs {rbatch}x{rk}x{n}"
        )));
    }

    // PROMOTE: factorization in f32 for stability across input dtypes
    let gram_v: Vec<Vec<Vec<f32>>> = gram.to_dtype(DType::F32)?.to_vec3()?;
    let rhs_v: Vec<Vec<Vec<f32>>> = rhs.to_dtype(DType::F32)?.to_vec3()?;

    let mut out: Vec<f32> = Vec::with_capacity(batch * k * n);
    for (b, (a_mat, b_mat)) in gram_v.iter().zip(rhs_v.iter()).enumerate() {
        let l = cholesky_factor(a_mat, b, k)?;

        // Solve per right-hand-side column.
        let mut x = vec![vec![0.0f32; n]; k];
        for c in 0..n {
            // Forward substitution: L y = b.
            let mut y = vec![0.0f32; k];
            for i in 0..k {
                let mut sum = col(b_mat, i, c);
                for (j, yj) in y.iter().enumerate().take(i) {
                    sum -= col(&l, i, j) * yj;
                }
                if let Some(yi) = y.get_mut(i) {
                    *yi = sum / col(&l, i, i);
                }
            }
            // Back substitution: L^T x = y.
            for i in (0..k).rev() {
                let mut sum = *y.get(i).unwrap_or(&0.0);
                for j in (i + 1)..k {
                    sum -= col(&l, j, i) * col(&x, j, c);
                }
                let solved = sum / col(&l, i, i);
                set_col(&mut x, i, c, solved);
            }
        }
        out.extend(x.into_iter().flatten());
    }

    let solved = Tensor::from_vec(out, (batch, k, n), rhs.device())?;
    Ok(solved.to_dtype(rhs.dtype())?)
}

/// Cholesky-factor a single SPD matrix, returning the lower triangle.
fn cholesky_factor(a: &[Vec<f32>], batch_idx: usize, k: usize) -> Result<Vec<Vec<f32>>> {
    let mut l = vec![vec![0.0f32; k]; k];
    for i in 0..k {
        for j in 0..=i {
            let mut sum = col(a, i, j);
            for p in 0..j {
                sum -= col(&l, i, p) * col(&l, j, p);
            }
            if i == j {
                if !sum.is_finite() || sum <= 0.0 {
                    return Err(ReftError::Numerical(format!(
                        "cholesky factorization failed at batch {batch_idx}, pivot {i} (value {sum})"
                    )));
                }
                set_col(&mut l, i, j, sum.sqrt());
            } else {
                let scaled = sum / col(&l, j, j);
                set_col(&mut l, i, j, scaled);
            }
        }
    }
    Ok(l)
}

// ---------------------------------------------------------------------------
// Small constructors and diagnostics
// ---------------------------------------------------------------------------

/// Identity matrix of size `k` on the given device.
///
/// # Errors
///
/// Returns [`ReftError::Model`] on tensor creation failure.
pub fn identity(k: usize, dtype: DType, device: &Device) -> Result<Tensor> {
    let mut data = vec![0.0f32; k * k];
    for i in 0..k {
        if let Some(x) = data.get_mut(i * k + i) {
            *x = 1.0;
        }
    }
    let eye = Tensor::from_vec(data, (k, k), device)?;
    Ok(eye.to_dtype(dtype)?)
}

/// Numerical rank of each matrix in a batch via row-echelon reduction.
///
/// A pivot counts toward the rank when its magnitude exceeds
/// `tol * max_abs` of the matrix.  Diagnostic only; never feeds
/// gradients.
///
/// # Shapes
/// - `batch`: `[batch, rows, cols]`
///
/// # Errors
///
/// Returns [`ReftError::Model`] on tensor extraction failure.
pub fn batched_matrix_rank(batch: &Tensor, tol: f32) -> Result<Vec<usize>> {
    let mats: Vec<Vec<Vec<f32>>> = batch.to_dtype(DType::F32)?.to_vec3()?;
    let mut ranks = Vec::with_capacity(mats.len());
    for mat in &mats {
        ranks.push(single_rank(mat, tol));
    }
    Ok(ranks)
}

/// Rank of one matrix by Gaussian elimination with partial pivoting.
fn single_rank(mat: &[Vec<f32>], tol: f32) -> usize {
    let rows = mat.len();
    let cols = mat.first().map_or(0, Vec::len);
    let mut a: Vec<Vec<f32>> = mat.to_vec();
    let max_abs = a
        .iter()
        .flatten()
        .map(|x| x.abs())
        .fold(0.0f32, f32::max)
        .max(1e-30);
    let threshold = tol * max_abs;

    let mut rank = 0usize;
    let mut pivot_row = 0usize;
    for c in 0..cols {
        // Find the largest remaining pivot in this column.
        let Some(best) = (pivot_row..rows).max_by(|&i, &j| {
            col(&a, i, c)
                .abs()
                .partial_cmp(&col(&a, j, c).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        }) else {
            break;
        };
        if col(&a, best, c).abs() <= threshold {
            continue;
        }
        a.swap(pivot_row, best);
        let pivot = col(&a, pivot_row, c);
        for r in (pivot_row + 1)..rows {
            let factor = col(&a, r, c) / pivot;
            for cc in c..cols {
                let updated = col(&a, r, cc) - factor * col(&a, pivot_row, cc);
                set_col(&mut a, r, cc, updated);
            }
        }
        rank += 1;
        pivot_row += 1;
        if pivot_row == rows {
            break;
        }
    }
    rank
}

// ---------------------------------------------------------------------------
// Vec helpers
// ---------------------------------------------------------------------------

/// Bounds-checked 2D read; out-of-range reads as 0 (never hit on the
/// index sets used above, which are derived from the matrix dims).
fn col(m: &[Vec<f32>], i: usize, j: usize) -> f32 {
    m.get(i).and_then(|row| row.get(j)).copied().unwrap_or(0.0)
}

/// Bounds-checked 2D write.
fn set_col(m: &mut [Vec<f32>], i: usize, j: usize, value: f32) {
    if let Some(x) = m.get_mut(i).and_then(|row| row.get_mut(j)) {
        *x = value;
    }
}

/// First element of a slice, 0 if empty.
fn first(v: &[f32]) -> f32 {
    v.first().copied().unwrap_or(0.0)
}

/// Euclidean norm of a slice.
fn l2(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::as_conversions,
    clippy::cast_precision_loss
)]
mod tests {
    use super::*;

    fn gram_of(q: &Tensor) -> Vec<Vec<f32>> {
        let g = q.t().unwrap().matmul(q).unwrap();
        g.to_vec2().unwrap()
    }

    #[test]
    fn orthonormalize_produces_identity_gram() {
        let device = Device::Cpu;
        let data: Vec<f32> = (0..24).map(|i| (i as f32).sin() * 3.0 + 0.7).collect();
        let w = Tensor::from_vec(data, (8, 3), &device).unwrap();
        let q = orthonormalize(&w).unwrap();

        let gram = gram_of(&q);
        for i in 0..3 {
            for j in 0..3 {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!(
                    (gram[i][j] - expected).abs() < 1e-5,
                    "gram[{i}][{j}] = {}",
                    gram[i][j]
                );
            }
        }
    }

    #[test]
    fn orthonormalize_is_idempotent() {
        let device = Device::Cpu;
        let data: Vec<f32> = (0..40).map(|i| ((i * 7 % 13) as f32) - 6.0).collect();
        let w = Tensor::from_vec(data, (10, 4), &device).unwrap();
        let q1 = orthonormalize(&w).unwrap();
        let q2 = orthonormalize(&q1).unwrap();

        let a: Vec<f32> = q1.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = q2.flatten_all().unwrap().to_vec1().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn orthonormalize_rejects_wide_matrix() {
        let device = Device::Cpu;
        let w = Tensor::zeros((2, 5), DType::F32, &device).unwrap();
        assert!(matches!(orthonormalize(&w), Err(ReftError::Shape(_))));
    }

    /// Direct Gauss-Jordan inverse, reference implementation for the test.
    fn invert(a: &[Vec<f32>]) -> Vec<Vec<f32>> {
        let k = a.len();
        let mut aug: Vec<Vec<f32>> = a
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let mut r = row.clone();
                r.extend((0..k).map(|j| if i == j { 1.0 } else { 0.0 }));
                r
            })
            .collect();
        for i in 0..k {
            let pivot = aug[i][i];
            for x in &mut aug[i] {
                *x /= pivot;
            }
            for r in 0..k {
                if r != i {
                    let factor = aug[r][i];
                    for c in 0..2 * k {
                        aug[r][c] -= factor * aug[i][c];
                    }
                }
            }
        }
        aug.into_iter().map(|row| row[k..].to_vec()).collect()
    }

    #[test]
    fn cholesky_matches_direct_inverse() {
        // batch=4, k=8, embed_dim=16, lambda=1.0 — well-conditioned by
        // construction (X X^T + I is SPD).
        let device = Device::Cpu;
        let (batch, k, d) = (4usize, 8usize, 16usize);
        let x_data: Vec<f32> = (0..batch * k * d)
            .map(|i| ((i * 31 % 17) as f32 / 17.0) - 0.5)
            .collect();
        let x = Tensor::from_vec(x_data, (batch, k, d), &device).unwrap();
        let gram = x.matmul(&x.t().unwrap()).unwrap();
        let eye = identity(k, DType::F32, &device).unwrap();
        let reg = gram.broadcast_add(&eye).unwrap();

        let rhs_data: Vec<f32> = (0..batch * k * 3)
            .map(|i| ((i * 13 % 11) as f32 / 11.0) - 0.4)
            .collect();
        let rhs = Tensor::from_vec(rhs_data, (batch, k, 3), &device).unwrap();

        let solved = batched_cholesky_solve(&reg, &rhs).unwrap();
        let solved_v: Vec<Vec<Vec<f32>>> = solved.to_vec3().unwrap();

        let reg_v: Vec<Vec<Vec<f32>>> = reg.to_vec3().unwrap();
        let rhs_v: Vec<Vec<Vec<f32>>> = rhs.to_vec3().unwrap();
        for b in 0..batch {
            let inv = invert(&reg_v[b]);
            for i in 0..k {
                for c in 0..3 {
                    let direct: f32 = (0..k).map(|j| inv[i][j] * rhs_v[b][j][c]).sum();
                    assert!(
                        (direct - solved_v[b][i][c]).abs() < 1e-3,
                        "batch {b} ({i},{c}): direct {direct} vs cholesky {}",
                        solved_v[b][i][c]
                    );
                }
            }
        }
    }

    #[test]
    fn cholesky_rejects_indefinite_system() {
        let device = Device::Cpu;
        // -I is symmetric but not positive-definite.
        let neg = (identity(4, DType::F32, &device).unwrap() * -1.0).unwrap();
        let neg = neg.unsqueeze(0).unwrap();
        let rhs = Tensor::ones((1, 4, 2), DType::F32, &device).unwrap();
        assert!(matches!(
            batched_cholesky_solve(&neg, &rhs),
            Err(ReftError::Numerical(_))
        ));
    }

    #[test]
    fn rank_of_constructed_matrices() {
        let device = Device::Cpu;
        // First matrix: rank 2 (third row is the sum of the first two).
        // Second matrix: identity-like, rank 3.
        let data: Vec<f32> = vec![
            1.0, 0.0, 0.0, 2.0, //
            0.0, 1.0, 0.0, 3.0, //
            1.0, 1.0, 0.0, 5.0, //
            1.0, 0.0, 0.0, 0.0, //
            0.0, 1.0, 0.0, 0.0, //
            0.0, 0.0, 1.0, 0.0, //
        ];
        let batch = Tensor::from_vec(data, (2, 3, 4), &device).unwrap();
        let ranks = batched_matrix_rank(&batch, 1e-5).unwrap();
        assert_eq!(ranks, vec![2, 3]);
    }
}
