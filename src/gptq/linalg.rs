//! Dense Cholesky routines for the Hessian inverse
//!
//! GPTQ needs the upper Cholesky factor of `H⁻¹`. It is computed as:
//! 1. `L = chol(H)` (lower)
//! 2. `H⁻¹ = L⁻ᵀ L⁻¹` via forward substitution
//! 3. `U = chol(H⁻¹)ᵀ` (upper)
//!
//! Entries that are exactly zero in `H` and whose elimination terms are all
//! zero stay exactly zero in every factor, which keeps dead channels exact.

use crate::{Error, Result};
use ndarray::{s, Array2, ArrayView2};

fn check_square(a: &ArrayView2<f64>) -> Result<usize> {
    let (rows, cols) = a.dim();
    if rows != cols {
        return Err(Error::ShapeMismatch {
            expected: vec![rows, rows],
            got: vec![rows, cols],
        });
    }
    Ok(rows)
}

/// Lower Cholesky factor `L` with `A = L Lᵀ`. Only the lower triangle of `a`
/// is read.
///
/// Fails with [`Error::NotPositiveDefinite`] on the first non-positive or
/// non-finite pivot.
pub fn cholesky_lower(a: ArrayView2<f64>) -> Result<Array2<f64>> {
    let n = check_square(&a)?;
    let mut l = Array2::<f64>::zeros((n, n));

    for j in 0..n {
        let lj = l.slice(s![j, ..j]).to_owned();
        let pivot = a[[j, j]] - lj.dot(&lj);
        if !(pivot > 0.0 && pivot.is_finite()) {
            return Err(Error::NotPositiveDefinite { index: j, pivot });
        }
        let d = pivot.sqrt();
        l[[j, j]] = d;

        for i in (j + 1)..n {
            let dot = l.slice(s![i, ..j]).dot(&lj);
            l[[i, j]] = (a[[i, j]] - dot) / d;
        }
    }
    Ok(l)
}

/// Inverse of a lower-triangular matrix by forward substitution
pub fn invert_lower(l: ArrayView2<f64>) -> Result<Array2<f64>> {
    let n = check_square(&l)?;
    let mut inv = Array2::<f64>::zeros((n, n));

    for j in 0..n {
        let d = l[[j, j]];
        if d == 0.0 || !d.is_finite() {
            return Err(Error::NotPositiveDefinite { index: j, pivot: d });
        }
        inv[[j, j]] = 1.0 / d;
        for i in (j + 1)..n {
            let mut acc = 0.0;
            for k in j..i {
                acc += l[[i, k]] * inv[[k, j]];
            }
            inv[[i, j]] = -acc / l[[i, i]];
        }
    }
    Ok(inv)
}

/// `A⁻¹` from the lower Cholesky factor of `A`
pub fn cholesky_inverse(l: ArrayView2<f64>) -> Result<Array2<f64>> {
    let linv = invert_lower(l)?;
    Ok(linv.t().dot(&linv))
}

/// Upper Cholesky factor `U` with `A = Uᵀ U`
pub fn cholesky_upper(a: ArrayView2<f64>) -> Result<Array2<f64>> {
    Ok(cholesky_lower(a)?.reversed_axes())
}

/// Upper Cholesky factor of `H⁻¹`, the form consumed by the column loop
pub fn inverse_cholesky_upper(h: ArrayView2<f64>) -> Result<Array2<f64>> {
    let l = cholesky_lower(h)?;
    let hinv = cholesky_inverse(l.view())?;
    cholesky_upper(hinv.view())
}
