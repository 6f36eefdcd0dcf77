//! Legendre polynomial basis for additive continuum terms.
//!
//! The fitting window is mapped onto `x ∈ [-1, 1]` and the polynomials are
//! generated with the Bonnet recursion:
//!
//! - `P0 = 1`, `P1 = x`
//! - `(n + 1) P_{n+1} = (2n + 1) x P_n - n P_{n-1}`

/// Evaluate `P_0 .. P_degree` on `npix` points spanning `[-1, 1]`.
///
/// Returns one row per polynomial. A negative `degree` yields no rows.
pub fn legendre_basis(npix: usize, degree: i32) -> Vec<Vec<f64>> {
    if degree < 0 || npix == 0 {
        return Vec::new();
    }
    let x: Vec<f64> = if npix == 1 {
        vec![0.0]
    } else {
        (0..npix)
            .map(|i| 2.0 * i as f64 / (npix - 1) as f64 - 1.0)
            .collect()
    };

    let degree = degree as usize;
    let mut rows: Vec<Vec<f64>> = Vec::with_capacity(degree + 1);
    rows.push(vec![1.0; npix]);
    if degree >= 1 {
        rows.push(x.clone());
    }
    for n in 1..degree {
        let nf = n as f64;
        let next: Vec<f64> = (0..npix)
            .map(|i| ((2.0 * nf + 1.0) * x[i] * rows[n][i] - nf * rows[n - 1][i]) / (nf + 1.0))
            .collect();
        rows.push(next);
    }
    rows
}
