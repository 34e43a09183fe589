//! Real spherical harmonics, ACN ordering, N3D normalisation, without the
//! Condon-Shortley phase.
//!
//! Angles are in radians. Azimuth is measured anticlockwise from the front
//! (`+x`) towards the left (`+y`), elevation upwards from the horizontal
//! plane.

use crate::convention::order_to_channels;

/// Associated Legendre functions `P_n^m(x)` for `n <= order`, `0 <= m <= n`,
/// stored at `n * (order + 1) + m`.
fn associated_legendre(order: usize, x: f64, out: &mut [f64]) {
    let stride = order + 1;
    let s = (1.0 - x * x).max(0.0).sqrt();

    let mut pmm = 1.0;
    for m in 0..=order {
        if m > 0 {
            pmm *= (2 * m - 1) as f64 * s;
        }
        out[m * stride + m] = pmm;

        if m < order {
            out[(m + 1) * stride + m] = x * (2 * m + 1) as f64 * pmm;
        }

        for n in m + 2..=order {
            let p1 = out[(n - 1) * stride + m];
            let p2 = out[(n - 2) * stride + m];
            out[n * stride + m] = ((2 * n - 1) as f64 * x * p1 - (n + m - 1) as f64 * p2) / (n - m) as f64;
        }
    }
}

fn factorial(n: usize) -> f64 {
    (1..=n).map(|v| v as f64).product()
}

/// Evaluate all `(order + 1)^2` real SH for one direction into `out`.
///
/// # Panics
///
/// This function panics if `out.len() < (order + 1)^2`.
pub fn real_sh(order: usize, azimuth: f32, elevation: f32, out: &mut [f32]) {
    assert!(out.len() >= order_to_channels(order));

    let stride = order + 1;
    let mut p = vec![0.0f64; stride * stride];
    associated_legendre(order, (elevation as f64).sin(), &mut p);

    let azimuth = azimuth as f64;
    for n in 0..=order {
        for m in 0..=n {
            let norm = ((2 * n + 1) as f64 * if m == 0 { 1.0 } else { 2.0 } * factorial(n - m)
                / factorial(n + m))
            .sqrt();
            let base = norm * p[n * stride + m];
            let acn = n * n + n;

            if m == 0 {
                out[acn] = base as f32;
            } else {
                out[acn + m] = (base * (m as f64 * azimuth).cos()) as f32;
                out[acn - m] = (base * (m as f64 * azimuth).sin()) as f32;
            }
        }
    }
}

/// Legendre polynomial `P_n(x)`.
pub fn legendre(n: usize, x: f32) -> f32 {
    let x = x as f64;
    let (mut p0, mut p1) = (1.0, x);
    match n {
        0 => 1.0,
        1 => x as f32,
        _ => {
            for k in 2..=n {
                let p2 = ((2 * k - 1) as f64 * x * p1 - (k - 1) as f64 * p0) / k as f64;
                p0 = p1;
                p1 = p2;
            }
            p1 as f32
        }
    }
}
