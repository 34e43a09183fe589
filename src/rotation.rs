//! Rotation matrices and the delayed matrix crossfade.
//!
//! Rotations are active, right handed, in the `x` front, `y` left, `z` up
//! coordinate system: a positive yaw moves a source at azimuth `a` to
//! `a + yaw`.
//!
//! Spherical harmonic rotation matrices are built order by order from the
//! first order rotation with the Ivanic-Ruedenberg recursion, see
//! "Rotation Matrices for Real Spherical Harmonics. Direct Determination by
//! Recursion", J. Phys. Chem. 1996 (and the 1998 erratum).

use crate::buffer::Frame;
use crate::convention::order_to_channels;

pub type Mat3 = [[f32; 3]; 3];

pub const IDENTITY: Mat3 = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

/// Composition order of the Euler angles.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum EulerOrder {
    /// `Rz(yaw) * Ry(pitch) * Rx(roll)`
    #[default]
    YawPitchRoll,
    /// `Rx(roll) * Ry(pitch) * Rz(yaw)`
    RollPitchYaw,
}

pub fn mat3_mul(a: &Mat3, b: &Mat3) -> Mat3 {
    let mut c = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            c[i][j] = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    c
}

pub fn transpose(a: &Mat3) -> Mat3 {
    let mut t = [[0.0; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            t[i][j] = a[j][i];
        }
    }
    t
}

pub fn rotate(r: &Mat3, v: [f32; 3]) -> [f32; 3] {
    [
        r[0][0] * v[0] + r[0][1] * v[1] + r[0][2] * v[2],
        r[1][0] * v[0] + r[1][1] * v[1] + r[1][2] * v[2],
        r[2][0] * v[0] + r[2][1] * v[1] + r[2][2] * v[2],
    ]
}

/// Rotation matrix from Euler angles in radians.
pub fn euler_to_rotation(yaw: f32, pitch: f32, roll: f32, order: EulerOrder) -> Mat3 {
    let (sy, cy) = yaw.sin_cos();
    let (sp, cp) = pitch.sin_cos();
    let (sr, cr) = roll.sin_cos();

    let rz = [[cy, -sy, 0.0], [sy, cy, 0.0], [0.0, 0.0, 1.0]];
    let ry = [[cp, 0.0, sp], [0.0, 1.0, 0.0], [-sp, 0.0, cp]];
    let rx = [[1.0, 0.0, 0.0], [0.0, cr, -sr], [0.0, sr, cr]];

    match order {
        EulerOrder::YawPitchRoll => mat3_mul(&rz, &mat3_mul(&ry, &rx)),
        EulerOrder::RollPitchYaw => mat3_mul(&rx, &mat3_mul(&ry, &rz)),
    }
}

/// Euler angles `(yaw, pitch, roll)` in radians of a rotation matrix.
pub fn rotation_to_euler(r: &Mat3, order: EulerOrder) -> (f32, f32, f32) {
    match order {
        EulerOrder::YawPitchRoll => {
            let pitch = (-r[2][0]).clamp(-1.0, 1.0).asin();
            let roll = r[2][1].atan2(r[2][2]);
            let yaw = r[1][0].atan2(r[0][0]);
            (yaw, pitch, roll)
        }
        EulerOrder::RollPitchYaw => {
            let pitch = r[0][2].clamp(-1.0, 1.0).asin();
            let roll = (-r[1][2]).atan2(r[2][2]);
            let yaw = (-r[0][1]).atan2(r[0][0]);
            (yaw, pitch, roll)
        }
    }
}

/// Rotation matrix from a quaternion `[w, x, y, z]`. The quaternion is
/// normalised first; a zero quaternion gives the identity.
pub fn quaternion_to_rotation(q: [f32; 4]) -> Mat3 {
    let norm = q.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
        return IDENTITY;
    }

    let [w, x, y, z] = q.map(|v| v / norm);

    [
        [
            1.0 - 2.0 * (y * y + z * z),
            2.0 * (x * y - w * z),
            2.0 * (x * z + w * y),
        ],
        [
            2.0 * (x * y + w * z),
            1.0 - 2.0 * (x * x + z * z),
            2.0 * (y * z - w * x),
        ],
        [
            2.0 * (x * z - w * y),
            2.0 * (y * z + w * x),
            1.0 - 2.0 * (x * x + y * y),
        ],
    ]
}

/// Real SH rotation matrix of `order`, written row major into
/// `out[..nsh * nsh]` with `nsh = (order + 1)^2`.
///
/// The matrix is block diagonal, one `(2l + 1)` square block per degree `l`,
/// and maps ACN coefficients of a sound field to the coefficients of the
/// field rotated by `r`.
pub fn sh_rotation(r: &Mat3, order: usize, out: &mut [f32]) {
    let nsh = order_to_channels(order);
    let out = &mut out[..nsh * nsh];
    out.fill(0.0);
    out[0] = 1.0;

    if order == 0 {
        return;
    }

    // first order block in ACN (y, z, x) order
    const PERM: [usize; 3] = [1, 2, 0];
    let mut r1 = [[0.0f64; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            r1[i][j] = r[PERM[i]][PERM[j]] as f64;
            out[(1 + i) * nsh + 1 + j] = r[PERM[i]][PERM[j]];
        }
    }

    let mut prev = r1.iter().flatten().copied().collect::<Vec<f64>>();

    for l in 2..=order as i32 {
        let dim = (2 * l + 1) as usize;
        let mut cur = vec![0.0f64; dim * dim];
        let block = RecursionBlock {
            r1: &r1,
            prev: &prev,
            l,
        };

        for m in -l..=l {
            for n in -l..=l {
                let d: f64 = if m == 0 { 1.0 } else { 0.0 };
                let denom = if n.abs() == l {
                    (2 * l * (2 * l - 1)) as f64
                } else {
                    (l * l - n * n) as f64
                };

                let mut u = (((l * l - m * m) as f64) / denom).sqrt();
                let mut v = ((1.0 + d) * ((l + m.abs() - 1) * (l + m.abs())) as f64 / denom).sqrt()
                    * (1.0 - 2.0 * d)
                    * 0.5;
                let mut w = (((l - m.abs() - 1) * (l - m.abs())) as f64 / denom).sqrt()
                    * (1.0 - d)
                    * -0.5;

                if u != 0.0 {
                    u *= block.u(m, n);
                }
                if v != 0.0 {
                    v *= block.v(m, n);
                }
                if w != 0.0 {
                    w *= block.w(m, n);
                }

                let value = u + v + w;
                let (row, col) = ((m + l) as usize, (n + l) as usize);
                cur[row * dim + col] = value;

                let off = (l * l) as usize;
                out[(off + row) * nsh + off + col] = value as f32;
            }
        }

        prev = cur;
    }
}

struct RecursionBlock<'a> {
    r1: &'a [[f64; 3]; 3],
    /// block of degree `l - 1`
    prev: &'a [f64],
    l: i32,
}

impl RecursionBlock<'_> {
    fn r1(&self, i: i32, j: i32) -> f64 {
        self.r1[(i + 1) as usize][(j + 1) as usize]
    }

    fn prev(&self, a: i32, b: i32) -> f64 {
        let lm1 = self.l - 1;
        let dim = (2 * lm1 + 1) as usize;
        self.prev[(a + lm1) as usize * dim + (b + lm1) as usize]
    }

    fn p(&self, i: i32, a: i32, b: i32) -> f64 {
        let l = self.l;
        if b == l {
            self.r1(i, 1) * self.prev(a, l - 1) - self.r1(i, -1) * self.prev(a, -l + 1)
        } else if b == -l {
            self.r1(i, 1) * self.prev(a, -l + 1) + self.r1(i, -1) * self.prev(a, l - 1)
        } else {
            self.r1(i, 0) * self.prev(a, b)
        }
    }

    fn u(&self, m: i32, n: i32) -> f64 {
        self.p(0, m, n)
    }

    fn v(&self, m: i32, n: i32) -> f64 {
        if m == 0 {
            self.p(1, 1, n) + self.p(-1, -1, n)
        } else if m > 0 {
            let d: f64 = if m == 1 { 1.0 } else { 0.0 };
            self.p(1, m - 1, n) * (1.0 + d).sqrt() - self.p(-1, -m + 1, n) * (1.0 - d)
        } else {
            let d: f64 = if m == -1 { 1.0 } else { 0.0 };
            self.p(1, m + 1, n) * (1.0 - d) + self.p(-1, -m - 1, n) * (1.0 + d).sqrt()
        }
    }

    fn w(&self, m: i32, n: i32) -> f64 {
        if m > 0 {
            self.p(1, m + 1, n) + self.p(-1, -m - 1, n)
        } else {
            self.p(1, m - 1, n) - self.p(-1, -m + 1, n)
        }
    }
}

/// Applies a mixing matrix with a one frame delay, crossfading between the
/// previous and the current matrix.
///
/// Each call outputs `fade_out * (prev * x_prev) + fade_in * (curr * x_prev)`
/// where `x_prev` is the input of the previous call and the fades ramp
/// linearly across the frame. Afterwards the current matrix becomes the
/// previous one and the input is kept for the next call.
pub struct MatrixFader {
    frame_size: usize,
    max_rows: usize,
    max_cols: usize,
    rows: usize,
    cols: usize,
    prev: Box<[f32]>,
    curr: Box<[f32]>,
    prev_input: Frame,
    fade_in: Box<[f32]>,
}

impl MatrixFader {
    pub fn new(max_rows: usize, max_cols: usize, frame_size: usize) -> Self {
        let fade_in = (0..frame_size)
            .map(|t| (t + 1) as f32 / frame_size as f32)
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            frame_size,
            max_rows,
            max_cols,
            rows: max_rows,
            cols: max_cols,
            prev: vec![0.0; max_rows * max_cols].into_boxed_slice(),
            curr: vec![0.0; max_rows * max_cols].into_boxed_slice(),
            prev_input: Frame::new(max_cols, frame_size),
            fade_in,
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn dims(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Change the active matrix dimensions, returning whether they changed.
    ///
    /// Both matrices are cleared and retained input channels beyond the new
    /// column count are dropped. Callers write the new matrix and then
    /// [`settle`](Self::settle) so no crossfade spans a dimension change.
    pub fn resize(&mut self, rows: usize, cols: usize) -> bool {
        let rows = rows.min(self.max_rows);
        let cols = cols.min(self.max_cols);
        if (rows, cols) == (self.rows, self.cols) {
            return false;
        }

        self.rows = rows;
        self.cols = cols;
        self.curr.fill(0.0);
        self.prev.fill(0.0);
        for ch in cols..self.max_cols {
            self.prev_input.channel_mut(ch).fill(0.0);
        }
        true
    }

    /// Current matrix, row major `rows x cols`.
    pub fn current(&self) -> &[f32] {
        &self.curr[..self.rows * self.cols]
    }

    pub fn current_mut(&mut self) -> &mut [f32] {
        &mut self.curr[..self.rows * self.cols]
    }

    pub fn previous(&self) -> &[f32] {
        &self.prev[..self.rows * self.cols]
    }

    /// Make the current matrix the previous one without a crossfade.
    pub fn settle(&mut self) {
        let n = self.rows * self.cols;
        self.prev[..n].copy_from_slice(&self.curr[..n]);
    }

    /// Forget the retained input frame.
    pub fn reset(&mut self) {
        self.prev_input.clear();
        self.settle();
    }

    /// Mix one frame. `output` channels beyond `rows` are zeroed.
    pub fn process(&mut self, input: &Frame, output: &mut Frame) {
        let (rows, cols) = (self.rows, self.cols);
        let n = rows * cols;
        let fading = self.prev[..n] != self.curr[..n];

        for i in 0..rows.min(output.channels()) {
            let y = output.channel_mut(i);
            let len = y.len().min(self.frame_size);
            let y = &mut y[..len];
            y.fill(0.0);

            for j in 0..cols {
                let a = self.prev[i * cols + j];
                let b = self.curr[i * cols + j];
                let x = self.prev_input.channel(j);

                if fading {
                    if a == 0.0 && b == 0.0 {
                        continue;
                    }
                    for (t, (y, x)) in Iterator::zip(y.iter_mut(), x.iter()).enumerate() {
                        let fi = self.fade_in[t];
                        *y += ((1.0 - fi) * a + fi * b) * x;
                    }
                } else if b != 0.0 {
                    for (y, x) in Iterator::zip(y.iter_mut(), x.iter()) {
                        *y += b * x;
                    }
                }
            }
        }
        for ch in rows..output.channels() {
            output.channel_mut(ch).fill(0.0);
        }

        self.prev[..n].copy_from_slice(&self.curr[..n]);

        for j in 0..self.max_cols {
            let dst = self.prev_input.channel_mut(j);
            if j < cols && j < input.channels() {
                let x = input.channel(j);
                let len = x.len().min(dst.len());
                dst[..len].copy_from_slice(&x[..len]);
                dst[len..].fill(0.0);
            } else {
                dst.fill(0.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sh::real_sh;
    use assert_approx_eq::assert_approx_eq;
    use std::f32::consts::FRAC_PI_2;

    fn sh_matrix(r: &Mat3, order: usize) -> Vec<f32> {
        let nsh = order_to_channels(order);
        let mut m = vec![0.0; nsh * nsh];
        sh_rotation(r, order, &mut m);
        m
    }

    fn matmul(a: &[f32], b: &[f32], n: usize) -> Vec<f32> {
        let mut c = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n {
                c[i * n + j] = (0..n).map(|k| a[i * n + k] * b[k * n + j]).sum();
            }
        }
        c
    }

    #[test]
    fn zero_rotation_is_identity_for_all_orders() {
        let r = euler_to_rotation(0.0, 0.0, 0.0, EulerOrder::YawPitchRoll);
        for order in 0..=7 {
            let nsh = order_to_channels(order);
            let m = sh_matrix(&r, order);
            for i in 0..nsh {
                for j in 0..nsh {
                    let expected = if i == j { 1.0 } else { 0.0 };
                    assert_approx_eq!(m[i * nsh + j], expected, 1e-6);
                }
            }
        }
    }

    #[test]
    fn sh_rotation_is_orthogonal() {
        let r = euler_to_rotation(0.7, -0.4, 1.9, EulerOrder::YawPitchRoll);
        let order = 7;
        let nsh = order_to_channels(order);
        let m = sh_matrix(&r, order);

        for i in 0..nsh {
            for j in 0..nsh {
                let dot: f32 = (0..nsh).map(|k| m[i * nsh + k] * m[j * nsh + k]).sum();
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_approx_eq!(dot, expected, 1e-4);
            }
        }
    }

    #[test]
    fn sh_rotation_composes() {
        let r1 = euler_to_rotation(0.3, 0.2, -0.5, EulerOrder::YawPitchRoll);
        let r2 = euler_to_rotation(-1.1, 0.6, 0.25, EulerOrder::RollPitchYaw);
        let order = 5;
        let nsh = order_to_channels(order);

        let composed = sh_matrix(&mat3_mul(&r2, &r1), order);
        let chained = matmul(&sh_matrix(&r2, order), &sh_matrix(&r1, order), nsh);

        for (a, b) in Iterator::zip(composed.iter(), chained.iter()) {
            assert_approx_eq!(a, b, 1e-4);
        }
    }

    #[test]
    fn first_order_rotates_plane_wave() {
        let r = euler_to_rotation(0.4, -0.3, 0.8, EulerOrder::YawPitchRoll);
        let m = sh_matrix(&r, 1);

        let (az, el) = (1.2f32, 0.3f32);
        let mut y = [0.0; 4];
        real_sh(1, az, el, &mut y);

        let u = [el.cos() * az.cos(), el.cos() * az.sin(), el.sin()];
        let ru = rotate(&r, u);
        let mut expected = [0.0; 4];
        real_sh(1, ru[1].atan2(ru[0]), ru[2].clamp(-1.0, 1.0).asin(), &mut expected);

        for i in 0..4 {
            let rotated: f32 = (0..4).map(|j| m[i * 4 + j] * y[j]).sum();
            assert_approx_eq!(rotated, expected[i], 1e-5);
        }
    }

    #[test]
    fn positive_yaw_moves_source_left() {
        let r = euler_to_rotation(FRAC_PI_2, 0.0, 0.0, EulerOrder::YawPitchRoll);
        let v = rotate(&r, [1.0, 0.0, 0.0]);
        assert_approx_eq!(v[0], 0.0, 1e-6);
        assert_approx_eq!(v[1], 1.0, 1e-6);
        assert_approx_eq!(v[2], 0.0, 1e-6);
    }

    #[test]
    fn quaternion_matches_euler() {
        let yaw = 0.9f32;
        let q = [(yaw / 2.0).cos(), 0.0, 0.0, (yaw / 2.0).sin()];
        let a = quaternion_to_rotation(q);
        let b = euler_to_rotation(yaw, 0.0, 0.0, EulerOrder::YawPitchRoll);

        for i in 0..3 {
            for j in 0..3 {
                assert_approx_eq!(a[i][j], b[i][j], 1e-6);
            }
        }

        assert_eq!(quaternion_to_rotation([0.0; 4]), IDENTITY);
    }

    #[test]
    fn euler_round_trip() {
        for order in [EulerOrder::YawPitchRoll, EulerOrder::RollPitchYaw] {
            let (yaw, pitch, roll) = (0.5, -0.7, 1.3);
            let r = euler_to_rotation(yaw, pitch, roll, order);
            let (y, p, ro) = rotation_to_euler(&r, order);
            assert_approx_eq!(y, yaw, 1e-5);
            assert_approx_eq!(p, pitch, 1e-5);
            assert_approx_eq!(ro, roll, 1e-5);
        }
    }

    fn frame_of(values: &[f32], len: usize) -> Frame {
        let mut frame = Frame::new(values.len(), len);
        for (ch, v) in values.iter().enumerate() {
            frame.channel_mut(ch).fill(*v);
        }
        frame
    }

    #[test]
    fn fader_applies_previous_input_with_delayed_crossfade() {
        let frame = 8;
        let mut fader = MatrixFader::new(2, 2, frame);
        fader.current_mut().copy_from_slice(&[1.0, 0.0, 0.0, 1.0]);
        fader.settle();

        let x1 = frame_of(&[1.0, 2.0], frame);
        let x2 = frame_of(&[5.0, 7.0], frame);
        let mut y = frame_of(&[3.0, 3.0], frame);

        // first call only outputs the (silent) retained input
        fader.process(&x1, &mut y);
        assert!((0..2).all(|ch| y.channel(ch).iter().all(|v| *v == 0.0)));

        // swap channels while x1 is retained
        fader.current_mut().copy_from_slice(&[0.0, 1.0, 1.0, 0.0]);
        fader.process(&x2, &mut y);

        for t in 0..frame {
            let fi = (t + 1) as f32 / frame as f32;
            assert_approx_eq!(y.channel(0)[t], (1.0 - fi) * 1.0 + fi * 2.0, 1e-6);
            assert_approx_eq!(y.channel(1)[t], (1.0 - fi) * 2.0 + fi * 1.0, 1e-6);
        }
        assert_eq!(fader.previous(), fader.current());

        // steady state: new matrix on x2 without fading
        fader.process(&x1, &mut y);
        assert_eq!(y.channel(0), &[7.0; 8]);
        assert_eq!(y.channel(1), &[5.0; 8]);
    }

    #[test]
    fn settled_resize_keeps_level_across_dimension_change() {
        let frame = 16;
        let mut fader = MatrixFader::new(4, 4, frame);
        fader.resize(1, 1);
        fader.current_mut()[0] = 1.0;
        fader.settle();

        let x = frame_of(&[1.0, 0.5, 0.25, 0.125], frame);
        let mut y = Frame::new(4, frame);
        fader.process(&x, &mut y);
        fader.process(&x, &mut y);
        assert_eq!(y.channel(0), &[1.0; 16]);

        assert!(fader.resize(2, 2));
        assert!(!fader.resize(2, 2));
        fader.current_mut().copy_from_slice(&[1.0, 0.0, 0.0, 1.0]);
        fader.settle();

        // no dip on the frame following the change
        fader.process(&x, &mut y);
        assert_eq!(y.channel(0), &[1.0; 16]);
        // the second column was not retained before the change
        assert_eq!(y.channel(1), &[0.0; 16]);
        assert_eq!(y.channel(2), &[0.0; 16]);

        fader.process(&x, &mut y);
        assert_eq!(y.channel(0), &[1.0; 16]);
        assert_eq!(y.channel(1), &[0.5; 16]);
    }
}
