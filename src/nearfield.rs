//! Near-field correction for sources close to the head.
//!
//! The distance variation function of a rigid sphere is approximated per ear
//! by a first order shelving filter. Its DC gain follows the level change
//! of a point source relative to the far field, and its corner frequencies
//! follow the Brown-Duda head shadow model evaluated at the far field and at
//! the near field incidence angle.

use std::f32::consts::PI;

/// Radius of the spherical head model in metres.
pub const HEAD_RADIUS: f32 = 0.09096;
/// Speed of sound in metres per second.
pub const SPEED_OF_SOUND: f32 = 343.0;

/// Distance in metres at or beyond which no correction is applied.
pub fn far_field_threshold() -> f32 {
    34.0 * HEAD_RADIUS
}

/// Smallest distance in metres the correction is evaluated at.
pub fn near_field_limit() -> f32 {
    1.15 * HEAD_RADIUS
}

/// Brown-Duda head shadow zero coefficient at incidence angle `theta_deg`
/// measured from the ear axis.
fn shadow_alpha(theta_deg: f32) -> f32 {
    const ALPHA_MIN: f32 = 0.05;
    const THETA_MIN: f32 = 150.0;
    (1.0 + ALPHA_MIN) + (1.0 - ALPHA_MIN) * (theta_deg / THETA_MIN * PI).cos()
}

/// Coefficients of one ear's filter,
/// `y[n] = b0 x[n] + b1 x[n - 1] - a1 y[n - 1]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DvfCoeffs {
    pub b0: f32,
    pub b1: f32,
    pub a1: f32,
}

impl DvfCoeffs {
    pub const IDENTITY: DvfCoeffs = DvfCoeffs {
        b0: 1.0,
        b1: 0.0,
        a1: 0.0,
    };

    /// Coefficients for a source at `ipsilateral_deg` degrees from the ear
    /// axis and `rho` head radii from the head centre.
    ///
    /// `rho` is clamped to the near-field limit.
    pub fn new(ipsilateral_deg: f32, rho: f32, sample_rate: f32) -> Self {
        let rho = rho.max(near_field_limit() / HEAD_RADIUS);
        let theta = ipsilateral_deg.clamp(0.0, 180.0);
        let cos_a = theta.to_radians().cos();

        // distance from the ear relative to the head radius
        let r_ear = (rho * rho - 2.0 * rho * cos_a + 1.0).sqrt();
        let gain = rho / r_ear;
        let theta_near = ((rho * cos_a - 1.0) / r_ear).clamp(-1.0, 1.0).acos().to_degrees();

        let w0 = SPEED_OF_SOUND / HEAD_RADIUS;
        let tau_zero = shadow_alpha(theta_near) / (2.0 * w0);
        let tau_pole = shadow_alpha(theta) / (2.0 * w0);

        let k = 2.0 * sample_rate;
        let norm = 1.0 + k * tau_pole;

        Self {
            b0: gain * (1.0 + k * tau_zero) / norm,
            b1: gain * (1.0 - k * tau_zero) / norm,
            a1: (1.0 - k * tau_pole) / norm,
        }
    }

    /// Coefficients for both ears of a source at `azimuth_deg`,
    /// `elevation_deg` and `distance` metres, or `None` in the far field.
    pub fn for_source(
        azimuth_deg: f32,
        elevation_deg: f32,
        distance: f32,
        sample_rate: f32,
    ) -> Option<[DvfCoeffs; 2]> {
        if distance >= far_field_threshold() {
            return None;
        }

        let (az, el) = (azimuth_deg.to_radians(), elevation_deg.to_radians());
        // left ear on +y
        let cos_left = (el.cos() * az.sin()).clamp(-1.0, 1.0);
        let left = cos_left.acos().to_degrees();
        let right = (-cos_left).acos().to_degrees();

        let rho = distance / HEAD_RADIUS;
        Some([
            DvfCoeffs::new(left, rho, sample_rate),
            DvfCoeffs::new(right, rho, sample_rate),
        ])
    }
}

/// One ear's near-field filter with its one sample state.
#[derive(Clone, Debug)]
pub struct NearFieldFilter {
    coeffs: DvfCoeffs,
    x1: f32,
    y1: f32,
}

impl Default for NearFieldFilter {
    fn default() -> Self {
        Self {
            coeffs: DvfCoeffs::IDENTITY,
            x1: 0.0,
            y1: 0.0,
        }
    }
}

impl NearFieldFilter {
    pub fn set_coeffs(&mut self, coeffs: DvfCoeffs) {
        self.coeffs = coeffs;
    }

    pub fn coeffs(&self) -> DvfCoeffs {
        self.coeffs
    }

    /// Filter `input` into `output`, carrying state to the next call.
    pub fn process(&mut self, input: &[f32], output: &mut [f32]) {
        let DvfCoeffs { b0, b1, a1 } = self.coeffs;

        for (x, y) in Iterator::zip(input.iter(), output.iter_mut()) {
            let out = b0 * x + b1 * self.x1 - a1 * self.y1;
            self.x1 = *x;
            self.y1 = out;
            *y = out;
        }
    }

    pub fn reset(&mut self) {
        self.x1 = 0.0;
        self.y1 = 0.0;
    }
}
