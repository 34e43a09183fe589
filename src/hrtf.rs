//! HRTF sets and their interpolation in the time-frequency domain.
//!
//! An [`HrtfSet`] holds measured head related impulse responses. For
//! rendering they are reduced to per band magnitudes plus one interaural
//! time difference per direction. [`HrtfInterpolator`] mixes both over the
//! measured directions nearest to a target, using a precomputed
//! [`GainTable`], and resynthesises the interaural phase from the
//! interpolated ITD.

use std::f32::consts::PI;

use realfft::num_complex::Complex;
use realfft::RealFftPlanner;
use tracing::debug;

use crate::error::{Error, Result};
use crate::nearfield::{HEAD_RADIUS, SPEED_OF_SOUND};

const DEFAULT_SAMPLE_RATE: f32 = 48000.0;
const DEFAULT_HRIR_LEN: usize = 256;
const DEFAULT_AZIMUTH_STEP: f32 = 10.0;
const DEFAULT_ELEVATION_STEP: f32 = 10.0;

/// Default resolution of a [`GainTable`] in degrees.
pub const DEFAULT_TABLE_AZIMUTH_STEP: f32 = 2.0;
pub const DEFAULT_TABLE_ELEVATION_STEP: f32 = 5.0;

/// Longest interaural delay searched for, in seconds.
const MAX_ITD: f32 = 0.0015;

pub const LEFT: usize = 0;
pub const RIGHT: usize = 1;

/// Unit vector of a direction in degrees, `x` front, `y` left, `z` up.
pub fn unit_vector(azimuth_deg: f32, elevation_deg: f32) -> [f32; 3] {
    let (az, el) = (azimuth_deg.to_radians(), elevation_deg.to_radians());
    [el.cos() * az.cos(), el.cos() * az.sin(), el.sin()]
}

/// Head related impulse responses on a set of directions.
#[derive(Clone, Debug)]
pub struct HrtfSet {
    /// `[azimuth, elevation]` in degrees
    dirs: Vec<[f32; 2]>,
    /// `[dir][ear][tap]`
    hrirs: Vec<f32>,
    hrir_len: usize,
    sample_rate: f32,
}

impl HrtfSet {
    /// Build a set from directions in degrees and their left/right impulse
    /// responses laid out as `[dir][ear][tap]`.
    pub fn new(
        dirs: Vec<[f32; 2]>,
        hrirs: Vec<f32>,
        hrir_len: usize,
        sample_rate: f32,
    ) -> Result<Self> {
        if !(sample_rate.is_normal() && sample_rate.is_sign_positive()) {
            return Err(Error::InvalidSampleRate(sample_rate));
        }
        if dirs.is_empty() {
            return Err(Error::InvalidHrtfSet("no directions"));
        }
        if hrir_len == 0 {
            return Err(Error::InvalidHrtfSet("empty impulse responses"));
        }
        if hrirs.len() != dirs.len() * 2 * hrir_len {
            return Err(Error::InvalidHrtfSet(
                "impulse response data does not match direction count",
            ));
        }
        if dirs.iter().flatten().any(|v| !v.is_finite()) || hrirs.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidHrtfSet("non finite values"));
        }

        Ok(Self {
            dirs,
            hrirs,
            hrir_len,
            sample_rate,
        })
    }

    pub fn num_dirs(&self) -> usize {
        self.dirs.len()
    }

    pub fn directions(&self) -> &[[f32; 2]] {
        &self.dirs
    }

    pub fn hrir_len(&self) -> usize {
        self.hrir_len
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// Impulse response of `ear` ([`LEFT`] or [`RIGHT`]) at direction `dir`.
    pub fn hrir(&self, dir: usize, ear: usize) -> &[f32] {
        let off = (dir * 2 + ear) * self.hrir_len;
        &self.hrirs[off..off + self.hrir_len]
    }

    /// Interaural time difference of every direction in seconds, estimated
    /// from the peak of the interaural cross-correlation.
    ///
    /// Positive values mean the sound reaches the left ear first.
    pub fn estimate_itds(&self) -> Vec<f32> {
        let max_lag = ((MAX_ITD * self.sample_rate).ceil() as usize).min(self.hrir_len - 1) as isize;
        let len = self.hrir_len as isize;

        (0..self.num_dirs())
            .map(|dir| {
                let (l, r) = (self.hrir(dir, LEFT), self.hrir(dir, RIGHT));

                let (best, _) = (-max_lag..=max_lag)
                    .map(|lag| {
                        let xcorr: f32 = (0.max(-lag)..len.min(len - lag))
                            .map(|n| l[n as usize] * r[(n + lag) as usize])
                            .sum();
                        (lag, xcorr)
                    })
                    .fold((0, f32::MIN), |acc, cur| match cur.1 > acc.1 {
                        true => cur,
                        false => acc,
                    });

                best as f32 / self.sample_rate
            })
            .collect()
    }

    /// Magnitude responses `[dir][ear][band]` at the given band centre
    /// frequencies.
    pub fn filterbank_magnitudes(&self, band_freqs: &[f32]) -> Result<Vec<f32>> {
        let nbands = band_freqs.len();
        let nfft = self
            .hrir_len
            .max(2 * nbands.saturating_sub(1))
            .max(2)
            .next_power_of_two();

        let mut planner = RealFftPlanner::<f32>::new();
        let rfft = planner.plan_fft_forward(nfft);
        let mut scratch = rfft.make_scratch_vec();
        let mut time = rfft.make_input_vec();
        let mut spectrum = rfft.make_output_vec();

        let bins = band_freqs
            .iter()
            .map(|f| ((f * nfft as f32 / self.sample_rate).round() as usize).min(nfft / 2))
            .collect::<Vec<_>>();

        let mut mags = Vec::with_capacity(self.num_dirs() * 2 * nbands);
        for dir in 0..self.num_dirs() {
            for ear in [LEFT, RIGHT] {
                time[..self.hrir_len].copy_from_slice(self.hrir(dir, ear));
                time[self.hrir_len..].fill(0.0);
                rfft.process_with_scratch(&mut time, &mut spectrum, &mut scratch)?;

                mags.extend(bins.iter().map(|bin| spectrum[*bin].norm()));
            }
        }

        Ok(mags)
    }

    /// The same set at another sample rate.
    #[cfg(feature = "resample")]
    pub fn resampled(&self, sample_rate: f32) -> Result<HrtfSet> {
        use crate::resample::{resample, Quality};

        if !(sample_rate.is_normal() && sample_rate.is_sign_positive()) {
            return Err(Error::InvalidSampleRate(sample_rate));
        }

        let ratio = sample_rate / self.sample_rate;
        let hrir_len = ((self.hrir_len as f32 * ratio).ceil() as usize).max(1);

        let hrirs = resample(
            &self.hrirs,
            self.hrir_len,
            hrir_len,
            self.sample_rate.round() as u32,
            sample_rate.round() as u32,
            self.num_dirs() * 2,
            Quality::Best,
        )?;

        debug!(from = self.sample_rate, to = sample_rate, "resampled HRTF set");
        HrtfSet::new(self.dirs.clone(), hrirs, hrir_len, sample_rate)
    }
}

/// Options generating an analytic spherical head HRTF set.
///
/// Each ear gets a Woodworth delay and the Brown-Duda single pole, single
/// zero head shadow filter for its incidence angle.
///
/// ```rust
/// use sphar::hrtf::SphericalHeadOptions;
///
/// let set = SphericalHeadOptions::new()
///     .sample_rate(44100.0)
///     .azimuth_step(15.0)
///     .generate()
///     .unwrap();
/// ```
#[derive(Clone, Debug)]
pub struct SphericalHeadOptions {
    sample_rate: f32,
    hrir_len: usize,
    azimuth_step: f32,
    elevation_step: f32,
    head_radius: f32,
}

impl Default for SphericalHeadOptions {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            hrir_len: DEFAULT_HRIR_LEN,
            azimuth_step: DEFAULT_AZIMUTH_STEP,
            elevation_step: DEFAULT_ELEVATION_STEP,
            head_radius: HEAD_RADIUS,
        }
    }
}

impl SphericalHeadOptions {
    pub fn new() -> Self {
        Default::default()
    }

    /// Default value is 48_000.0.
    pub fn sample_rate(&mut self, sample_rate: f32) -> &mut Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Impulse response length in samples. Default value is 256.
    pub fn hrir_len(&mut self, hrir_len: usize) -> &mut Self {
        self.hrir_len = hrir_len;
        self
    }

    /// Azimuth spacing of the generated directions in degrees. Default value
    /// is 10.
    pub fn azimuth_step(&mut self, azimuth_step: f32) -> &mut Self {
        self.azimuth_step = azimuth_step;
        self
    }

    /// Elevation spacing in degrees. Default value is 10.
    pub fn elevation_step(&mut self, elevation_step: f32) -> &mut Self {
        self.elevation_step = elevation_step;
        self
    }

    /// Head radius in metres.
    pub fn head_radius(&mut self, head_radius: f32) -> &mut Self {
        self.head_radius = head_radius;
        self
    }

    pub fn generate(&self) -> Result<HrtfSet> {
        if !(self.sample_rate.is_normal() && self.sample_rate.is_sign_positive()) {
            return Err(Error::InvalidSampleRate(self.sample_rate));
        }
        if !(self.azimuth_step > 0.0 && self.elevation_step > 0.0 && self.head_radius > 0.0) {
            return Err(Error::InvalidHrtfSet("grid steps and head radius must be positive"));
        }

        let n_az = ((360.0 / self.azimuth_step).round() as usize).max(1);
        let n_el = ((180.0 / self.elevation_step).round() as usize).max(1);

        let mut dirs = Vec::new();
        for e in 0..=n_el {
            let el = -90.0 + 180.0 * e as f32 / n_el as f32;
            match el.abs() >= 90.0 {
                true => dirs.push([0.0, el]),
                false => dirs.extend((0..n_az).map(|a| {
                    let az = 360.0 * a as f32 / n_az as f32;
                    [if az > 180.0 { az - 360.0 } else { az }, el]
                })),
            }
        }

        let mut hrirs = vec![0.0; dirs.len() * 2 * self.hrir_len];
        for (dir, ir) in Iterator::zip(dirs.iter(), hrirs.chunks_exact_mut(2 * self.hrir_len)) {
            let v = unit_vector(dir[0], dir[1]);
            let (left, right) = ir.split_at_mut(self.hrir_len);
            self.ear_response(v[1], left);
            self.ear_response(-v[1], right);
        }

        HrtfSet::new(dirs, hrirs, self.hrir_len, self.sample_rate)
    }

    /// Impulse response of an ear whose axis makes `acos(cos_theta)` with the
    /// source direction.
    fn ear_response(&self, cos_theta: f32, out: &mut [f32]) {
        let theta = cos_theta.clamp(-1.0, 1.0).acos();
        let a_c = self.head_radius / SPEED_OF_SOUND;

        // Woodworth, shifted so the earliest arrival is at one head radius
        let delay = match theta < PI / 2.0 {
            true => a_c * (1.0 - theta.cos()),
            false => a_c * (1.0 + theta - PI / 2.0),
        } * self.sample_rate;

        let alpha = 1.05 + 0.95 * (theta.to_degrees() / 150.0 * PI).cos();
        let w0 = SPEED_OF_SOUND / self.head_radius;
        let k = 2.0 * self.sample_rate;
        let norm = 1.0 + k / (2.0 * w0);
        let b0 = (1.0 + k * alpha / (2.0 * w0)) / norm;
        let b1 = (1.0 - k * alpha / (2.0 * w0)) / norm;
        let a1 = (1.0 - k / (2.0 * w0)) / norm;

        // fractional delay by linear interpolation
        out.fill(0.0);
        let i = delay.floor() as usize;
        let frac = delay - delay.floor();
        if let Some(v) = out.get_mut(i) {
            *v = 1.0 - frac;
        }
        if let Some(v) = out.get_mut(i + 1) {
            *v = frac;
        }

        let (mut x1, mut y1) = (0.0, 0.0);
        for v in out.iter_mut() {
            let y = b0 * *v + b1 * x1 - a1 * y1;
            x1 = *v;
            y1 = y;
            *v = y;
        }
    }
}

/// Generator of amplitude panning gains over a set of measured directions.
pub trait PanningGains: Send + Sync {
    /// Gains of `dirs` (unit vectors) for a source towards `target`, written
    /// to `out` as `(direction index, gain)` pairs.
    fn gains(&self, dirs: &[[f32; 3]], target: [f32; 3], out: &mut Vec<(usize, f32)>);
}

/// Mixes the `k` measured directions nearest to the target, weighted by
/// inverse angular distance. Gains sum to one.
#[derive(Clone, Copy, Debug)]
pub struct NearestDirections {
    pub k: usize,
}

impl Default for NearestDirections {
    fn default() -> Self {
        Self { k: 3 }
    }
}

impl PanningGains for NearestDirections {
    fn gains(&self, dirs: &[[f32; 3]], target: [f32; 3], out: &mut Vec<(usize, f32)>) {
        out.clear();

        let mut angles = dirs
            .iter()
            .enumerate()
            .map(|(i, d)| {
                let dot = d[0] * target[0] + d[1] * target[1] + d[2] * target[2];
                (i, dot.clamp(-1.0, 1.0).acos())
            })
            .collect::<Vec<_>>();

        let k = self.k.clamp(1, angles.len().max(1));
        if angles.is_empty() {
            return;
        }
        angles.select_nth_unstable_by(k - 1, |a, b| a.1.total_cmp(&b.1));
        angles.truncate(k);

        if let Some((i, _)) = angles.iter().find(|(_, angle)| *angle < 1e-4) {
            out.push((*i, 1.0));
            return;
        }

        let total: f32 = angles.iter().map(|(_, angle)| 1.0 / angle).sum();
        out.extend(angles.iter().map(|(i, angle)| (*i, 1.0 / angle / total)));
    }
}

/// Panning gains precomputed on a regular azimuth/elevation grid.
#[derive(Clone, Debug)]
pub struct GainTable {
    azimuth_step: f32,
    elevation_step: f32,
    n_az: usize,
    n_el: usize,
    /// start of each grid point's entries, plus one past the end
    offsets: Vec<usize>,
    entries: Vec<(usize, f32)>,
}

impl GainTable {
    pub fn new(
        dirs: &[[f32; 2]],
        azimuth_step: f32,
        elevation_step: f32,
        panner: &dyn PanningGains,
    ) -> Result<Self> {
        if !(azimuth_step > 0.0 && elevation_step > 0.0) {
            return Err(Error::InvalidHrtfSet("gain table steps must be positive"));
        }

        let n_az = ((360.0 / azimuth_step).round() as usize).max(1);
        let n_el = (180.0 / elevation_step).round() as usize + 1;
        let units = dirs
            .iter()
            .map(|d| unit_vector(d[0], d[1]))
            .collect::<Vec<_>>();

        let mut offsets = Vec::with_capacity(n_az * n_el + 1);
        let mut entries = Vec::new();
        let mut gains = Vec::new();

        for e in 0..n_el {
            let el = (-90.0 + e as f32 * elevation_step).min(90.0);
            for a in 0..n_az {
                let az = a as f32 * azimuth_step;
                panner.gains(&units, unit_vector(az, el), &mut gains);
                offsets.push(entries.len());
                entries.extend_from_slice(&gains);
            }
        }
        offsets.push(entries.len());

        debug!(n_az, n_el, entries = entries.len(), "built gain table");

        Ok(Self {
            azimuth_step,
            elevation_step,
            n_az,
            n_el,
            offsets,
            entries,
        })
    }

    /// Gains of the grid point nearest to the direction in degrees.
    pub fn lookup(&self, azimuth_deg: f32, elevation_deg: f32) -> &[(usize, f32)] {
        let az = azimuth_deg.rem_euclid(360.0);
        let a = (az / self.azimuth_step).round() as usize % self.n_az;
        let e = (((elevation_deg.clamp(-90.0, 90.0) + 90.0) / self.elevation_step).round()
            as usize)
            .min(self.n_el - 1);

        let point = e * self.n_az + a;
        &self.entries[self.offsets[point]..self.offsets[point + 1]]
    }
}

/// Interpolated binaural filters at the band centres of a filterbank.
pub struct HrtfInterpolator {
    table: GainTable,
    /// `[dir][ear][band]`
    mags: Vec<f32>,
    itds: Vec<f32>,
    band_freqs: Vec<f32>,
}

impl HrtfInterpolator {
    pub fn new(
        set: &HrtfSet,
        band_freqs: &[f32],
        azimuth_step: f32,
        elevation_step: f32,
        panner: &dyn PanningGains,
    ) -> Result<Self> {
        Ok(Self {
            table: GainTable::new(set.directions(), azimuth_step, elevation_step, panner)?,
            mags: set.filterbank_magnitudes(band_freqs)?,
            itds: set.estimate_itds(),
            band_freqs: band_freqs.to_vec(),
        })
    }

    pub fn num_bands(&self) -> usize {
        self.band_freqs.len()
    }

    /// Left and right complex gains per band for a direction in degrees.
    ///
    /// Magnitudes and the ITD are interpolated separately. The interaural
    /// phase `2 pi f itd`, wrapped to `[-pi, pi]`, is split evenly between
    /// the ears.
    pub fn interpolate(&self, azimuth_deg: f32, elevation_deg: f32, out: &mut [[Complex<f32>; 2]]) {
        let nbands = self.num_bands();
        let gains = self.table.lookup(azimuth_deg, elevation_deg);
        let itd: f32 = gains.iter().map(|(i, g)| g * self.itds[*i]).sum();

        for (band, (out, freq)) in Iterator::zip(out.iter_mut(), self.band_freqs.iter()).enumerate() {
            let (mut left, mut right) = (0.0, 0.0);
            for (i, g) in gains {
                left += g * self.mags[(i * 2 + LEFT) * nbands + band];
                right += g * self.mags[(i * 2 + RIGHT) * nbands + band];
            }

            let ipd = wrap_phase(2.0 * PI * freq * itd);
            out[LEFT] = Complex::from_polar(left, ipd / 2.0);
            out[RIGHT] = Complex::from_polar(right, -ipd / 2.0);
        }
    }
}

fn wrap_phase(phase: f32) -> f32 {
    (phase + PI).rem_euclid(2.0 * PI) - PI
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn small_set() -> HrtfSet {
        SphericalHeadOptions::new()
            .azimuth_step(30.0)
            .elevation_step(30.0)
            .hrir_len(128)
            .generate()
            .unwrap()
    }

    #[test]
    fn validates_set() {
        assert!(HrtfSet::new(vec![], vec![], 4, 48000.0).is_err());
        assert!(HrtfSet::new(vec![[0.0, 0.0]], vec![0.0; 8], 4, -1.0).is_err());
        assert!(HrtfSet::new(vec![[0.0, 0.0]], vec![0.0; 7], 4, 48000.0).is_err());
        assert!(HrtfSet::new(vec![[0.0, 0.0]], vec![0.0; 8], 4, 48000.0).is_ok());
    }

    #[test]
    fn spherical_head_grid() {
        let set = small_set();
        // 12 azimuths on 5 ring elevations plus both poles
        assert_eq!(set.num_dirs(), 12 * 5 + 2);
        assert_eq!(set.hrir_len(), 128);
        assert_eq!(set.directions()[0], [0.0, -90.0]);
    }

    #[test]
    fn itd_sign_follows_lateral_side() {
        let set = small_set();
        let itds = set.estimate_itds();

        for (dir, itd) in Iterator::zip(set.directions().iter(), itds.iter()) {
            let y = unit_vector(dir[0], dir[1])[1];
            if y > 0.3 {
                assert!(*itd > 0.0, "{dir:?} {itd}");
            } else if y < -0.3 {
                assert!(*itd < 0.0, "{dir:?} {itd}");
            } else if y.abs() < 1e-3 {
                assert_approx_eq!(itd, 0.0, 1.0 / set.sample_rate());
            }
        }
    }

    #[test]
    fn nearest_directions_sum_to_one() {
        let dirs = [[0.0, 0.0], [90.0, 0.0], [180.0, 0.0], [-90.0, 0.0], [0.0, 90.0]]
            .map(|d: [f32; 2]| unit_vector(d[0], d[1]));
        let panner = NearestDirections::default();
        let mut gains = Vec::new();

        panner.gains(&dirs, unit_vector(30.0, 10.0), &mut gains);
        assert_eq!(gains.len(), 3);
        assert_approx_eq!(gains.iter().map(|g| g.1).sum::<f32>(), 1.0, 1e-6);
        assert!(gains.iter().any(|g| g.0 == 0));

        // exact hit
        panner.gains(&dirs, unit_vector(90.0, 0.0), &mut gains);
        assert_eq!(gains, vec![(1, 1.0)]);
    }

    #[test]
    fn gain_table_lookup_wraps() {
        let set = small_set();
        let table = GainTable::new(set.directions(), 2.0, 5.0, &NearestDirections::default()).unwrap();

        assert_eq!(table.lookup(-30.0, 0.0), table.lookup(330.0, 0.0));
        assert_eq!(table.lookup(359.5, 0.0), table.lookup(0.0, 0.0));
        assert_eq!(table.lookup(0.0, 120.0), table.lookup(0.0, 90.0));
    }

    #[test]
    fn interpolated_filters() {
        let set = small_set();
        let hop = 64;
        let freqs = (0..=hop)
            .map(|k| k as f32 * set.sample_rate() / (2 * hop) as f32)
            .collect::<Vec<_>>();
        let interp = HrtfInterpolator::new(&set, &freqs, 2.0, 5.0, &NearestDirections::default())
            .unwrap();

        let mut front = vec![[Complex::new(0.0, 0.0); 2]; freqs.len()];
        interp.interpolate(0.0, 0.0, &mut front);
        for [l, r] in front.iter() {
            assert_approx_eq!(l.norm(), r.norm(), 1e-4);
            assert_approx_eq!(l.arg(), 0.0, 1e-4);
        }

        // a source on the left is louder at high frequencies in the left ear
        let mut left = vec![[Complex::new(0.0, 0.0); 2]; freqs.len()];
        interp.interpolate(90.0, 0.0, &mut left);
        let top = freqs.len() - 10;
        assert!(left[top][LEFT].norm() > left[top][RIGHT].norm());
        // the left ear leads, so its phase is advanced in the lowest band
        assert!(left[1][LEFT].arg() > 0.0);
        assert!(left[1][RIGHT].arg() < 0.0);
    }

    #[cfg(feature = "resample")]
    #[test]
    fn resampled_set_keeps_directions() {
        let set = small_set();
        let resampled = set.resampled(44100.0).unwrap();

        assert_eq!(resampled.num_dirs(), set.num_dirs());
        assert_eq!(resampled.sample_rate(), 44100.0);
        assert_eq!(resampled.hrir_len(), (128.0f32 * 44100.0 / 48000.0).ceil() as usize);

        let same = set.resampled(48000.0).unwrap();
        assert_eq!(same.hrir(3, RIGHT), set.hrir(3, RIGHT));
    }
}
