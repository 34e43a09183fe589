//! Binaural rendering of point sources in the time-frequency domain.
//!
//! Each source is analysed with the STFT, multiplied per band by the left
//! and right HRTF interpolated for its direction, and the products are
//! summed over sources. Filters for a new direction are crossfaded in across
//! the time slots of one frame.
//!
//! Replacing the HRTF set is a destructive reconfiguration: call
//! [`BinauraliserParams::set_hrtf_set`] and then
//! [`BinauraliserParams::init_codec`] from a non real-time thread. The
//! processing call emits silence until the new tables are handed over.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use realfft::num_complex::Complex;
use realfft::num_traits::Zero;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::fifo::{silence, FrameProcessor};
use crate::gate::{AtomicF32, CodecStatus, Dirty, Gate, Lifecycle, Slot};
use crate::hrtf::{
    unit_vector, HrtfInterpolator, HrtfSet, NearestDirections, PanningGains,
    SphericalHeadOptions, DEFAULT_TABLE_AZIMUTH_STEP, DEFAULT_TABLE_ELEVATION_STEP, LEFT, RIGHT,
};
use crate::nearfield::{DvfCoeffs, NearFieldFilter};
use crate::rotation::{euler_to_rotation, rotate, transpose, EulerOrder};
use crate::stft::{Stft, TfAdapter, TransformEngine};

pub const MAX_NUM_SOURCES: usize = 64;

const DEFAULT_SAMPLE_RATE: f32 = 48000.0;
const DEFAULT_FRAME_SIZE: usize = 512;
const DEFAULT_HOP_SIZE: usize = 128;
const DEFAULT_NUM_SOURCES: usize = 1;
const DEFAULT_DISTANCE: f32 = 1.0;

/// Everything needed to turn an HRTF set into interpolation tables.
struct CodecConfig {
    sample_rate: f32,
    band_freqs: Vec<f32>,
    azimuth_step: f32,
    elevation_step: f32,
    panner: Box<dyn PanningGains>,
}

/// Shared parameter handle of a [`Binauraliser`]. Angles are in degrees,
/// distances in metres.
pub struct BinauraliserParams {
    num_sources: AtomicUsize,
    azimuth: [AtomicF32; MAX_NUM_SOURCES],
    elevation: [AtomicF32; MAX_NUM_SOURCES],
    distance: [AtomicF32; MAX_NUM_SOURCES],
    rotation: AtomicBool,
    /// effective head orientation, flips already applied
    yaw: AtomicF32,
    pitch: AtomicF32,
    roll: AtomicF32,
    flip_yaw: AtomicBool,
    flip_pitch: AtomicBool,
    flip_roll: AtomicBool,
    roll_pitch_yaw: AtomicBool,
    near_field: AtomicBool,
    gate: Gate,
    lifecycle: Lifecycle,
    requested: Mutex<Option<HrtfSet>>,
    pending: Slot<HrtfInterpolator>,
    hrtf_dirs: AtomicUsize,
    codec: CodecConfig,
}

fn flipped(value: f32, flip: bool) -> f32 {
    match flip {
        true => -value,
        false => value,
    }
}

impl BinauraliserParams {
    fn new(num_sources: usize, codec: CodecConfig) -> Self {
        Self {
            num_sources: AtomicUsize::new(num_sources),
            azimuth: std::array::from_fn(|_| AtomicF32::new(0.0)),
            elevation: std::array::from_fn(|_| AtomicF32::new(0.0)),
            distance: std::array::from_fn(|_| AtomicF32::new(DEFAULT_DISTANCE)),
            rotation: AtomicBool::new(false),
            yaw: AtomicF32::new(0.0),
            pitch: AtomicF32::new(0.0),
            roll: AtomicF32::new(0.0),
            flip_yaw: AtomicBool::new(false),
            flip_pitch: AtomicBool::new(false),
            flip_roll: AtomicBool::new(false),
            roll_pitch_yaw: AtomicBool::new(false),
            near_field: AtomicBool::new(false),
            gate: Gate::dirty(Dirty),
            lifecycle: Lifecycle::new(CodecStatus::NotInitialised),
            requested: Mutex::new(None),
            pending: Slot::default(),
            hrtf_dirs: AtomicUsize::new(0),
            codec,
        }
    }

    /// Set the number of sources, clamped to `[1, MAX_NUM_SOURCES]`.
    pub fn set_num_sources(&self, num_sources: usize) {
        self.num_sources
            .store(num_sources.clamp(1, MAX_NUM_SOURCES), Ordering::SeqCst);
        self.gate.mark_dirty(Dirty);
    }

    pub fn num_sources(&self) -> usize {
        self.num_sources.load(Ordering::SeqCst)
    }

    /// Set the direction of source `index`. Azimuth is wrapped to
    /// `(-180, 180]`, elevation clamped to `[-90, 90]`. Out of range indices
    /// are ignored.
    pub fn set_source_direction(&self, index: usize, azimuth: f32, elevation: f32) {
        if index >= MAX_NUM_SOURCES {
            return;
        }
        let azimuth = azimuth.rem_euclid(360.0);
        let azimuth = if azimuth > 180.0 { azimuth - 360.0 } else { azimuth };
        self.azimuth[index].store(azimuth);
        self.elevation[index].store(elevation.clamp(-90.0, 90.0));
        self.gate.mark_dirty(Dirty);
    }

    pub fn source_direction(&self, index: usize) -> Option<(f32, f32)> {
        (index < MAX_NUM_SOURCES).then(|| (self.azimuth[index].load(), self.elevation[index].load()))
    }

    /// Set the distance of source `index` from the head centre. Negative
    /// values are clamped to zero.
    pub fn set_source_distance(&self, index: usize, distance: f32) {
        if index >= MAX_NUM_SOURCES {
            return;
        }
        self.distance[index].store(distance.max(0.0));
        self.gate.mark_dirty(Dirty);
    }

    pub fn source_distance(&self, index: usize) -> Option<f32> {
        (index < MAX_NUM_SOURCES).then(|| self.distance[index].load())
    }

    pub fn set_near_field(&self, enable: bool) {
        self.near_field.store(enable, Ordering::Relaxed);
        self.gate.mark_dirty(Dirty);
    }

    pub fn near_field(&self) -> bool {
        self.near_field.load(Ordering::Relaxed)
    }

    /// Enable head tracking.
    pub fn set_rotation(&self, enable: bool) {
        self.rotation.store(enable, Ordering::Relaxed);
        self.gate.mark_dirty(Dirty);
    }

    pub fn rotation(&self) -> bool {
        self.rotation.load(Ordering::Relaxed)
    }

    /// Head yaw in degrees, clamped to `[-180, 180]`.
    pub fn set_yaw(&self, yaw: f32) {
        let yaw = yaw.clamp(-180.0, 180.0);
        self.yaw
            .store(flipped(yaw, self.flip_yaw.load(Ordering::Relaxed)));
        self.gate.mark_dirty(Dirty);
    }

    /// Head pitch in degrees, clamped to `[-90, 90]`.
    pub fn set_pitch(&self, pitch: f32) {
        let pitch = pitch.clamp(-90.0, 90.0);
        self.pitch
            .store(flipped(pitch, self.flip_pitch.load(Ordering::Relaxed)));
        self.gate.mark_dirty(Dirty);
    }

    /// Head roll in degrees, clamped to `[-180, 180]`.
    pub fn set_roll(&self, roll: f32) {
        let roll = roll.clamp(-180.0, 180.0);
        self.roll
            .store(flipped(roll, self.flip_roll.load(Ordering::Relaxed)));
        self.gate.mark_dirty(Dirty);
    }

    pub fn yaw(&self) -> f32 {
        flipped(self.yaw.load(), self.flip_yaw.load(Ordering::Relaxed))
    }

    pub fn pitch(&self) -> f32 {
        flipped(self.pitch.load(), self.flip_pitch.load(Ordering::Relaxed))
    }

    pub fn roll(&self) -> f32 {
        flipped(self.roll.load(), self.flip_roll.load(Ordering::Relaxed))
    }

    pub fn set_flip_yaw(&self, flip: bool) {
        self.flip_yaw.store(flip, Ordering::Relaxed);
    }

    pub fn set_flip_pitch(&self, flip: bool) {
        self.flip_pitch.store(flip, Ordering::Relaxed);
    }

    pub fn set_flip_roll(&self, flip: bool) {
        self.flip_roll.store(flip, Ordering::Relaxed);
    }

    pub fn set_roll_pitch_yaw(&self, enable: bool) {
        self.roll_pitch_yaw.store(enable, Ordering::Relaxed);
        self.gate.mark_dirty(Dirty);
    }

    pub fn roll_pitch_yaw(&self) -> bool {
        self.roll_pitch_yaw.load(Ordering::Relaxed)
    }

    /// Request a new HRTF set. Takes effect after [`Self::init_codec`].
    pub fn set_hrtf_set(&self, set: HrtfSet) {
        *self.requested.lock() = Some(set);
        self.lifecycle.invalidate();
    }

    /// Go back to the built in spherical head set.
    pub fn use_default_hrtf_set(&self) {
        *self.requested.lock() = None;
        self.lifecycle.invalidate();
    }

    pub fn codec_status(&self) -> CodecStatus {
        self.lifecycle.status()
    }

    /// Number of directions of the loaded HRTF set.
    pub fn hrtf_num_dirs(&self) -> usize {
        self.hrtf_dirs.load(Ordering::Relaxed)
    }

    /// Rebuild the HRTF tables if a new set was requested.
    ///
    /// Blocks until the in-flight processing call has returned, so it must
    /// not be called from the processing thread. A requested set that fails
    /// to load is replaced with the default one. Returns whether a rebuild
    /// happened.
    pub fn init_codec(&self) -> Result<bool> {
        if !self.lifecycle.begin_init() {
            return Ok(false);
        }

        let requested = self.requested.lock().take();
        let result = match requested {
            Some(set) => self.build_tables(set).or_else(|e| {
                warn!("could not load the HRTF set, using the default one: {e}");
                self.build_default_tables()
            }),
            None => self.build_default_tables(),
        };

        match result {
            Ok(interp) => {
                self.pending.put(interp);
                self.lifecycle.end_init(true);
                Ok(true)
            }
            Err(e) => {
                error!("HRTF initialisation failed: {e}");
                self.lifecycle.end_init(false);
                Err(e)
            }
        }
    }

    fn build_default_tables(&self) -> Result<HrtfInterpolator> {
        let set = SphericalHeadOptions::new()
            .sample_rate(self.codec.sample_rate)
            .generate()?;
        self.build_tables(set)
    }

    fn build_tables(&self, set: HrtfSet) -> Result<HrtfInterpolator> {
        let codec = &self.codec;

        #[cfg(feature = "resample")]
        let set = match set.sample_rate() != codec.sample_rate {
            true => set.resampled(codec.sample_rate)?,
            false => set,
        };

        #[cfg(not(feature = "resample"))]
        {
            if set.sample_rate() != codec.sample_rate {
                warn!(
                    hrtf = set.sample_rate(),
                    host = codec.sample_rate,
                    "HRTF sample rate differs from the host rate"
                );
            }
        }

        let interp = HrtfInterpolator::new(
            &set,
            &codec.band_freqs,
            codec.azimuth_step,
            codec.elevation_step,
            codec.panner.as_ref(),
        )?;

        self.hrtf_dirs.store(set.num_dirs(), Ordering::Relaxed);
        debug!(dirs = set.num_dirs(), hrir_len = set.hrir_len(), "HRTF tables ready");

        Ok(interp)
    }
}

#[must_use]
pub struct BinauraliserBuilder {
    sample_rate: f32,
    frame_size: usize,
    hop_size: usize,
    num_sources: usize,
    hrtf_set: Option<HrtfSet>,
    panner: Box<dyn PanningGains>,
    azimuth_step: f32,
    elevation_step: f32,
}

impl BinauraliserBuilder {
    fn new() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_size: DEFAULT_FRAME_SIZE,
            hop_size: DEFAULT_HOP_SIZE,
            num_sources: DEFAULT_NUM_SOURCES,
            hrtf_set: None,
            panner: Box::new(NearestDirections::default()),
            azimuth_step: DEFAULT_TABLE_AZIMUTH_STEP,
            elevation_step: DEFAULT_TABLE_ELEVATION_STEP,
        }
    }

    /// Set the host sampling rate. Default value is 48_000.0.
    pub fn with_sample_rate(mut self, sample_rate: f32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Set the processing frame size, a multiple of the hop size. Default
    /// value is 512.
    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size;
        self
    }

    /// Set the STFT hop size. Default value is 128.
    pub fn with_hop_size(mut self, hop_size: usize) -> Self {
        self.hop_size = hop_size;
        self
    }

    /// Set the initial number of sources. Default value is 1.
    pub fn with_num_sources(mut self, num_sources: usize) -> Self {
        self.num_sources = num_sources;
        self
    }

    /// Use `set` instead of the built in spherical head set.
    pub fn with_hrtf_set(mut self, set: HrtfSet) -> Self {
        self.hrtf_set = Some(set);
        self
    }

    /// Set the panning gain generator. Default is [`NearestDirections`].
    pub fn with_panner<P: PanningGains + 'static>(mut self, panner: P) -> Self {
        self.panner = Box::new(panner);
        self
    }

    /// Resolution of the precomputed gain table in degrees. Default values
    /// are 2 and 5.
    pub fn with_gain_table_resolution(mut self, azimuth_step: f32, elevation_step: f32) -> Self {
        self.azimuth_step = azimuth_step;
        self.elevation_step = elevation_step;
        self
    }

    /// Try to build a [`Binauraliser`].
    ///
    /// This fails on an invalid sample rate, a frame size that is not a
    /// multiple of the hop size, or an HRTF set that cannot be loaded.
    pub fn build(self) -> Result<Binauraliser> {
        let sample_rate = match self.sample_rate.is_normal() && self.sample_rate.is_sign_positive()
        {
            true => self.sample_rate,
            false => return Err(Error::InvalidSampleRate(self.sample_rate)),
        };
        if self.hop_size == 0 {
            return Err(Error::InvalidHopSize(self.hop_size));
        }

        let num_sources = self.num_sources.clamp(1, MAX_NUM_SOURCES);
        let tf = TfAdapter::<Stft>::new(self.hop_size, self.frame_size, 2 * num_sources, 2)?;
        let band_freqs = tf.engine().band_frequencies(sample_rate);
        let nbands = band_freqs.len();

        let params = Arc::new(BinauraliserParams::new(
            num_sources,
            CodecConfig {
                sample_rate,
                band_freqs,
                azimuth_step: self.azimuth_step,
                elevation_step: self.elevation_step,
                panner: self.panner,
            },
        ));

        let interp = match self.hrtf_set {
            Some(set) => params.build_tables(set)?,
            None => params.build_default_tables()?,
        };
        params.lifecycle.begin_init();
        params.lifecycle.end_init(true);

        let zero = [Complex::zero(); 2];
        let mut binauraliser = Binauraliser {
            params,
            frame_size: self.frame_size,
            sample_rate,
            num_sources,
            tf,
            interp: Some(interp),
            prev: vec![zero; MAX_NUM_SOURCES * nbands],
            cur: vec![zero; MAX_NUM_SOURCES * nbands],
            near_field: vec![Default::default(); MAX_NUM_SOURCES],
            source_frame: vec![vec![0.0; self.frame_size]; 2 * MAX_NUM_SOURCES],
            zeros: vec![0.0; self.frame_size],
        };

        binauraliser.params.gate.ensure_ready(|_: Dirty| {});
        binauraliser.recompute();
        binauraliser.settle();

        Ok(binauraliser)
    }
}

pub struct Binauraliser {
    params: Arc<BinauraliserParams>,
    frame_size: usize,
    sample_rate: f32,
    /// source count the buffers are configured for
    num_sources: usize,
    tf: TfAdapter<Stft>,
    interp: Option<HrtfInterpolator>,
    /// `[source][band]` filters of the previous and the current frame
    prev: Vec<[Complex<f32>; 2]>,
    cur: Vec<[Complex<f32>; 2]>,
    near_field: Vec<[NearFieldFilter; 2]>,
    /// near-field filtered input, `[source * 2 + ear][sample]`
    source_frame: Vec<Vec<f32>>,
    zeros: Vec<f32>,
}

impl Binauraliser {
    pub fn builder() -> BinauraliserBuilder {
        BinauraliserBuilder::new()
    }

    pub fn params(&self) -> Arc<BinauraliserParams> {
        self.params.clone()
    }

    /// Delay in samples between input and output.
    pub fn latency(&self) -> usize {
        self.tf.delay()
    }

    pub fn num_bands(&self) -> usize {
        self.tf.num_bands()
    }

    fn settle(&mut self) {
        self.prev.copy_from_slice(&self.cur);
    }

    /// Rebuild per source filters from the current parameters.
    fn recompute(&mut self) {
        let params = &self.params;
        let Some(interp) = self.interp.as_ref() else {
            return;
        };
        let nbands = interp.num_bands();

        let num_sources = params.num_sources();
        let resized = num_sources != self.num_sources;
        if resized {
            if let Err(e) = self.tf.reconfigure(2 * num_sources, 2) {
                error!("could not resize the filterbank: {e}");
                return;
            }
            self.num_sources = num_sources;
            self.near_field
                .iter_mut()
                .flatten()
                .for_each(|f| f.reset());
        }

        let head = params.rotation().then(|| {
            let order = match params.roll_pitch_yaw() {
                true => EulerOrder::RollPitchYaw,
                false => EulerOrder::YawPitchRoll,
            };
            transpose(&euler_to_rotation(
                params.yaw.load().to_radians(),
                params.pitch.load().to_radians(),
                params.roll.load().to_radians(),
                order,
            ))
        });
        let near_field = params.near_field();

        for src in 0..num_sources {
            let (mut az, mut el) = (params.azimuth[src].load(), params.elevation[src].load());

            if let Some(head) = head.as_ref() {
                let v = rotate(head, unit_vector(az, el));
                az = v[1].atan2(v[0]).to_degrees();
                el = v[2].clamp(-1.0, 1.0).asin().to_degrees();
            }

            interp.interpolate(az, el, &mut self.cur[src * nbands..(src + 1) * nbands]);

            let coeffs = match near_field {
                true => DvfCoeffs::for_source(az, el, params.distance[src].load(), self.sample_rate),
                false => None,
            }
            .unwrap_or([DvfCoeffs::IDENTITY; 2]);

            for (filter, coeffs) in Iterator::zip(self.near_field[src].iter_mut(), coeffs) {
                filter.set_coeffs(coeffs);
            }
        }

        if resized {
            self.prev.copy_from_slice(&self.cur);
        }

        debug!(num_sources, near_field, "binaural filters updated");
    }

    fn render<I, O>(&mut self, inputs: &[I], outputs: &mut [O]) -> Result<()>
    where
        I: AsRef<[f32]>,
        O: AsMut<[f32]>,
    {
        let n = self.num_sources;

        for src in 0..n {
            let x = inputs
                .get(src)
                .and_then(|x| x.as_ref().get(..self.frame_size))
                .unwrap_or(&self.zeros[..]);

            for (ear, filter) in self.near_field[src].iter_mut().enumerate() {
                filter.process(x, &mut self.source_frame[2 * src + ear]);
            }
        }

        self.tf.forward(&self.source_frame[..2 * n])?;

        let (input, output) = self.tf.spectra_mut();
        output.clear();

        let nbands = input.bands();
        let slots = input.slots();
        let scale = 1.0 / (n as f32).sqrt();

        for src in 0..n {
            for band in 0..nbands {
                let prev = self.prev[src * nbands + band];
                let cur = self.cur[src * nbands + band];

                for ear in [LEFT, RIGHT] {
                    let x = input.slots_of(band, 2 * src + ear);
                    let y = output.slots_of_mut(band, ear);

                    for (t, (y, x)) in Iterator::zip(y.iter_mut(), x.iter()).enumerate() {
                        let w = (t + 1) as f32 / slots as f32;
                        let h = prev[ear] * (1.0 - w) + cur[ear] * w;
                        *y += h * x * scale;
                    }
                }
            }
        }

        let len = n * nbands;
        self.prev[..len].copy_from_slice(&self.cur[..len]);

        self.tf.backward(outputs)
    }
}

impl FrameProcessor for Binauraliser {
    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn num_inputs(&self) -> usize {
        MAX_NUM_SOURCES
    }

    fn num_outputs(&self) -> usize {
        2
    }

    fn is_ready(&self) -> bool {
        self.params.codec_status() == CodecStatus::Initialised
    }

    fn process<I, O>(&mut self, inputs: &[I], outputs: &mut [O], n_samples: usize, playing: bool)
    where
        I: AsRef<[f32]>,
        O: AsMut<[f32]>,
    {
        if n_samples != self.frame_size || !playing {
            silence(outputs, n_samples);
            return;
        }

        let params = self.params.clone();
        let Some(_guard) = params.lifecycle.begin_processing() else {
            silence(outputs, n_samples);
            return;
        };

        if let Some(interp) = params.pending.try_take() {
            self.interp = Some(interp);
            params.gate.mark_dirty(Dirty);
        }

        if params.gate.ensure_ready(|_: Dirty| {}) {
            self.recompute();
        }

        if self.interp.is_none() {
            silence(outputs, n_samples);
            return;
        }

        if let Err(e) = self.render(inputs, outputs) {
            error!("binaural rendering failed: {e}");
            silence(outputs, n_samples);
        }
    }
}
