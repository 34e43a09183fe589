//! Time-frequency transform.
//!
//! [`TransformEngine`] is the narrow interface to a hop based filterbank.
//! [`Stft`] is the built in engine: a 50% overlapped, sine windowed real FFT
//! giving `hop + 1` uniformly spaced bands with perfect reconstruction and a
//! delay of one hop.
//!
//! [`TfAdapter`] owns the spectral buffers of one component and moves whole
//! frames (several hops) between the time domain and a
//! [`SpectralFrame`](crate::buffer::SpectralFrame).

use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::num_traits::Zero;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use tracing::debug;

use crate::buffer::SpectralFrame;
use crate::error::{Error, Result};

/// Band spacing of a transform engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BandLayout {
    /// Bands evenly spaced from DC to Nyquist.
    Uniform,
    /// Uniform bands with the lowest ones further split for finer
    /// resolution near DC.
    Hybrid,
}

/// Interface of a hop based analysis/synthesis filterbank.
pub trait TransformEngine: Send {
    /// Create an engine for the given hop and channel counts.
    fn create(hop_size: usize, inputs: usize, outputs: usize) -> Result<Self>
    where
        Self: Sized;

    fn hop_size(&self) -> usize;

    fn num_bands(&self) -> usize;

    fn band_layout(&self) -> BandLayout;

    /// Centre frequency of every band in Hz.
    fn band_frequencies(&self, sample_rate: f32) -> Vec<f32>;

    /// Analysis to synthesis delay in samples.
    fn delay(&self) -> usize;

    fn channels(&self) -> (usize, usize);

    /// Change channel counts in place. Returns `false` if the engine cannot
    /// and has to be recreated.
    fn resize(&mut self, inputs: usize, outputs: usize) -> bool;

    /// Reset all internal state to silence.
    fn clear(&mut self);

    /// Analyse one hop of input channel `ch` into `bands`.
    fn forward_hop(&mut self, ch: usize, input: &[f32], bands: &mut [Complex<f32>]) -> Result<()>;

    /// Synthesise one hop of output channel `ch` from `bands`.
    ///
    /// `bands` is used as scratch and is clobbered.
    fn backward_hop(&mut self, ch: usize, bands: &mut [Complex<f32>], output: &mut [f32])
        -> Result<()>;
}

/// Sine windowed STFT with 50% overlap.
pub struct Stft {
    hop_size: usize,
    window: Box<[f32]>,
    /// previous input hop per analysis channel
    history: Vec<Box<[f32]>>,
    /// second half of the previous synthesis frame per output channel
    overlap: Vec<Box<[f32]>>,
    rfft: Arc<dyn RealToComplex<f32>>,
    ifft: Arc<dyn ComplexToReal<f32>>,
    rfft_scratch: Vec<Complex<f32>>,
    ifft_scratch: Vec<Complex<f32>>,
    time: Box<[f32]>,
}

impl Stft {
    fn fft_len(&self) -> usize {
        self.hop_size * 2
    }
}

impl TransformEngine for Stft {
    fn create(hop_size: usize, inputs: usize, outputs: usize) -> Result<Self> {
        if hop_size == 0 {
            return Err(Error::InvalidHopSize(hop_size));
        }

        let fft_len = hop_size * 2;

        let window = (0..fft_len)
            .map(|n| (std::f32::consts::PI * (n as f32 + 0.5) / fft_len as f32).sin())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let mut planner = RealFftPlanner::<f32>::new();
        let rfft = planner.plan_fft_forward(fft_len);
        let ifft = planner.plan_fft_inverse(fft_len);

        let rfft_scratch = rfft.make_scratch_vec();
        let ifft_scratch = ifft.make_scratch_vec();

        Ok(Stft {
            hop_size,
            window,
            history: vec![vec![0.0; hop_size].into_boxed_slice(); inputs],
            overlap: vec![vec![0.0; hop_size].into_boxed_slice(); outputs],
            rfft,
            ifft,
            rfft_scratch,
            ifft_scratch,
            time: vec![0.0; fft_len].into_boxed_slice(),
        })
    }

    fn hop_size(&self) -> usize {
        self.hop_size
    }

    fn num_bands(&self) -> usize {
        self.hop_size + 1
    }

    fn band_layout(&self) -> BandLayout {
        BandLayout::Uniform
    }

    fn band_frequencies(&self, sample_rate: f32) -> Vec<f32> {
        let df = sample_rate / self.fft_len() as f32;
        (0..self.num_bands()).map(|k| k as f32 * df).collect()
    }

    fn delay(&self) -> usize {
        self.hop_size
    }

    fn channels(&self) -> (usize, usize) {
        (self.history.len(), self.overlap.len())
    }

    fn resize(&mut self, inputs: usize, outputs: usize) -> bool {
        let hop = self.hop_size;
        self.history
            .resize_with(inputs, || vec![0.0; hop].into_boxed_slice());
        self.overlap
            .resize_with(outputs, || vec![0.0; hop].into_boxed_slice());
        true
    }

    fn clear(&mut self) {
        self.history.iter_mut().for_each(|h| h.fill(0.0));
        self.overlap.iter_mut().for_each(|o| o.fill(0.0));
    }

    fn forward_hop(&mut self, ch: usize, input: &[f32], bands: &mut [Complex<f32>]) -> Result<()> {
        let hop = self.hop_size;
        let history = &mut self.history[ch];

        self.time[..hop].copy_from_slice(history);
        self.time[hop..].copy_from_slice(&input[..hop]);
        history.copy_from_slice(&input[..hop]);

        for (x, w) in Iterator::zip(self.time.iter_mut(), self.window.iter()) {
            *x *= w;
        }

        self.rfft
            .process_with_scratch(&mut self.time, bands, &mut self.rfft_scratch)?;

        Ok(())
    }

    fn backward_hop(
        &mut self,
        ch: usize,
        bands: &mut [Complex<f32>],
        output: &mut [f32],
    ) -> Result<()> {
        let hop = self.hop_size;
        let scale = 1.0 / self.fft_len() as f32;

        // DC and Nyquist are real for a real signal
        bands[0].im = 0.0;
        bands[hop].im = 0.0;

        self.ifft
            .process_with_scratch(bands, &mut self.time, &mut self.ifft_scratch)?;

        let overlap = &mut self.overlap[ch];
        for n in 0..hop {
            output[n] = self.time[n] * self.window[n] * scale + overlap[n];
            overlap[n] = self.time[hop + n] * self.window[hop + n] * scale;
        }

        Ok(())
    }
}

/// Frame level front end to a [`TransformEngine`].
pub struct TfAdapter<E: TransformEngine = Stft> {
    engine: E,
    frame_size: usize,
    /// analysis output, `[band][input channel][slot]`
    input: SpectralFrame,
    /// synthesis input, `[band][output channel][slot]`
    output: SpectralFrame,
    bands: Box<[Complex<f32>]>,
    zeros: Box<[f32]>,
}

impl<E: TransformEngine> TfAdapter<E> {
    pub fn new(hop_size: usize, frame_size: usize, inputs: usize, outputs: usize) -> Result<Self> {
        if hop_size == 0 || frame_size == 0 || frame_size % hop_size != 0 {
            return Err(Error::InvalidFrameSize(frame_size, hop_size));
        }

        let engine = E::create(hop_size, inputs, outputs)?;
        let slots = frame_size / hop_size;
        let nbands = engine.num_bands();

        Ok(Self {
            input: SpectralFrame::new(nbands, inputs, slots),
            output: SpectralFrame::new(nbands, outputs, slots),
            bands: vec![Complex::zero(); nbands].into_boxed_slice(),
            zeros: vec![0.0; hop_size].into_boxed_slice(),
            frame_size,
            engine,
        })
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn hop_size(&self) -> usize {
        self.engine.hop_size()
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn time_slots(&self) -> usize {
        self.frame_size / self.engine.hop_size()
    }

    pub fn num_bands(&self) -> usize {
        self.engine.num_bands()
    }

    pub fn delay(&self) -> usize {
        self.engine.delay()
    }

    pub fn channels(&self) -> (usize, usize) {
        (self.input.channels(), self.output.channels())
    }

    pub fn input(&self) -> &SpectralFrame {
        &self.input
    }

    pub fn output_mut(&mut self) -> &mut SpectralFrame {
        &mut self.output
    }

    /// Analysis result and synthesis buffer at once.
    pub fn spectra_mut(&mut self) -> (&SpectralFrame, &mut SpectralFrame) {
        (&self.input, &mut self.output)
    }

    /// Change channel counts.
    ///
    /// Resizes the engine in place when it supports it, otherwise recreates
    /// it. Either way every buffer is silent afterwards.
    pub fn reconfigure(&mut self, inputs: usize, outputs: usize) -> Result<()> {
        if (inputs, outputs) == self.channels() && (inputs, outputs) == self.engine.channels() {
            return Ok(());
        }

        if !self.engine.resize(inputs, outputs) {
            debug!(inputs, outputs, "recreating transform engine");
            self.engine = E::create(self.engine.hop_size(), inputs, outputs)?;
        }

        self.input.resize_channels(inputs);
        self.output.resize_channels(outputs);
        self.clear();

        Ok(())
    }

    pub fn clear(&mut self) {
        self.engine.clear();
        self.input.clear();
        self.output.clear();
    }

    /// Analyse one frame into [`TfAdapter::input`].
    ///
    /// Channels missing from `frame` are analysed as silence.
    pub fn forward<I: AsRef<[f32]>>(&mut self, frame: &[I]) -> Result<()> {
        let hop = self.engine.hop_size();

        for slot in 0..self.time_slots() {
            let range = slot * hop..(slot + 1) * hop;

            for ch in 0..self.input.channels() {
                let x = match frame.get(ch) {
                    Some(x) if x.as_ref().len() >= range.end => &x.as_ref()[range.clone()],
                    _ => &self.zeros[..],
                };

                self.engine.forward_hop(ch, x, &mut self.bands)?;

                for (band, value) in self.bands.iter().enumerate() {
                    self.input.set(band, ch, slot, *value);
                }
            }
        }

        Ok(())
    }

    /// Synthesise one frame from [`TfAdapter::output_mut`] into `frame`.
    pub fn backward<O: AsMut<[f32]>>(&mut self, frame: &mut [O]) -> Result<()> {
        let hop = self.engine.hop_size();

        for slot in 0..self.time_slots() {
            let range = slot * hop..(slot + 1) * hop;

            for (ch, y) in frame.iter_mut().enumerate().take(self.output.channels()) {
                for (band, value) in self.bands.iter_mut().enumerate() {
                    *value = self.output.get(band, ch, slot);
                }

                self.engine
                    .backward_hop(ch, &mut self.bands, &mut y.as_mut()[range.clone()])?;
            }
        }

        for y in frame.iter_mut().skip(self.output.channels()) {
            y.as_mut().fill(0.0);
        }

        Ok(())
    }
}
