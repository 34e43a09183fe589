//! Multichannel FIR convolution, one hop at a time.
//!
//! Two algorithms are available:
//!
//! - uniformly partitioned overlap-save: the filter is split into blocks of
//!   the hop size and the input spectra are kept in a frequency domain delay
//!   line. For more details about the algorithm check Chapter 5 of
//!   Partitioned convolution algorithms for real-time auralization: [`Book`]
//! - a single FFT covering the whole filter, with overlap-add of the tail.
//!
//! Both have zero latency relative to the hop.
//!
//! [`Book`]: https://publications.rwth-aachen.de/record/466561/files/466561.pdf

use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::num_traits::Zero;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};

use crate::error::{Error, Result};

const DEFAULT_SAMPLE_RATE: f32 = 48000.0;

/// FIR filters, one per channel, all of the same length.
#[derive(Clone, Debug)]
pub struct FilterSet {
    /// `[channel][tap]`
    taps: Box<[f32]>,
    filter_len: usize,
    channels: usize,
    sample_rate: f32,
}

impl FilterSet {
    /// Build a set from channel major `taps`.
    pub fn new(taps: Vec<f32>, filter_len: usize, channels: usize, sample_rate: f32) -> Result<Self> {
        if !(sample_rate.is_normal() && sample_rate.is_sign_positive()) {
            return Err(Error::InvalidSampleRate(sample_rate));
        }
        if filter_len == 0 || channels == 0 {
            return Err(Error::InvalidFilterSet("empty filter set"));
        }
        if taps.len() != filter_len * channels {
            return Err(Error::InvalidFilterSet("tap count does not match channels"));
        }
        if taps.iter().any(|v| !v.is_finite()) {
            return Err(Error::InvalidFilterSet("non finite taps"));
        }

        Ok(Self {
            taps: taps.into_boxed_slice(),
            filter_len,
            channels,
            sample_rate,
        })
    }

    /// Build a set from per channel filters, zero padding shorter ones.
    pub fn from_channels<T: AsRef<[f32]>>(filters: &[T], sample_rate: f32) -> Result<Self> {
        let filter_len = filters.iter().map(|f| f.as_ref().len()).max().unwrap_or(0);
        let mut taps = vec![0.0; filter_len * filters.len()];

        for (src, dst) in Iterator::zip(filters.iter(), taps.chunks_exact_mut(filter_len.max(1))) {
            let src = src.as_ref();
            dst[..src.len()].copy_from_slice(src);
        }

        Self::new(taps, filter_len, filters.len(), sample_rate)
    }

    pub fn filter_len(&self) -> usize {
        self.filter_len
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn channel(&self, ch: usize) -> &[f32] {
        &self.taps[ch * self.filter_len..(ch + 1) * self.filter_len]
    }
}

impl Default for FilterSet {
    /// A single channel unit impulse.
    fn default() -> Self {
        Self {
            taps: vec![1.0].into_boxed_slice(),
            filter_len: 1,
            channels: 1,
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}

#[derive(Clone, Debug)]
struct Channel {
    /// impulse response split into partition blocks
    h: Box<[Complex<f32>]>,
    /// input blocks frequency domain delay line, partitioned only
    x_fdl: Box<[Complex<f32>]>,
    /// input blocks time domain delay line when partitioned, overlap-add
    /// tail otherwise
    x_tdl: Box<[f32]>,
}

impl Channel {
    fn new(fft_len: usize, spectra_len: usize, partitions: usize, partitioned: bool) -> Self {
        let zero = Complex::zero();
        let fdl_len = match partitioned {
            true => spectra_len * partitions,
            false => 0,
        };

        Channel {
            h: vec![zero; spectra_len * partitions].into_boxed_slice(),
            x_fdl: vec![zero; fdl_len].into_boxed_slice(),
            x_tdl: vec![0.0; fft_len].into_boxed_slice(),
        }
    }

    fn reset(&mut self) {
        self.x_tdl.fill(0.0);
        self.x_fdl.fill(Complex::zero());
    }
}

#[must_use]
pub struct ConvolverBuilder {
    hop_size: usize,
    partitioned: bool,
}

impl ConvolverBuilder {
    fn new(hop_size: usize) -> ConvolverBuilder {
        ConvolverBuilder {
            hop_size,
            partitioned: true,
        }
    }

    /// Use uniformly partitioned convolution. Default value is true.
    pub fn with_partitioned(mut self, partitioned: bool) -> Self {
        self.partitioned = partitioned;
        self
    }

    /// Try to build a [`Convolver`] running `filters`.
    ///
    /// This will fail if the hop size is zero.
    pub fn build(self, filters: &FilterSet) -> Result<Convolver> {
        if self.hop_size == 0 {
            return Err(Error::InvalidHopSize(self.hop_size));
        }

        let hop = self.hop_size;
        let filter_len = filters.filter_len();

        let (fft_len, partitions) = match self.partitioned {
            true => (hop * 2, (filter_len + hop - 1) / hop),
            false => ((hop + filter_len - 1).next_power_of_two().max(2), 1),
        };
        let block_len = match self.partitioned {
            true => hop,
            false => filter_len,
        };
        let spectra_len = fft_len / 2 + 1;

        let mut planner = RealFftPlanner::<f32>::new();
        let rfft = planner.plan_fft_forward(fft_len);
        let ifft = planner.plan_fft_inverse(fft_len);

        let mut state = State {
            rfft_scratch: rfft.make_scratch_vec(),
            ifft_scratch: ifft.make_scratch_vec(),
            rfft,
            ifft,
            fft_len,
            hop_size: hop,
            block_len,
            partitions,
            partitioned: self.partitioned,
            scratch: vec![0.0; fft_len].into_boxed_slice(),
            acc: vec![Complex::zero(); spectra_len].into_boxed_slice(),
        };

        let channels = (0..filters.channels())
            .map(|ch| {
                let mut channel = Channel::new(fft_len, spectra_len, partitions, self.partitioned);
                state.filt_split(filters.channel(ch), &mut channel.h)?;
                Ok(channel)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Convolver {
            state,
            channels,
            filter_len,
        })
    }
}

#[derive(Clone)]
pub struct Convolver {
    /// common state
    state: State,
    /// per channel data
    channels: Vec<Channel>,
    filter_len: usize,
}

impl Convolver {
    /// Get default [`convolver builder`](crate::conv::ConvolverBuilder)
    pub fn builder(hop_size: usize) -> ConvolverBuilder {
        ConvolverBuilder::new(hop_size)
    }

    pub fn hop_size(&self) -> usize {
        self.state.hop_size
    }

    pub fn channels(&self) -> usize {
        self.channels.len()
    }

    pub fn filter_len(&self) -> usize {
        self.filter_len
    }

    pub fn is_partitioned(&self) -> bool {
        self.state.partitioned
    }

    /// Processing delay in samples, always zero.
    pub fn latency(&self) -> usize {
        0
    }

    /// Convolve each input channel with its filter.
    ///
    /// The length of every block must be a multiple of the hop size. All
    /// channels are checked before any is processed, so on error no channel
    /// state has advanced. Inputs missing for a channel are treated as
    /// silence, extra outputs are left untouched.
    pub fn process_block<I, O>(&mut self, inputs: &[I], outputs: &mut [O]) -> Result<()>
    where
        I: AsRef<[f32]>,
        O: AsMut<[f32]>,
    {
        let hop = self.state.hop_size;

        for (ch, y) in outputs.iter_mut().enumerate().take(self.channels.len()) {
            let len = y.as_mut().len();
            if usize::rem_euclid(len, hop) != 0 {
                return Err(Error::InvalidInputOutputLen(len, hop));
            }
            match inputs.get(ch).map(|x| x.as_ref().len()) {
                Some(n) if n != len => return Err(Error::InvalidInputOutputLen(n, len)),
                _ => (),
            }
        }

        for (ch, (channel, y)) in Iterator::zip(self.channels.iter_mut(), outputs.iter_mut()).enumerate() {
            let x = inputs.get(ch).map(|x| x.as_ref());
            self.state.conv(channel, x, y.as_mut())?;
        }

        Ok(())
    }

    /// Reset all internals buffers
    pub fn reset(&mut self) {
        self.channels.iter_mut().for_each(Channel::reset);
    }
}

#[derive(Clone)]
struct State {
    /// Input block length in samples
    hop_size: usize,
    /// Filter block length, the hop when partitioned, the whole filter
    /// otherwise
    block_len: usize,
    /// Number of filter partitions
    partitions: usize,
    partitioned: bool,
    /// FFT size
    fft_len: usize,
    /// Real FFT module
    rfft: Arc<dyn RealToComplex<f32>>,
    /// Inverse FFT module
    ifft: Arc<dyn ComplexToReal<f32>>,
    /// RFFT scratch memory
    rfft_scratch: Vec<Complex<f32>>,
    /// IFFT scratch memory
    ifft_scratch: Vec<Complex<f32>>,
    /// mutable internal scratch for fft input
    scratch: Box<[f32]>,
    /// accumulator for point wise multiplication
    acc: Box<[Complex<f32>]>,
}

impl State {
    fn conv(&mut self, channel: &mut Channel, x: Option<&[f32]>, y: &mut [f32]) -> Result<()> {
        let hop = self.hop_size;
        let mut off = 0;

        while off < y.len() {
            let x = x.map(|x| &x[off..off + hop]);
            let y = &mut y[off..off + hop];

            match self.partitioned {
                true => self.conv_partitioned(channel, x, y)?,
                false => self.conv_full(channel, x, y)?,
            }

            off += hop;
        }

        Ok(())
    }

    fn conv_partitioned(&mut self, channel: &mut Channel, x: Option<&[f32]>, y: &mut [f32]) -> Result<()> {
        let bins = self.fft_len / 2 + 1;
        let hop = self.hop_size;

        // sliding window over the two most recent input blocks
        channel.x_tdl.copy_within(hop.., 0);
        let newest = &mut channel.x_tdl[hop..];
        match x {
            Some(x) => newest.copy_from_slice(x),
            None => newest.fill(0.0),
        }

        // older spectra age by one slot, the window's spectrum lands in slot 0
        channel.x_fdl.rotate_right(bins);
        self.scratch.copy_from_slice(&channel.x_tdl);
        self.rfft.process_with_scratch(
            &mut self.scratch,
            &mut channel.x_fdl[..bins],
            &mut self.rfft_scratch,
        )?;

        // slot k meets filter partition k
        self.acc.fill(Complex::zero());
        let slots = Iterator::zip(channel.x_fdl.chunks_exact(bins), channel.h.chunks_exact(bins));
        for (xs, hs) in slots.take(self.partitions) {
            for (acc, (x, h)) in Iterator::zip(self.acc.iter_mut(), Iterator::zip(xs.iter(), hs)) {
                *acc += x * h;
            }
        }

        self.inverse()?;

        // overlap-save, only the second half is free of circular wrap
        let scale = self.fft_len as f32;
        for (y, s) in Iterator::zip(y.iter_mut(), self.scratch[hop..].iter()) {
            *y = s / scale;
        }

        Ok(())
    }

    fn conv_full(&mut self, channel: &mut Channel, x: Option<&[f32]>, y: &mut [f32]) -> Result<()> {
        let hop = self.hop_size;
        let scale = self.fft_len as f32;

        match x {
            Some(x) => self.scratch[..hop].copy_from_slice(x),
            None => self.scratch[..hop].fill(0.0),
        }
        self.scratch[hop..].fill(0.0);

        self.rfft
            .process_with_scratch(&mut self.scratch, &mut self.acc, &mut self.rfft_scratch)?;

        for (acc, h) in Iterator::zip(self.acc.iter_mut(), channel.h.iter()) {
            *acc *= h;
        }

        self.inverse()?;

        // overlap-add with the tail of previous blocks, then advance the tail
        let tail = &mut channel.x_tdl;
        for (n, y) in y.iter_mut().enumerate() {
            *y = tail[n] + self.scratch[n] / scale;
        }

        tail.copy_within(hop.., 0);
        let kept = self.fft_len - hop;
        tail[kept..].fill(0.0);
        for (t, s) in Iterator::zip(tail[..kept].iter_mut(), self.scratch[hop..].iter()) {
            *t += s / scale;
        }

        Ok(())
    }

    fn inverse(&mut self) -> Result<()> {
        // the imaginary parts of DC and Nyquist must be zero for a real signal
        self.acc[0].im = 0.0;
        if let Some(last) = self.acc.last_mut() {
            last.im = 0.0;
        }

        self.ifft
            .process_with_scratch(&mut self.acc, &mut self.scratch, &mut self.ifft_scratch)?;
        Ok(())
    }

    fn filt_split(&mut self, taps: &[f32], h: &mut [Complex<f32>]) -> Result<()> {
        let spectra_len = self.fft_len / 2 + 1;
        assert!(taps.len() <= self.block_len * self.partitions);

        for (p, partition) in taps.chunks(self.block_len).enumerate() {
            self.scratch[..partition.len()].copy_from_slice(partition);
            self.scratch[partition.len()..].fill(0.0);

            let off = p * spectra_len;
            self.rfft.process_with_scratch(
                &mut self.scratch,
                &mut h[off..off + spectra_len],
                &mut self.rfft_scratch,
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::Rng;

    fn convolve_from_definition(x: Vec<f32>, h: Vec<f32>) -> Vec<f32> {
        let mut x_neg_terms = vec![0.0; h.len() - 1];
        x_neg_terms.extend(x.clone());

        (0..x.len())
            .map(|i| {
                Iterator::zip(x_neg_terms.iter().skip(i), h.iter().rev())
                    .map(|(x, h)| x * h)
                    .fold(0.0, |acc, x| acc + x)
            })
            .collect::<Vec<_>>()
    }

    fn random(len: usize) -> Vec<f32> {
        let mut rng = rand::thread_rng();
        (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    #[must_use]
    struct ConvTest {
        filter_len: usize,
        input_len: usize,
        hop_size: usize,
        channels: usize,
    }

    impl Default for ConvTest {
        fn default() -> Self {
            Self {
                filter_len: 256,
                input_len: 128,
                hop_size: 64,
                channels: 2,
            }
        }
    }

    impl ConvTest {
        fn filter_len(mut self, filter_len: usize) -> Self {
            self.filter_len = filter_len;
            self
        }

        fn hop_size(mut self, hop_size: usize) -> Self {
            self.hop_size = hop_size;
            self
        }

        fn input_len(mut self, input_len: usize) -> Self {
            self.input_len = input_len;
            self
        }

        fn run(&self) {
            let filters = (0..self.channels)
                .map(|_| random(self.filter_len))
                .collect::<Vec<_>>();
            let set = FilterSet::from_channels(&filters, 48000.0).expect("filter set");
            let input = (0..self.channels)
                .map(|_| random(self.input_len))
                .collect::<Vec<_>>();

            for partitioned in [true, false] {
                let mut convolver = Convolver::builder(self.hop_size)
                    .with_partitioned(partitioned)
                    .build(&set)
                    .expect("convolver");

                // feed one hop at a time
                let mut output = vec![vec![0.0; self.input_len]; self.channels];
                let mut off = 0;
                while off < self.input_len {
                    let x = input
                        .iter()
                        .map(|x| &x[off..off + self.hop_size])
                        .collect::<Vec<_>>();
                    let mut y = output
                        .iter_mut()
                        .map(|y| &mut y[off..off + self.hop_size])
                        .collect::<Vec<_>>();

                    convolver.process_block(&x, &mut y).expect("convolve block");
                    off += self.hop_size;
                }

                for ch in 0..self.channels {
                    let expected = convolve_from_definition(input[ch].clone(), filters[ch].clone());
                    for (a, b) in std::iter::zip(expected.iter(), output[ch].iter()) {
                        assert_approx_eq!(a, b, 1e-3);
                    }
                }
            }
        }
    }

    #[test]
    fn conv_default() {
        ConvTest::default().run();
    }

    #[test]
    fn conv_long_kernel() {
        ConvTest::default()
            .filter_len(4096)
            .input_len(256)
            .hop_size(64)
            .run();
    }

    #[test]
    fn conv_short_kernel() {
        ConvTest::default()
            .filter_len(16)
            .input_len(256)
            .hop_size(4)
            .run();
    }

    #[test]
    fn conv_kernel_and_block_same_length() {
        ConvTest::default()
            .filter_len(16)
            .input_len(96)
            .hop_size(16)
            .run();
    }

    #[test]
    fn conv_odd_kernel() {
        ConvTest::default()
            .filter_len(1025)
            .input_len(256)
            .hop_size(16)
            .run();
    }

    #[test]
    fn conv_even_kernel() {
        ConvTest::default()
            .filter_len(100)
            .input_len(32)
            .hop_size(32)
            .run();
    }

    #[test]
    fn unit_impulse_reproduces_input() {
        let set = FilterSet::default();
        let x = random(256);

        for partitioned in [true, false] {
            let mut convolver = Convolver::builder(64)
                .with_partitioned(partitioned)
                .build(&set)
                .unwrap();
            assert_eq!(convolver.latency(), 0);

            let mut y = vec![0.0; 256];
            convolver.process_block(&[&x], &mut [&mut y]).unwrap();

            for (a, b) in Iterator::zip(x.iter(), y.iter()) {
                assert_approx_eq!(a, b, 1e-5);
            }
        }
    }

    #[test]
    fn reset_clears_history() {
        let set = FilterSet::from_channels(&[random(300)], 48000.0).unwrap();
        let x = random(64);

        for partitioned in [true, false] {
            let mut convolver = Convolver::builder(64)
                .with_partitioned(partitioned)
                .build(&set)
                .unwrap();

            let mut first = vec![0.0; 64];
            convolver.process_block(&[&x], &mut [&mut first]).unwrap();
            let mut tail = vec![0.0; 64];
            convolver.process_block(&[&x], &mut [&mut tail]).unwrap();
            assert_ne!(first, tail);

            convolver.reset();
            let mut again = vec![0.0; 64];
            convolver.process_block(&[&x], &mut [&mut again]).unwrap();
            for (a, b) in Iterator::zip(first.iter(), again.iter()) {
                assert_approx_eq!(a, b, 1e-6);
            }
        }
    }

    #[test]
    fn invalid_lengths() {
        let set = FilterSet::default();
        assert!(Convolver::builder(0).build(&set).is_err());

        let mut convolver = Convolver::builder(64).build(&set).unwrap();
        let x = vec![0.0; 100];
        let mut y = vec![0.0; 100];
        assert!(convolver.process_block(&[&x], &mut [&mut y]).is_err());

        let x = vec![0.0; 64];
        let mut y = vec![0.0; 128];
        assert!(convolver.process_block(&[&x], &mut [&mut y]).is_err());
    }

    #[test]
    fn rejected_block_leaves_every_channel_untouched() {
        let set = FilterSet::from_channels(&[random(200), random(200)], 48000.0).unwrap();
        let (a, b) = (random(64), random(64));

        for partitioned in [true, false] {
            let build = || {
                Convolver::builder(64)
                    .with_partitioned(partitioned)
                    .build(&set)
                    .unwrap()
            };
            let (mut convolver, mut fresh) = (build(), build());

            // the first channel is valid, the second is not
            let short = vec![1.0; 32];
            let mut y = vec![vec![0.0; 64]; 2];
            assert!(convolver.process_block(&[&a, &short], &mut y).is_err());

            let mut expected = vec![vec![0.0; 64]; 2];
            fresh.process_block(&[&a, &b], &mut expected).unwrap();
            convolver.process_block(&[&a, &b], &mut y).unwrap();

            for ch in 0..2 {
                for (x, y) in Iterator::zip(expected[ch].iter(), y[ch].iter()) {
                    assert_approx_eq!(x, y, 1e-6);
                }
            }
        }
    }

    #[test]
    fn filter_set_validation() {
        assert!(FilterSet::new(vec![0.0; 8], 4, 2, 48000.0).is_ok());
        assert!(FilterSet::new(vec![0.0; 7], 4, 2, 48000.0).is_err());
        assert!(FilterSet::new(vec![0.0; 8], 4, 2, 0.0).is_err());
        assert!(FilterSet::new(vec![f32::NAN; 8], 4, 2, 48000.0).is_err());

        let set = FilterSet::from_channels(&[vec![1.0, 2.0], vec![3.0]], 44100.0).unwrap();
        assert_eq!(set.filter_len(), 2);
        assert_eq!(set.channel(1), &[3.0, 0.0]);
    }
}
