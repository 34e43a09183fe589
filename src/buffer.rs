//! Owned, contiguous multi-channel buffers.
//!
//! [`Frame`] holds `channels x len` real samples and [`SpectralFrame`] holds
//! `bands x channels x slots` complex values. Both store their data in one
//! flat allocation and compute offsets in their accessors.

use realfft::num_complex::Complex;
use realfft::num_traits::Zero;

/// Time domain frame, channel major.
#[derive(Clone, Debug, Default)]
pub struct Frame {
    data: Box<[f32]>,
    channels: usize,
    len: usize,
}

impl Frame {
    pub fn new(channels: usize, len: usize) -> Self {
        Self {
            data: vec![0.0; channels * len].into_boxed_slice(),
            channels,
            len,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0 || self.channels == 0
    }

    pub fn channel(&self, ch: usize) -> &[f32] {
        &self.data[ch * self.len..(ch + 1) * self.len]
    }

    pub fn channel_mut(&mut self, ch: usize) -> &mut [f32] {
        &mut self.data[ch * self.len..(ch + 1) * self.len]
    }

    pub fn clear(&mut self) {
        self.data.fill(0.0);
    }

    /// Copy host channels into the frame.
    ///
    /// Channels missing from `input` and samples past the end of a shorter
    /// input channel are zeroed.
    pub fn fill_from<I: AsRef<[f32]>>(&mut self, input: &[I]) {
        let len = self.len;
        for (ch, dst) in self.data.chunks_exact_mut(len.max(1)).enumerate() {
            match input.get(ch) {
                Some(src) => {
                    let src = src.as_ref();
                    let n = src.len().min(len);
                    dst[..n].copy_from_slice(&src[..n]);
                    dst[n..].fill(0.0);
                }
                None => dst.fill(0.0),
            }
        }
    }

    /// Copy the frame into host channels, zeroing any extra output channels.
    ///
    /// At most `len` samples are written to each output channel.
    pub fn copy_to<O: AsMut<[f32]>>(&self, output: &mut [O]) {
        for (ch, dst) in output.iter_mut().enumerate() {
            let dst = dst.as_mut();
            let n = dst.len().min(self.len);
            if ch < self.channels {
                dst[..n].copy_from_slice(&self.channel(ch)[..n]);
            } else {
                dst[..n].fill(0.0);
            }
        }
    }
}

/// Time-frequency frame indexed as `[band][channel][slot]`.
#[derive(Clone, Debug, Default)]
pub struct SpectralFrame {
    data: Box<[Complex<f32>]>,
    bands: usize,
    channels: usize,
    slots: usize,
}

impl SpectralFrame {
    pub fn new(bands: usize, channels: usize, slots: usize) -> Self {
        Self {
            data: vec![Complex::zero(); bands * channels * slots].into_boxed_slice(),
            bands,
            channels,
            slots,
        }
    }

    pub fn bands(&self) -> usize {
        self.bands
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    #[inline]
    fn offset(&self, band: usize, ch: usize) -> usize {
        debug_assert!(band < self.bands && ch < self.channels);
        (band * self.channels + ch) * self.slots
    }

    /// All time slots of one band and channel.
    pub fn slots_of(&self, band: usize, ch: usize) -> &[Complex<f32>] {
        let off = self.offset(band, ch);
        &self.data[off..off + self.slots]
    }

    pub fn slots_of_mut(&mut self, band: usize, ch: usize) -> &mut [Complex<f32>] {
        let off = self.offset(band, ch);
        &mut self.data[off..off + self.slots]
    }

    pub fn get(&self, band: usize, ch: usize, slot: usize) -> Complex<f32> {
        self.data[self.offset(band, ch) + slot]
    }

    pub fn set(&mut self, band: usize, ch: usize, slot: usize, value: Complex<f32>) {
        let off = self.offset(band, ch) + slot;
        self.data[off] = value;
    }

    pub fn clear(&mut self) {
        self.data.fill(Complex::zero());
    }

    /// Change the channel count, keeping bands and slots. Contents are
    /// cleared.
    pub fn resize_channels(&mut self, channels: usize) {
        if channels != self.channels {
            self.data = vec![Complex::zero(); self.bands * channels * self.slots].into_boxed_slice();
            self.channels = channels;
        } else {
            self.clear();
        }
    }
}
