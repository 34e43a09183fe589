//! Multichannel convolver component.
//!
//! Channel `c` of the input is convolved with filter `c` of the loaded
//! [`FilterSet`]. Any change of filters, partitioning mode or host block size
//! throws the engine away; a fresh one is built at the top of the next
//! processing call. Without filters the input is passed through.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::conv::{Convolver, FilterSet};
use crate::error::{Error, Result};
use crate::fifo::{silence, FrameProcessor};
use crate::gate::{AtomicF32, Dirty, Gate};

pub const MAX_NUM_CHANNELS: usize = 64;

const DEFAULT_SAMPLE_RATE: f32 = 48000.0;
const DEFAULT_HOST_BLOCK_SIZE: usize = 128;

/// Shared parameter handle of a [`MultiConv`].
pub struct MultiConvParams {
    filters: Mutex<Option<Arc<FilterSet>>>,
    partitioned: AtomicBool,
    host_block_size: AtomicUsize,
    sample_rate: AtomicF32,
    gate: Gate,
}

impl MultiConvParams {
    /// Load a new filter set, one filter per channel.
    ///
    /// Sets with more than [`MAX_NUM_CHANNELS`] channels are rejected.
    pub fn set_filters(&self, filters: FilterSet) -> Result<()> {
        if filters.channels() > MAX_NUM_CHANNELS {
            return Err(Error::InvalidFilterSet("too many channels"));
        }

        *self.filters.lock() = Some(Arc::new(filters));
        self.gate.mark_dirty(Dirty);
        Ok(())
    }

    /// Unload the filters, the input is passed through afterwards.
    pub fn clear_filters(&self) {
        *self.filters.lock() = None;
        self.gate.mark_dirty(Dirty);
    }

    pub fn filters_loaded(&self) -> bool {
        self.filters.lock().is_some()
    }

    /// Number of channels of the loaded filter set, zero if none.
    pub fn num_channels(&self) -> usize {
        self.filters.lock().as_ref().map_or(0, |f| f.channels())
    }

    /// Length of the loaded filters in samples, zero if none.
    pub fn filter_len(&self) -> usize {
        self.filters.lock().as_ref().map_or(0, |f| f.filter_len())
    }

    pub fn set_partitioned(&self, partitioned: bool) {
        if self.partitioned.swap(partitioned, Ordering::SeqCst) != partitioned {
            self.gate.mark_dirty(Dirty);
        }
    }

    pub fn partitioned(&self) -> bool {
        self.partitioned.load(Ordering::SeqCst)
    }

    /// Set the block size the host calls the component with. Zero is
    /// ignored.
    pub fn set_host_block_size(&self, block_size: usize) {
        if block_size == 0 {
            warn!("ignoring zero host block size");
            return;
        }
        if self.host_block_size.swap(block_size, Ordering::SeqCst) != block_size {
            self.gate.mark_dirty(Dirty);
        }
    }

    pub fn host_block_size(&self) -> usize {
        self.host_block_size.load(Ordering::SeqCst)
    }

    pub fn set_sample_rate(&self, sample_rate: f32) {
        if !(sample_rate.is_normal() && sample_rate.is_sign_positive()) {
            warn!("ignoring invalid sample rate {sample_rate}");
            return;
        }
        self.sample_rate.store(sample_rate);
        self.gate.mark_dirty(Dirty);
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate.load()
    }
}

#[must_use]
pub struct MultiConvBuilder {
    sample_rate: f32,
    host_block_size: usize,
    partitioned: bool,
    filters: Option<FilterSet>,
}

impl MultiConvBuilder {
    fn new() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            host_block_size: DEFAULT_HOST_BLOCK_SIZE,
            partitioned: true,
            filters: None,
        }
    }

    /// Host sample rate. Default value is 48000.
    pub fn with_sample_rate(mut self, sample_rate: f32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Default value is 128.
    pub fn with_host_block_size(mut self, block_size: usize) -> Self {
        self.host_block_size = block_size;
        self
    }

    /// Default value is true.
    pub fn with_partitioned(mut self, partitioned: bool) -> Self {
        self.partitioned = partitioned;
        self
    }

    pub fn with_filters(mut self, filters: FilterSet) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn build(self) -> Result<MultiConv> {
        if !(self.sample_rate.is_normal() && self.sample_rate.is_sign_positive()) {
            return Err(Error::InvalidSampleRate(self.sample_rate));
        }
        if self.host_block_size == 0 {
            return Err(Error::InvalidHopSize(self.host_block_size));
        }

        let params = Arc::new(MultiConvParams {
            filters: Mutex::new(None),
            partitioned: AtomicBool::new(self.partitioned),
            host_block_size: AtomicUsize::new(self.host_block_size),
            sample_rate: AtomicF32::new(self.sample_rate),
            gate: Gate::dirty(Dirty),
        });

        if let Some(filters) = self.filters {
            params.set_filters(filters)?;
        }

        let mut multiconv = MultiConv {
            params,
            engine: None,
            block_size: self.host_block_size,
        };
        multiconv.params.gate.ensure_ready(|_: Dirty| {});
        multiconv.rebuild();

        Ok(multiconv)
    }
}

pub struct MultiConv {
    params: Arc<MultiConvParams>,
    engine: Option<Convolver>,
    block_size: usize,
}

impl MultiConv {
    pub fn builder() -> MultiConvBuilder {
        MultiConvBuilder::new()
    }

    pub fn params(&self) -> Arc<MultiConvParams> {
        self.params.clone()
    }

    /// Delay in samples between input and convolved output.
    pub fn processing_delay(&self) -> usize {
        self.engine.as_ref().map_or(0, Convolver::latency)
    }

    /// Number of channels convolved by the current engine, zero when passing
    /// through.
    pub fn num_channels(&self) -> usize {
        self.engine.as_ref().map_or(0, Convolver::channels)
    }

    pub fn reset(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.reset();
        }
    }

    fn rebuild(&mut self) {
        let Some(requested) = self.params.filters.try_lock().map(|f| f.clone()) else {
            // a setter holds the lock, retry on the next call
            self.params.gate.mark_dirty(Dirty);
            return;
        };

        self.block_size = self.params.host_block_size();
        self.engine = None;

        let Some(filters) = requested else {
            debug!("no filters loaded, passing input through");
            return;
        };

        let sample_rate = self.params.sample_rate();
        if filters.sample_rate() != sample_rate {
            warn!(
                "filter sample rate {} differs from host sample rate {sample_rate}",
                filters.sample_rate()
            );
        }

        match Convolver::builder(self.block_size)
            .with_partitioned(self.params.partitioned())
            .build(&filters)
        {
            Ok(engine) => {
                debug!(
                    "convolver rebuilt: {} channels, {} taps, block {}, partitioned {}",
                    engine.channels(),
                    engine.filter_len(),
                    self.block_size,
                    engine.is_partitioned()
                );
                self.engine = Some(engine);
            }
            Err(e) => error!("failed to build convolver: {e}"),
        }
    }
}

fn pass_through<I, O>(inputs: &[I], outputs: &mut [O], n_samples: usize)
where
    I: AsRef<[f32]>,
    O: AsMut<[f32]>,
{
    for (ch, out) in outputs.iter_mut().enumerate() {
        let out = out.as_mut();
        let out_len = out.len();
        let out = &mut out[..n_samples.min(out_len)];
        let x: &[f32] = match inputs.get(ch) {
            Some(x) => x.as_ref(),
            None => &[],
        };
        let n = x.len().min(out.len());
        out[..n].copy_from_slice(&x[..n]);
        out[n..].fill(0.0);
    }
}

impl FrameProcessor for MultiConv {
    /// The requested host block size, which the engine switches to on the
    /// next processing call.
    fn frame_size(&self) -> usize {
        self.params.host_block_size()
    }

    fn num_inputs(&self) -> usize {
        MAX_NUM_CHANNELS
    }

    fn num_outputs(&self) -> usize {
        MAX_NUM_CHANNELS
    }

    fn process<I, O>(&mut self, inputs: &[I], outputs: &mut [O], n_samples: usize, playing: bool)
    where
        I: AsRef<[f32]>,
        O: AsMut<[f32]>,
    {
        let params = self.params.clone();
        if params.gate.ensure_ready(|_: Dirty| {}) {
            self.rebuild();
        }

        if n_samples != self.block_size || !playing {
            silence(outputs, n_samples);
            return;
        }

        let Some(engine) = self.engine.as_mut() else {
            pass_through(inputs, outputs, n_samples);
            return;
        };

        match engine.process_block(inputs, outputs) {
            Ok(()) => {
                let used = engine.channels().min(outputs.len());
                silence(&mut outputs[used..], n_samples);
            }
            Err(e) => {
                error!("convolution failed: {e}");
                silence(outputs, n_samples);
            }
        }
    }
}
