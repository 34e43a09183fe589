//! Host block to fixed frame adaptation.
//!
//! Components in this crate only process whole frames of a fixed size. The
//! [`Fifo`] sits between the host and a [`FrameProcessor`]: it accumulates
//! host blocks of any length into frames, runs the processor each time a
//! frame is complete, and hands processed samples back at the host's block
//! size. The output queue is primed with one frame of silence, so the
//! latency is exactly one frame. When the processor's frame size changes
//! the queues are rebuilt for the new size and re-primed.

use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use tracing::debug;

/// A component processing fixed size frames.
pub trait FrameProcessor {
    /// Number of samples per processing call.
    fn frame_size(&self) -> usize;

    fn num_inputs(&self) -> usize;

    fn num_outputs(&self) -> usize;

    /// `false` while the component is reinitialising.
    fn is_ready(&self) -> bool {
        true
    }

    /// Process one frame.
    ///
    /// If `n_samples` differs from [`FrameProcessor::frame_size`] or
    /// `playing` is `false`, outputs are silenced.
    fn process<I, O>(&mut self, inputs: &[I], outputs: &mut [O], n_samples: usize, playing: bool)
    where
        I: AsRef<[f32]>,
        O: AsMut<[f32]>;
}

/// Zero the first `n_samples` of every output channel.
pub(crate) fn silence<O: AsMut<[f32]>>(outputs: &mut [O], n_samples: usize) {
    for out in outputs.iter_mut() {
        let out = out.as_mut();
        let n = n_samples.min(out.len());
        out[..n].fill(0.0);
    }
}

pub struct Fifo {
    frame_size: usize,
    queued: usize,
    inputs: Vec<HeapRb<f32>>,
    outputs: Vec<HeapRb<f32>>,
    in_frame: Vec<Vec<f32>>,
    out_frame: Vec<Vec<f32>>,
}

impl Fifo {
    pub fn new(num_inputs: usize, num_outputs: usize, frame_size: usize) -> Self {
        let mut fifo = Self {
            frame_size,
            queued: 0,
            inputs: (0..num_inputs).map(|_| HeapRb::new(frame_size)).collect(),
            outputs: (0..num_outputs).map(|_| HeapRb::new(frame_size)).collect(),
            in_frame: vec![vec![0.0; frame_size]; num_inputs],
            out_frame: vec![vec![0.0; frame_size]; num_outputs],
        };
        fifo.reset();
        fifo
    }

    /// Create a FIFO sized for `processor`.
    pub fn for_processor<P: FrameProcessor>(processor: &P) -> Self {
        Self::new(
            processor.num_inputs(),
            processor.num_outputs(),
            processor.frame_size(),
        )
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Delay in samples between host input and host output.
    pub fn latency(&self) -> usize {
        self.frame_size
    }

    /// Drop all queued samples and re-prime the output with silence.
    pub fn reset(&mut self) {
        self.queued = 0;
        for rb in self.inputs.iter_mut() {
            rb.clear();
        }
        for rb in self.outputs.iter_mut() {
            rb.clear();
            for _ in 0..self.frame_size {
                let _ = rb.try_push(0.0);
            }
        }
    }

    /// Samples queued towards the next frame.
    pub fn pending(&self) -> usize {
        self.queued
    }

    pub fn frame_ready(&self) -> bool {
        self.pending() == self.frame_size
    }

    /// Queue up to `len` samples from `offset` of each host input channel.
    ///
    /// Missing host channels, and samples past the end of a short one, are
    /// queued as silence. Returns the number of samples queued, which is
    /// bounded by the room left in the current frame.
    pub fn push<I: AsRef<[f32]>>(&mut self, inputs: &[I], offset: usize, len: usize) -> usize {
        let take = len.min(self.frame_size - self.pending());

        for (ch, rb) in self.inputs.iter_mut().enumerate() {
            let src: &[f32] = match inputs.get(ch) {
                Some(src) => src.as_ref(),
                None => &[],
            };
            let src = &src[offset.min(src.len())..(offset + take).min(src.len())];
            rb.push_slice(src);
            for _ in src.len()..take {
                let _ = rb.try_push(0.0);
            }
        }

        self.queued += take;
        take
    }

    /// Drain up to `len` processed samples into `outputs` from `offset`.
    ///
    /// Extra host output channels are zeroed. Samples that do not fit a short
    /// host channel, or have no host channel at all, are dropped. Returns the
    /// number of samples drained.
    pub fn pop<O: AsMut<[f32]>>(&mut self, outputs: &mut [O], offset: usize, len: usize) -> usize {
        let avail = self
            .outputs
            .first()
            .map(|rb| rb.occupied_len())
            .unwrap_or(len);
        let take = len.min(avail);

        for (ch, dst) in outputs.iter_mut().enumerate() {
            let dst = dst.as_mut();
            let dst_len = dst.len();
            let dst = &mut dst[offset.min(dst_len)..(offset + take).min(dst_len)];
            match self.outputs.get_mut(ch) {
                Some(rb) => {
                    let n = rb.pop_slice(dst);
                    dst[n..].fill(0.0);
                    rb.skip(take - n);
                }
                None => dst.fill(0.0),
            }
        }
        for rb in self.outputs.iter_mut().skip(outputs.len()) {
            rb.skip(take);
        }

        take
    }

    /// Run `processor` on the completed input frame and queue its output.
    pub fn run_frame<P: FrameProcessor>(&mut self, processor: &mut P, playing: bool) {
        debug_assert!(self.frame_ready());

        for (rb, dst) in Iterator::zip(self.inputs.iter_mut(), self.in_frame.iter_mut()) {
            rb.pop_slice(dst);
        }
        self.queued = 0;

        processor.process(&self.in_frame, &mut self.out_frame, self.frame_size, playing);

        for (rb, src) in Iterator::zip(self.outputs.iter_mut(), self.out_frame.iter()) {
            rb.push_slice(src);
        }
    }

    /// Push a host block through `processor`.
    ///
    /// `n_samples` may be any length, zero or more frames are processed. If
    /// the processor is reinitialising the whole host output block is
    /// silenced while the queues keep cycling. A changed processor frame size
    /// rebuilds the queues first, which restarts the one frame latency.
    pub fn process_block<P, I, O>(
        &mut self,
        processor: &mut P,
        inputs: &[I],
        outputs: &mut [O],
        n_samples: usize,
        playing: bool,
    ) where
        P: FrameProcessor,
        I: AsRef<[f32]>,
        O: AsMut<[f32]>,
    {
        if processor.frame_size() != self.frame_size {
            debug!(
                from = self.frame_size,
                to = processor.frame_size(),
                "frame size changed, rebuilding queues"
            );
            *self = Self::for_processor(processor);
        }

        let ready = processor.is_ready();
        let mut off = 0;

        while off < n_samples {
            let n = self.push(inputs, off, n_samples - off);
            self.pop(outputs, off, n);
            off += n;

            if self.frame_ready() {
                self.run_frame(processor, playing);
            }
        }

        if !ready {
            silence(outputs, n_samples);
        }
    }
}
