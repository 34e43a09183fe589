//! Static beams steered in the spherical harmonic domain.
//!
//! Each output channel is one axisymmetric beam with a cardioid,
//! hypercardioid or max-rE pattern, pointed at its own direction. Beam
//! weights are rebuilt at the start of the processing call following a
//! change and applied with the same one frame delayed crossfade as the
//! rotator.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::buffer::Frame;
use crate::convention::{
    acn_degree, order_to_channels, to_acn_n3d, ChannelOrder, Normalization, MAX_NUM_SH_SIGNALS,
    MAX_SH_ORDER,
};
use crate::error::{Error, Result};
use crate::fifo::{silence, FrameProcessor};
use crate::gate::{AtomicF32, Dirty, Gate};
use crate::rotation::MatrixFader;
use crate::sh::{legendre, real_sh};

pub const MAX_NUM_BEAMS: usize = 64;

const DEFAULT_FRAME_SIZE: usize = 128;
const DEFAULT_ORDER: usize = 1;
const DEFAULT_NUM_BEAMS: usize = 4;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum BeamPattern {
    #[default]
    Cardioid = 0,
    Hypercardioid = 1,
    /// Maximum energy vector pattern
    MaxRe = 2,
}

impl BeamPattern {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => BeamPattern::Hypercardioid,
            2 => BeamPattern::MaxRe,
            _ => BeamPattern::Cardioid,
        }
    }

    /// Per degree weights `b_n` of the pattern at `order`, such that the beam
    /// response at angle `g` off axis is `sum b_n (2n + 1) P_n(cos g)`,
    /// scaled to one on axis.
    pub fn degree_weights(self, order: usize) -> Vec<f32> {
        let fact = |n: usize| (1..=n).map(|v| v as f64).product::<f64>();

        let mut b = (0..=order)
            .map(|n| match self {
                BeamPattern::Cardioid => {
                    fact(order) * fact(order) / (fact(order + n + 1) * fact(order - n))
                }
                BeamPattern::Hypercardioid => 1.0,
                BeamPattern::MaxRe => {
                    let angle = 137.9f64.to_radians() / (order as f64 + 1.51);
                    legendre(n, angle.cos() as f32) as f64
                }
            })
            .collect::<Vec<f64>>();

        let on_axis: f64 = b.iter().enumerate().map(|(n, b)| b * (2 * n + 1) as f64).sum();
        b.iter_mut().for_each(|b| *b /= on_axis);

        b.into_iter().map(|b| b as f32).collect()
    }
}

/// Shared parameter handle of a [`Beamformer`]. Angles are in degrees.
#[derive(Debug)]
pub struct BeamformerParams {
    order: AtomicUsize,
    num_beams: AtomicUsize,
    azimuth: [AtomicF32; MAX_NUM_BEAMS],
    elevation: [AtomicF32; MAX_NUM_BEAMS],
    pattern: AtomicU8,
    channel_order: AtomicU8,
    normalization: AtomicU8,
    gate: Gate,
}

impl BeamformerParams {
    fn new(order: usize, num_beams: usize) -> Self {
        let params = Self {
            order: AtomicUsize::new(order),
            num_beams: AtomicUsize::new(num_beams),
            azimuth: std::array::from_fn(|_| AtomicF32::new(0.0)),
            elevation: std::array::from_fn(|_| AtomicF32::new(0.0)),
            pattern: AtomicU8::new(BeamPattern::default() as u8),
            channel_order: AtomicU8::new(ChannelOrder::default() as u8),
            normalization: AtomicU8::new(Normalization::default() as u8),
            gate: Gate::dirty(Dirty),
        };

        // spread on the horizontal plane
        for (i, az) in params.azimuth.iter().enumerate() {
            az.store(wrap_degrees(360.0 * i as f32 / num_beams.max(1) as f32));
        }

        params
    }

    /// Set the SH order, clamped to `[1, MAX_SH_ORDER]`.
    pub fn set_order(&self, order: usize) {
        let order = order.clamp(1, MAX_SH_ORDER);
        if order > 1 {
            if self.channel_order() == ChannelOrder::Fuma {
                warn!(order, "FuMa channel ordering is first order only, using ACN");
                self.channel_order
                    .store(ChannelOrder::Acn as u8, Ordering::Relaxed);
            }
            if self.normalization() == Normalization::Fuma {
                warn!(order, "FuMa normalisation is first order only, using SN3D");
                self.normalization
                    .store(Normalization::Sn3d as u8, Ordering::Relaxed);
            }
        }
        self.order.store(order, Ordering::SeqCst);
        self.gate.mark_dirty(Dirty);
    }

    pub fn order(&self) -> usize {
        self.order.load(Ordering::SeqCst)
    }

    /// Set the number of beams, clamped to `[1, MAX_NUM_BEAMS]`.
    pub fn set_num_beams(&self, num_beams: usize) {
        self.num_beams
            .store(num_beams.clamp(1, MAX_NUM_BEAMS), Ordering::SeqCst);
        self.gate.mark_dirty(Dirty);
    }

    pub fn num_beams(&self) -> usize {
        self.num_beams.load(Ordering::SeqCst)
    }

    /// Point beam `index`. Azimuth is wrapped to `(-180, 180]`, elevation
    /// clamped to `[-90, 90]`. Out of range indices are ignored.
    pub fn set_beam_direction(&self, index: usize, azimuth: f32, elevation: f32) {
        if index >= MAX_NUM_BEAMS {
            return;
        }
        self.azimuth[index].store(wrap_degrees(azimuth));
        self.elevation[index].store(elevation.clamp(-90.0, 90.0));
        self.gate.mark_dirty(Dirty);
    }

    pub fn beam_direction(&self, index: usize) -> Option<(f32, f32)> {
        (index < MAX_NUM_BEAMS).then(|| (self.azimuth[index].load(), self.elevation[index].load()))
    }

    pub fn set_pattern(&self, pattern: BeamPattern) {
        self.pattern.store(pattern as u8, Ordering::Relaxed);
        self.gate.mark_dirty(Dirty);
    }

    pub fn pattern(&self) -> BeamPattern {
        BeamPattern::from_u8(self.pattern.load(Ordering::Relaxed))
    }

    /// Set the input channel ordering. FuMa is ignored above first order.
    pub fn set_channel_order(&self, channel_order: ChannelOrder) {
        if channel_order.coerce(self.order()) != channel_order {
            warn!(order = self.order(), "FuMa channel ordering is first order only, ignoring");
            return;
        }
        self.channel_order
            .store(channel_order as u8, Ordering::Relaxed);
    }

    pub fn channel_order(&self) -> ChannelOrder {
        ChannelOrder::from_u8(self.channel_order.load(Ordering::Relaxed))
    }

    /// Set the input normalisation. FuMa is ignored above first order.
    pub fn set_normalization(&self, normalization: Normalization) {
        if normalization.coerce(self.order()) != normalization {
            warn!(order = self.order(), "FuMa normalisation is first order only, ignoring");
            return;
        }
        self.normalization
            .store(normalization as u8, Ordering::Relaxed);
    }

    pub fn normalization(&self) -> Normalization {
        Normalization::from_u8(self.normalization.load(Ordering::Relaxed))
    }
}

fn wrap_degrees(deg: f32) -> f32 {
    let wrapped = deg.rem_euclid(360.0);
    match wrapped > 180.0 {
        true => wrapped - 360.0,
        false => wrapped,
    }
}

#[must_use]
pub struct BeamformerBuilder {
    frame_size: usize,
    order: usize,
    num_beams: usize,
}

impl BeamformerBuilder {
    fn new() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            order: DEFAULT_ORDER,
            num_beams: DEFAULT_NUM_BEAMS,
        }
    }

    /// Set the processing frame size. Default value is 128.
    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size;
        self
    }

    /// Set the initial SH order. Default value is 1.
    pub fn with_order(mut self, order: usize) -> Self {
        self.order = order;
        self
    }

    /// Set the initial beam count. Default value is 4, evenly spread on the
    /// horizontal plane.
    pub fn with_num_beams(mut self, num_beams: usize) -> Self {
        self.num_beams = num_beams;
        self
    }

    pub fn build(self) -> Result<Beamformer> {
        if self.frame_size == 0 {
            return Err(Error::InvalidFrameSize(self.frame_size, 1));
        }

        let order = self.order.clamp(1, MAX_SH_ORDER);
        let num_beams = self.num_beams.clamp(1, MAX_NUM_BEAMS);

        let mut fader = MatrixFader::new(MAX_NUM_BEAMS, MAX_NUM_SH_SIGNALS, self.frame_size);
        fader.resize(num_beams, order_to_channels(order));

        Ok(Beamformer {
            params: Arc::new(BeamformerParams::new(order, num_beams)),
            frame_size: self.frame_size,
            order,
            num_beams,
            fader,
            input: Frame::new(MAX_NUM_SH_SIGNALS, self.frame_size),
            output: Frame::new(MAX_NUM_BEAMS, self.frame_size),
            y: vec![0.0; MAX_NUM_SH_SIGNALS],
        })
    }
}

pub struct Beamformer {
    params: Arc<BeamformerParams>,
    frame_size: usize,
    order: usize,
    num_beams: usize,
    fader: MatrixFader,
    input: Frame,
    output: Frame,
    /// SH scratch for one steering direction
    y: Vec<f32>,
}

impl Beamformer {
    pub fn builder() -> BeamformerBuilder {
        BeamformerBuilder::new()
    }

    pub fn params(&self) -> Arc<BeamformerParams> {
        self.params.clone()
    }

    pub fn latency(&self) -> usize {
        self.frame_size
    }

    fn update(&mut self) {
        let Self {
            params,
            order,
            num_beams,
            fader,
            y,
            ..
        } = self;

        params.gate.ensure_ready(|_: Dirty| {
            *order = params.order();
            *num_beams = params.num_beams();
            let nsh = order_to_channels(*order);
            let resized = fader.resize(*num_beams, nsh);

            let pattern = params.pattern();
            let b = pattern.degree_weights(*order);
            let weights = fader.current_mut();

            for beam in 0..*num_beams {
                let (az, el) = (params.azimuth[beam].load(), params.elevation[beam].load());
                real_sh(*order, az.to_radians(), el.to_radians(), y);

                for (acn, w) in weights[beam * nsh..(beam + 1) * nsh].iter_mut().enumerate() {
                    *w = b[acn_degree(acn)] * y[acn];
                }
            }

            if resized {
                fader.settle();
            }
            debug!(order = *order, num_beams = *num_beams, ?pattern, resized, "beam weights updated");
        });
    }
}

impl FrameProcessor for Beamformer {
    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn num_inputs(&self) -> usize {
        MAX_NUM_SH_SIGNALS
    }

    fn num_outputs(&self) -> usize {
        MAX_NUM_BEAMS
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

        self.update();

        self.input.fill_from(inputs);
        to_acn_n3d(
            &mut self.input,
            self.order,
            self.params.channel_order(),
            self.params.normalization(),
        );

        self.fader.process(&self.input, &mut self.output);
        self.output.copy_to(outputs);
    }
}
