//! Spherical harmonic sound field rotator.
//!
//! The rotation is given either as yaw/pitch/roll angles or as a quaternion,
//! whichever was set last. The SH rotation matrix is rebuilt at the start of
//! the processing call following a change and applied to the previous input
//! frame while crossfading from the old matrix, so the rotator has one frame
//! of latency.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::buffer::Frame;
use crate::convention::{
    from_acn_n3d, order_to_channels, to_acn_n3d, ChannelOrder, Normalization, MAX_NUM_SH_SIGNALS,
    MAX_SH_ORDER,
};
use crate::error::{Error, Result};
use crate::fifo::{silence, FrameProcessor};
use crate::gate::{AtomicF32, Gate, Reason};
use crate::rotation::{
    euler_to_rotation, quaternion_to_rotation, rotation_to_euler, sh_rotation, EulerOrder,
    MatrixFader,
};

const DEFAULT_FRAME_SIZE: usize = 128;
const DEFAULT_ORDER: usize = 1;

/// Which representation the rotation was last set with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Source {
    Euler,
    Quaternion,
}

impl Reason for Source {
    fn code(self) -> u8 {
        match self {
            Source::Euler => 1,
            Source::Quaternion => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Source::Euler),
            2 => Some(Source::Quaternion),
            _ => None,
        }
    }
}

/// Shared parameter handle of a [`Rotator`].
///
/// Setters can be called from any thread and take effect at the start of
/// the next processing call. Angles are in degrees.
#[derive(Debug)]
pub struct RotatorParams {
    /// effective angles, flips already applied
    yaw: AtomicF32,
    pitch: AtomicF32,
    roll: AtomicF32,
    quaternion: [AtomicF32; 4],
    flip_yaw: AtomicBool,
    flip_pitch: AtomicBool,
    flip_roll: AtomicBool,
    flip_quaternion: AtomicBool,
    roll_pitch_yaw: AtomicBool,
    order: AtomicUsize,
    channel_order: AtomicU8,
    normalization: AtomicU8,
    source: AtomicU8,
    gate: Gate,
}

fn flipped(value: f32, flip: bool) -> f32 {
    match flip {
        true => -value,
        false => value,
    }
}

impl RotatorParams {
    fn new(order: usize, channel_order: ChannelOrder, normalization: Normalization) -> Self {
        Self {
            yaw: AtomicF32::new(0.0),
            pitch: AtomicF32::new(0.0),
            roll: AtomicF32::new(0.0),
            quaternion: [
                AtomicF32::new(1.0),
                AtomicF32::new(0.0),
                AtomicF32::new(0.0),
                AtomicF32::new(0.0),
            ],
            flip_yaw: AtomicBool::new(false),
            flip_pitch: AtomicBool::new(false),
            flip_roll: AtomicBool::new(false),
            flip_quaternion: AtomicBool::new(false),
            roll_pitch_yaw: AtomicBool::new(false),
            order: AtomicUsize::new(order),
            channel_order: AtomicU8::new(channel_order.coerce(order) as u8),
            normalization: AtomicU8::new(normalization.coerce(order) as u8),
            source: AtomicU8::new(Source::Euler.code()),
            gate: Gate::dirty(Source::Euler),
        }
    }

    fn touch(&self, source: Source) {
        self.source.store(source.code(), Ordering::SeqCst);
        self.gate.mark_dirty(source);
    }

    fn touch_last(&self) {
        let source = Source::from_code(self.source.load(Ordering::SeqCst)).unwrap_or(Source::Euler);
        self.gate.mark_dirty(source);
    }

    /// Set yaw in degrees, clamped to `[-180, 180]`.
    pub fn set_yaw(&self, yaw: f32) {
        let yaw = yaw.clamp(-180.0, 180.0);
        self.yaw
            .store(flipped(yaw, self.flip_yaw.load(Ordering::Relaxed)));
        self.touch(Source::Euler);
    }

    /// Set pitch in degrees, clamped to `[-90, 90]`.
    pub fn set_pitch(&self, pitch: f32) {
        let pitch = pitch.clamp(-90.0, 90.0);
        self.pitch
            .store(flipped(pitch, self.flip_pitch.load(Ordering::Relaxed)));
        self.touch(Source::Euler);
    }

    /// Set roll in degrees, clamped to `[-180, 180]`.
    pub fn set_roll(&self, roll: f32) {
        let roll = roll.clamp(-180.0, 180.0);
        self.roll
            .store(flipped(roll, self.flip_roll.load(Ordering::Relaxed)));
        self.touch(Source::Euler);
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

    /// Set the rotation as a quaternion. It is normalised; a zero quaternion
    /// is ignored.
    pub fn set_quaternion(&self, w: f32, x: f32, y: f32, z: f32) {
        let norm = (w * w + x * x + y * y + z * z).sqrt();
        if !norm.is_normal() {
            warn!("ignoring degenerate quaternion");
            return;
        }

        for (dst, v) in Iterator::zip(self.quaternion.iter(), [w, x, y, z]) {
            dst.store(v / norm);
        }
        self.touch(Source::Quaternion);
    }

    /// Quaternion `[w, x, y, z]` as last set.
    pub fn quaternion(&self) -> [f32; 4] {
        [
            self.quaternion[0].load(),
            self.quaternion[1].load(),
            self.quaternion[2].load(),
            self.quaternion[3].load(),
        ]
    }

    /// Toggle yaw sign inversion.
    ///
    /// The rotation in effect is kept, the reported yaw changes sign.
    pub fn set_flip_yaw(&self, flip: bool) {
        self.flip_yaw.store(flip, Ordering::Relaxed);
    }

    pub fn set_flip_pitch(&self, flip: bool) {
        self.flip_pitch.store(flip, Ordering::Relaxed);
    }

    pub fn set_flip_roll(&self, flip: bool) {
        self.flip_roll.store(flip, Ordering::Relaxed);
    }

    /// Use the conjugate of the quaternion.
    pub fn set_flip_quaternion(&self, flip: bool) {
        if self.flip_quaternion.swap(flip, Ordering::Relaxed) != flip {
            self.touch_last();
        }
    }

    pub fn flip_yaw(&self) -> bool {
        self.flip_yaw.load(Ordering::Relaxed)
    }

    pub fn flip_pitch(&self) -> bool {
        self.flip_pitch.load(Ordering::Relaxed)
    }

    pub fn flip_roll(&self) -> bool {
        self.flip_roll.load(Ordering::Relaxed)
    }

    pub fn flip_quaternion(&self) -> bool {
        self.flip_quaternion.load(Ordering::Relaxed)
    }

    /// Compose as roll-pitch-yaw instead of yaw-pitch-roll.
    pub fn set_roll_pitch_yaw(&self, enable: bool) {
        if self.roll_pitch_yaw.swap(enable, Ordering::Relaxed) != enable {
            self.touch_last();
        }
    }

    pub fn roll_pitch_yaw(&self) -> bool {
        self.roll_pitch_yaw.load(Ordering::Relaxed)
    }

    fn euler_order(&self) -> EulerOrder {
        match self.roll_pitch_yaw() {
            true => EulerOrder::RollPitchYaw,
            false => EulerOrder::YawPitchRoll,
        }
    }

    /// Set the SH order, clamped to `[0, MAX_SH_ORDER]`.
    ///
    /// Legacy FuMa conventions are replaced with ACN/SN3D above first order.
    pub fn set_order(&self, order: usize) {
        let order = order.min(MAX_SH_ORDER);
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

        if self.order.swap(order, Ordering::SeqCst) != order {
            self.touch_last();
        }
    }

    pub fn order(&self) -> usize {
        self.order.load(Ordering::SeqCst)
    }

    /// Set the host channel ordering. FuMa is ignored above first order.
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

    /// Set the host normalisation. FuMa is ignored above first order.
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

#[must_use]
pub struct RotatorBuilder {
    frame_size: usize,
    order: usize,
    channel_order: ChannelOrder,
    normalization: Normalization,
}

impl RotatorBuilder {
    fn new() -> Self {
        Self {
            frame_size: DEFAULT_FRAME_SIZE,
            order: DEFAULT_ORDER,
            channel_order: ChannelOrder::default(),
            normalization: Normalization::default(),
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

    pub fn with_channel_order(mut self, channel_order: ChannelOrder) -> Self {
        self.channel_order = channel_order;
        self
    }

    pub fn with_normalization(mut self, normalization: Normalization) -> Self {
        self.normalization = normalization;
        self
    }

    /// Try to build a [`Rotator`].
    ///
    /// This fails if the frame size is zero.
    pub fn build(self) -> Result<Rotator> {
        if self.frame_size == 0 {
            return Err(Error::InvalidFrameSize(self.frame_size, 1));
        }

        let order = self.order.min(MAX_SH_ORDER);
        let nsh = order_to_channels(order);

        let mut fader = MatrixFader::new(MAX_NUM_SH_SIGNALS, MAX_NUM_SH_SIGNALS, self.frame_size);
        fader.resize(nsh, nsh);

        Ok(Rotator {
            params: Arc::new(RotatorParams::new(
                order,
                self.channel_order,
                self.normalization,
            )),
            frame_size: self.frame_size,
            order,
            fader,
            input: Frame::new(MAX_NUM_SH_SIGNALS, self.frame_size),
            output: Frame::new(MAX_NUM_SH_SIGNALS, self.frame_size),
        })
    }
}

pub struct Rotator {
    params: Arc<RotatorParams>,
    frame_size: usize,
    /// order the current matrix was built for
    order: usize,
    fader: MatrixFader,
    /// input frame in ACN/N3D
    input: Frame,
    output: Frame,
}

impl Rotator {
    pub fn builder() -> RotatorBuilder {
        RotatorBuilder::new()
    }

    pub fn params(&self) -> Arc<RotatorParams> {
        self.params.clone()
    }

    /// Delay in samples between input and output.
    pub fn latency(&self) -> usize {
        self.frame_size
    }

    /// Forget the retained input frame.
    pub fn reset(&mut self) {
        self.fader.reset();
    }

    fn update(&mut self) {
        let Self {
            params,
            order,
            fader,
            ..
        } = self;

        params.gate.ensure_ready(|source: Source| {
            *order = params.order();
            let nsh = order_to_channels(*order);
            let resized = fader.resize(nsh, nsh);

            let euler_order = params.euler_order();
            let r = match source {
                Source::Euler => euler_to_rotation(
                    params.yaw.load().to_radians(),
                    params.pitch.load().to_radians(),
                    params.roll.load().to_radians(),
                    euler_order,
                ),
                Source::Quaternion => {
                    let [w, x, y, z] = params.quaternion();
                    let q = match params.flip_quaternion() {
                        true => [w, -x, -y, -z],
                        false => [w, x, y, z],
                    };
                    let r = quaternion_to_rotation(q);

                    // report the equivalent angles
                    let (yaw, pitch, roll) = rotation_to_euler(&r, euler_order);
                    params.yaw.store(yaw.to_degrees());
                    params.pitch.store(pitch.to_degrees());
                    params.roll.store(roll.to_degrees());
                    r
                }
            };

            sh_rotation(&r, *order, fader.current_mut());
            if resized {
                fader.settle();
            }
            debug!(order = *order, ?source, resized, "rotation matrix updated");
        });
    }
}

impl FrameProcessor for Rotator {
    fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn num_inputs(&self) -> usize {
        MAX_NUM_SH_SIGNALS
    }

    fn num_outputs(&self) -> usize {
        MAX_NUM_SH_SIGNALS
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

        let order = self.order;
        let channel_order = self.params.channel_order();
        let normalization = self.params.normalization();

        self.input.fill_from(inputs);
        to_acn_n3d(&mut self.input, order, channel_order, normalization);

        self.fader.process(&self.input, &mut self.output);

        from_acn_n3d(&mut self.output, order, channel_order, normalization);
        self.output.copy_to(outputs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::Rng;

    fn run(rotator: &mut Rotator, input: &[Vec<f32>]) -> Vec<Vec<f32>> {
        let frame = rotator.frame_size();
        let mut output = vec![vec![0.0; frame]; input.len()];
        rotator.process(input, &mut output, frame, true);
        output
    }

    fn random_frame(channels: usize, frame: usize) -> Vec<Vec<f32>> {
        let mut rng = rand::thread_rng();
        (0..channels)
            .map(|_| (0..frame).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect()
    }

    #[test]
    fn yaw_keeps_omni_only_field() {
        let frame = 64;
        let mut rotator = Rotator::builder()
            .with_frame_size(frame)
            .with_order(1)
            .build()
            .unwrap();
        rotator.params().set_yaw(90.0);

        let mut input = vec![vec![0.0; frame]; 4];
        input[0].fill(1.0);

        run(&mut rotator, &input);
        let output = run(&mut rotator, &input);

        for s in 0..frame {
            assert_approx_eq!(output[0][s], 1.0, 1e-6);
            for ch in 1..4 {
                assert_approx_eq!(output[ch][s], 0.0, 1e-6);
            }
        }
    }

    #[test]
    fn order_change_mid_stream_keeps_omni_level() {
        let frame = 32;
        let mut rotator = Rotator::builder()
            .with_frame_size(frame)
            .with_order(1)
            .build()
            .unwrap();
        let params = rotator.params();
        params.set_yaw(30.0);

        let mut input = vec![vec![0.0; frame]; 9];
        input[0].fill(1.0);
        run(&mut rotator, &input);

        for k in 0..6 {
            match k {
                2 => params.set_order(2),
                4 => params.set_order(1),
                _ => (),
            }
            let output = run(&mut rotator, &input);
            for s in 0..frame {
                assert_approx_eq!(output[0][s], 1.0, 1e-5);
                for ch in 1..9 {
                    assert_approx_eq!(output[ch][s], 0.0, 1e-5);
                }
            }
        }
    }

    #[test]
    fn positive_yaw_moves_front_source_left() {
        let frame = 32;
        let mut rotator = Rotator::builder()
            .with_frame_size(frame)
            .with_normalization(Normalization::N3d)
            .build()
            .unwrap();
        rotator.params().set_yaw(90.0);

        let s3 = 3.0f32.sqrt();
        // plane wave from the front, ACN/N3D
        let input = vec![vec![1.0; frame], vec![0.0; frame], vec![0.0; frame], vec![s3; frame]];

        run(&mut rotator, &input);
        let output = run(&mut rotator, &input);

        assert_approx_eq!(output[0][frame - 1], 1.0, 1e-5);
        assert_approx_eq!(output[1][frame - 1], s3, 1e-5);
        assert_approx_eq!(output[2][frame - 1], 0.0, 1e-5);
        assert_approx_eq!(output[3][frame - 1], 0.0, 1e-5);
    }

    #[test]
    fn new_rotation_crossfades_on_previous_frame() {
        let frame = 16;
        let order = 2;
        let nsh = order_to_channels(order);
        let mut rotator = Rotator::builder()
            .with_frame_size(frame)
            .with_order(order)
            .with_normalization(Normalization::N3d)
            .build()
            .unwrap();

        let x1 = random_frame(nsh, frame);
        let x2 = random_frame(nsh, frame);

        // nothing retained yet
        let out = run(&mut rotator, &x1);
        assert!(out.iter().flatten().all(|v| *v == 0.0));

        rotator.params().set_yaw(40.0);
        rotator.params().set_pitch(-20.0);
        let out = run(&mut rotator, &x2);

        let r = euler_to_rotation(40f32.to_radians(), -20f32.to_radians(), 0.0, EulerOrder::YawPitchRoll);
        let mut m = vec![0.0; nsh * nsh];
        sh_rotation(&r, order, &mut m);

        for i in 0..nsh {
            for t in 0..frame {
                let fade_in = (t + 1) as f32 / frame as f32;
                let rotated: f32 = (0..nsh).map(|j| m[i * nsh + j] * x1[j][t]).sum();
                let expected = fade_in * rotated + (1.0 - fade_in) * x1[i][t];
                assert_approx_eq!(out[i][t], expected, 1e-5);
            }
        }
    }

    #[test]
    fn chained_rotations_match_composed_rotation() {
        let frame = 32;
        let order = 3;
        let nsh = order_to_channels(order);

        let build = || {
            Rotator::builder()
                .with_frame_size(frame)
                .with_order(order)
                .build()
                .unwrap()
        };

        let (mut first, mut second, mut composed) = (build(), build(), build());
        first.params().set_yaw(30.0);
        second.params().set_pitch(25.0);

        let r = euler_to_rotation(0.0, 25f32.to_radians(), 0.0, EulerOrder::YawPitchRoll);
        let r = crate::rotation::mat3_mul(
            &r,
            &euler_to_rotation(30f32.to_radians(), 0.0, 0.0, EulerOrder::YawPitchRoll),
        );
        let q = {
            // rotation matrix to quaternion, trace is positive here
            let w = (1.0 + r[0][0] + r[1][1] + r[2][2]).sqrt() / 2.0;
            [
                w,
                (r[2][1] - r[1][2]) / (4.0 * w),
                (r[0][2] - r[2][0]) / (4.0 * w),
                (r[1][0] - r[0][1]) / (4.0 * w),
            ]
        };
        composed.params().set_quaternion(q[0], q[1], q[2], q[3]);

        let frames = (0..4).map(|_| random_frame(nsh, frame)).collect::<Vec<_>>();
        let mut chained = Vec::new();
        let mut direct = Vec::new();

        for x in frames.iter() {
            let y = run(&mut first, x);
            chained.push(run(&mut second, &y));
            direct.push(run(&mut composed, x));
        }

        // the chain has one more frame of latency
        for k in 1..4 {
            for ch in 0..nsh {
                for t in 0..frame {
                    assert_approx_eq!(chained[k][ch][t], direct[k - 1][ch][t], 1e-4);
                }
            }
        }
    }

    #[test]
    fn quaternion_reports_equivalent_angles() {
        let mut rotator = Rotator::builder().with_frame_size(8).build().unwrap();
        let params = rotator.params();

        let yaw = 50f32.to_radians();
        params.set_quaternion((yaw / 2.0).cos(), 0.0, 0.0, (yaw / 2.0).sin());
        run(&mut rotator, &vec![vec![0.0; 8]; 4]);

        assert_approx_eq!(params.yaw(), 50.0, 1e-3);
        assert_approx_eq!(params.pitch(), 0.0, 1e-3);
        assert_approx_eq!(params.roll(), 0.0, 1e-3);
    }

    #[test]
    fn setters_clamp_and_flip() {
        let rotator = Rotator::builder().build().unwrap();
        let params = rotator.params();

        params.set_yaw(270.0);
        assert_eq!(params.yaw(), 180.0);
        params.set_pitch(-120.0);
        assert_eq!(params.pitch(), -90.0);

        params.set_flip_roll(true);
        params.set_roll(10.0);
        assert_eq!(params.roll(), 10.0);
        assert_eq!(params.roll.load(), -10.0);

        params.set_flip_roll(false);
        assert_eq!(params.roll(), -10.0);

        params.set_order(42);
        assert_eq!(params.order(), MAX_SH_ORDER);
    }

    #[test]
    fn legacy_conventions_only_at_first_order() {
        let rotator = Rotator::builder()
            .with_order(1)
            .with_channel_order(ChannelOrder::Fuma)
            .with_normalization(Normalization::Fuma)
            .build()
            .unwrap();
        let params = rotator.params();
        assert_eq!(params.channel_order(), ChannelOrder::Fuma);

        params.set_order(3);
        assert_eq!(params.channel_order(), ChannelOrder::Acn);
        assert_eq!(params.normalization(), Normalization::Sn3d);

        params.set_channel_order(ChannelOrder::Fuma);
        params.set_normalization(Normalization::Fuma);
        assert_eq!(params.channel_order(), ChannelOrder::Acn);
        assert_eq!(params.normalization(), Normalization::Sn3d);
        assert_eq!(params.order(), 3);
    }

    #[test]
    fn mismatched_block_is_silent() {
        let mut rotator = Rotator::builder().with_frame_size(16).build().unwrap();
        let input = vec![vec![1.0; 8]; 4];
        let mut output = vec![vec![5.0; 8]; 4];

        rotator.process(&input, &mut output, 8, true);
        assert!(output.iter().flatten().all(|v| *v == 0.0));

        let input = vec![vec![1.0; 16]; 4];
        let mut output = vec![vec![5.0; 16]; 4];
        rotator.process(&input, &mut output, 16, false);
        assert!(output.iter().flatten().all(|v| *v == 0.0));
    }

    #[test]
    fn order_zero_passes_omni_through() {
        let frame = 8;
        let mut rotator = Rotator::builder()
            .with_frame_size(frame)
            .with_order(0)
            .build()
            .unwrap();
        rotator.params().set_yaw(123.0);

        let x = vec![vec![0.25; frame]];
        run(&mut rotator, &x);
        let out = run(&mut rotator, &x);
        assert_eq!(out[0], vec![0.25; frame]);
    }
}
