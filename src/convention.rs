//! Channel ordering and normalisation conventions for ambisonic signals.
//!
//! Every component in this crate processes spherical harmonic signals in
//! ACN order with N3D normalisation internally. The functions here convert
//! host-facing conventions to and from that internal representation.

use crate::buffer::Frame;

/// Highest spherical harmonic order supported by the components.
pub const MAX_SH_ORDER: usize = 7;
/// Number of spherical harmonic channels at [`MAX_SH_ORDER`].
pub const MAX_NUM_SH_SIGNALS: usize = (MAX_SH_ORDER + 1) * (MAX_SH_ORDER + 1);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelOrder {
    /// Ambisonic Channel Numbering
    #[default]
    Acn = 0,
    /// Furse-Malham channel ordering, first order only
    Fuma = 1,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum Normalization {
    /// Orthonormalised (full 3D normalisation)
    N3d = 0,
    /// Schmidt semi-normalised
    #[default]
    Sn3d = 1,
    /// Furse-Malham normalisation, first order only
    Fuma = 2,
}

impl ChannelOrder {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ChannelOrder::Fuma,
            _ => ChannelOrder::Acn,
        }
    }

    /// Return the nearest convention valid at `order`.
    ///
    /// Furse-Malham ordering only exists up to first order, above that it is
    /// replaced with ACN.
    pub fn coerce(self, order: usize) -> Self {
        match self {
            ChannelOrder::Fuma if order > 1 => ChannelOrder::Acn,
            other => other,
        }
    }
}

impl Normalization {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Normalization::N3d,
            2 => Normalization::Fuma,
            _ => Normalization::Sn3d,
        }
    }

    /// Return the nearest convention valid at `order`.
    pub fn coerce(self, order: usize) -> Self {
        match self {
            Normalization::Fuma if order > 1 => Normalization::Sn3d,
            other => other,
        }
    }

    /// Gain that takes a signal of degree `n` in this convention to N3D.
    fn to_n3d_gain(self, n: usize) -> f32 {
        match self {
            Normalization::N3d => 1.0,
            Normalization::Sn3d => ((2 * n + 1) as f32).sqrt(),
            Normalization::Fuma => match n {
                0 => std::f32::consts::SQRT_2,
                _ => ((2 * n + 1) as f32).sqrt(),
            },
        }
    }
}

/// Number of spherical harmonic channels for `order`.
pub fn order_to_channels(order: usize) -> usize {
    (order + 1) * (order + 1)
}

/// Largest order whose channel count fits in `channels`.
pub fn channels_to_order(channels: usize) -> usize {
    let mut order = 0;
    while order_to_channels(order + 1) <= channels {
        order += 1;
    }
    order
}

/// Degree `n` of the ACN channel `acn`.
pub fn acn_degree(acn: usize) -> usize {
    let mut n = 0;
    while (n + 1) * (n + 1) <= acn {
        n += 1;
    }
    n
}

/// ACN index of the channel stored at FuMa position `i` (first order).
const FUMA_TO_ACN: [usize; 4] = [0, 3, 1, 2];

/// Convert the first `(order + 1)^2` channels of `frame` in place from the
/// given conventions to ACN/N3D.
pub fn to_acn_n3d(frame: &mut Frame, order: usize, channel_order: ChannelOrder, norm: Normalization) {
    let channel_order = channel_order.coerce(order);
    let norm = norm.coerce(order);
    let nsh = order_to_channels(order).min(frame.channels());

    if channel_order == ChannelOrder::Fuma && nsh >= 4 {
        // W X Y Z -> W Y Z X
        let mut tmp = [0.0f32; 4];
        for s in 0..frame.len() {
            for (fuma, acn) in FUMA_TO_ACN.iter().enumerate() {
                tmp[*acn] = frame.channel(fuma)[s];
            }
            for (acn, value) in tmp.iter().enumerate() {
                frame.channel_mut(acn)[s] = *value;
            }
        }
    }

    scale_by_degree(frame, nsh, |n| norm.to_n3d_gain(n));
}

/// Convert the first `(order + 1)^2` channels of `frame` in place from
/// ACN/N3D to the given conventions.
pub fn from_acn_n3d(frame: &mut Frame, order: usize, channel_order: ChannelOrder, norm: Normalization) {
    let channel_order = channel_order.coerce(order);
    let norm = norm.coerce(order);
    let nsh = order_to_channels(order).min(frame.channels());

    scale_by_degree(frame, nsh, |n| 1.0 / norm.to_n3d_gain(n));

    if channel_order == ChannelOrder::Fuma && nsh >= 4 {
        // W Y Z X -> W X Y Z
        let mut tmp = [0.0f32; 4];
        for s in 0..frame.len() {
            for (fuma, acn) in FUMA_TO_ACN.iter().enumerate() {
                tmp[fuma] = frame.channel(*acn)[s];
            }
            for (fuma, value) in tmp.iter().enumerate() {
                frame.channel_mut(fuma)[s] = *value;
            }
        }
    }
}

fn scale_by_degree(frame: &mut Frame, nsh: usize, gain: impl Fn(usize) -> f32) {
    for ch in 0..nsh {
        let g = gain(acn_degree(ch));
        if g != 1.0 {
            frame.channel_mut(ch).iter_mut().for_each(|x| *x *= g);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    #[test]
    fn channel_counts() {
        assert_eq!(order_to_channels(0), 1);
        assert_eq!(order_to_channels(1), 4);
        assert_eq!(order_to_channels(7), MAX_NUM_SH_SIGNALS);

        assert_eq!(channels_to_order(1), 0);
        assert_eq!(channels_to_order(4), 1);
        assert_eq!(channels_to_order(8), 1);
        assert_eq!(channels_to_order(9), 2);
        assert_eq!(channels_to_order(64), 7);

        assert_eq!(acn_degree(0), 0);
        assert_eq!(acn_degree(1), 1);
        assert_eq!(acn_degree(3), 1);
        assert_eq!(acn_degree(4), 2);
        assert_eq!(acn_degree(63), 7);
    }

    #[test]
    fn legacy_conventions_are_coerced_above_first_order() {
        assert_eq!(ChannelOrder::Fuma.coerce(1), ChannelOrder::Fuma);
        assert_eq!(ChannelOrder::Fuma.coerce(3), ChannelOrder::Acn);
        assert_eq!(Normalization::Fuma.coerce(1), Normalization::Fuma);
        assert_eq!(Normalization::Fuma.coerce(2), Normalization::Sn3d);
        assert_eq!(Normalization::N3d.coerce(5), Normalization::N3d);
    }

    #[test]
    fn fuma_first_order_round_trip() {
        // W X Y Z in FuMa
        let mut frame = Frame::new(4, 8);
        frame.fill_from(&[vec![0.5f32; 8], vec![1.0; 8], vec![2.0; 8], vec![3.0; 8]]);
        to_acn_n3d(&mut frame, 1, ChannelOrder::Fuma, Normalization::Fuma);

        let s3 = 3.0f32.sqrt();
        assert_approx_eq!(frame.channel(0)[0], 0.5 * std::f32::consts::SQRT_2, 1e-6);
        // Y Z X in ACN
        assert_approx_eq!(frame.channel(1)[0], 2.0 * s3, 1e-5);
        assert_approx_eq!(frame.channel(2)[0], 3.0 * s3, 1e-5);
        assert_approx_eq!(frame.channel(3)[0], 1.0 * s3, 1e-5);

        from_acn_n3d(&mut frame, 1, ChannelOrder::Fuma, Normalization::Fuma);
        for (ch, expected) in [0.5, 1.0, 2.0, 3.0].iter().enumerate() {
            for s in frame.channel(ch).iter() {
                assert_approx_eq!(s, expected, 1e-5);
            }
        }
    }

    #[test]
    fn sn3d_scaling_per_degree() {
        let mut frame = Frame::new(10, 2);
        frame.fill_from(&vec![vec![1.0f32; 2]; 10]);
        to_acn_n3d(&mut frame, 2, ChannelOrder::Acn, Normalization::Sn3d);

        assert_approx_eq!(frame.channel(0)[0], 1.0, 1e-6);
        for ch in 1..4 {
            assert_approx_eq!(frame.channel(ch)[1], 3.0f32.sqrt(), 1e-6);
        }
        for ch in 4..9 {
            assert_approx_eq!(frame.channel(ch)[1], 5.0f32.sqrt(), 1e-6);
        }
        // channels above the order are untouched
        assert_eq!(frame.channel(9), &[1.0, 1.0]);
    }
}
