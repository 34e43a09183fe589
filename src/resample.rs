//! Offline resampling of multichannel buffers.
//!
//! Buffers are channel major: channel `c` occupies `[c * len, (c + 1) * len)`.
//! Equal rates copy the input through, truncated or zero padded to the
//! requested length. Different rates need the `resample` feature.

use crate::error::{Error, Result};

/// Resampler quality.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Quality {
    /// FFT based synchronous resampler
    #[default]
    Fast,
    /// Band limited sinc interpolation
    Best,
}

/// Resample `channels` channels of `in_len` samples from `in_fs` to `out_fs`,
/// producing `out_len` samples per channel.
///
/// The resampler's own group delay is removed, so a sample at input time `t`
/// lands at output time `t` as well.
pub fn resample(
    input: &[f32],
    in_len: usize,
    out_len: usize,
    in_fs: u32,
    out_fs: u32,
    channels: usize,
    quality: Quality,
) -> Result<Vec<f32>> {
    if in_fs == 0 || out_fs == 0 {
        return Err(Error::InvalidSampleRate(in_fs.min(out_fs) as f32));
    }
    if input.len() < in_len * channels {
        return Err(Error::InvalidInputOutputLen(input.len(), in_len * channels));
    }

    let mut output = vec![0.0; out_len * channels];

    if in_fs == out_fs {
        let n = in_len.min(out_len);
        for (src, dst) in Iterator::zip(
            input.chunks_exact(in_len.max(1)),
            output.chunks_exact_mut(out_len.max(1)),
        ) {
            dst[..n].copy_from_slice(&src[..n]);
        }
        return Ok(output);
    }

    if in_len == 0 || out_len == 0 || channels == 0 {
        return Ok(output);
    }

    resample_rates(input, in_len, out_len, in_fs, out_fs, channels, quality, &mut output)?;
    Ok(output)
}

#[cfg(not(feature = "resample"))]
#[allow(clippy::too_many_arguments)]
fn resample_rates(
    _: &[f32],
    _: usize,
    _: usize,
    _: u32,
    _: u32,
    _: usize,
    _: Quality,
    _: &mut [f32],
) -> Result<()> {
    Err(Error::Resample(
        "built without the `resample` feature".to_string(),
    ))
}

#[cfg(feature = "resample")]
#[allow(clippy::too_many_arguments)]
fn resample_rates(
    input: &[f32],
    in_len: usize,
    out_len: usize,
    in_fs: u32,
    out_fs: u32,
    channels: usize,
    quality: Quality,
    output: &mut [f32],
) -> Result<()> {
    use rubato::{
        FftFixedIn, Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType,
        WindowFunction,
    };

    const CHUNK_SIZE: usize = 1024;

    let input = input
        .chunks_exact(in_len)
        .take(channels)
        .collect::<Vec<_>>();

    let resampled = match quality {
        Quality::Fast => {
            let resampler = FftFixedIn::<f32>::new(
                in_fs as usize,
                out_fs as usize,
                CHUNK_SIZE,
                2,
                channels,
            )
            .map_err(|e| Error::Resample(e.to_string()))?;
            let delay = resampler.output_delay() as isize;
            drive(resampler, &input, out_len, delay)?
        }
        Quality::Best => {
            let ratio = out_fs as f64 / in_fs as f64;
            let sinc = |channels: usize| {
                let params = SincInterpolationParameters {
                    sinc_len: 256,
                    f_cutoff: 0.95,
                    interpolation: SincInterpolationType::Cubic,
                    oversampling_factor: 256,
                    window: WindowFunction::BlackmanHarris2,
                };
                SincFixedIn::<f32>::new(ratio, 1.0, params, CHUNK_SIZE, channels)
                    .map_err(|e| Error::Resample(e.to_string()))
            };
            // output_delay() does not match where the sinc filter is centred
            let delay = impulse_delay(sinc(1)?, ratio)?;
            drive(sinc(channels)?, &input, out_len, delay)?
        }
    };

    for (src, dst) in Iterator::zip(resampled.iter(), output.chunks_exact_mut(out_len)) {
        dst.copy_from_slice(src);
    }

    Ok(())
}

/// Output frames between an input impulse and the peak of its response.
#[cfg(feature = "resample")]
fn impulse_delay<R: rubato::Resampler<f32>>(resampler: R, ratio: f64) -> Result<isize> {
    const IMPULSE_AT: usize = 256;

    let mut impulse = vec![0.0; 2 * IMPULSE_AT];
    impulse[IMPULSE_AT] = 1.0;
    let len = (impulse.len() as f64 * ratio).ceil() as usize + resampler.output_delay();

    let response = drive(resampler, &[impulse.as_slice()], len, 0)?;
    let peak = response[0]
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.abs().total_cmp(&b.1.abs()))
        .map_or(0, |(n, _)| n);

    Ok((peak as f64 - IMPULSE_AT as f64 * ratio).round() as isize)
}

/// Feed `input` through `resampler` and return `out_len` samples per channel
/// starting `delay` samples into its output. A negative delay pads the front
/// with silence.
#[cfg(feature = "resample")]
fn drive<R: rubato::Resampler<f32>>(
    mut resampler: R,
    input: &[&[f32]],
    out_len: usize,
    delay: isize,
) -> Result<Vec<Vec<f32>>> {
    let skip = delay.max(0) as usize;
    let lead = delay.min(0).unsigned_abs();
    let needed = (out_len + skip).saturating_sub(lead);
    let in_len = input.first().map_or(0, |ch| ch.len());

    let mut output = vec![Vec::with_capacity(out_len + skip); input.len()];
    let mut pos = 0;

    while output[0].len() < needed {
        let n = resampler.input_frames_next();

        let result = if pos + n <= in_len {
            let chunk = input.iter().map(|ch| &ch[pos..pos + n]).collect::<Vec<_>>();
            resampler.process(&chunk, None)
        } else if pos < in_len {
            let chunk = input.iter().map(|ch| &ch[pos..]).collect::<Vec<_>>();
            resampler.process_partial(Some(chunk.as_slice()), None)
        } else {
            resampler.process_partial(None::<&[&[f32]]>, None)
        };
        let chunk = result.map_err(|e| Error::Resample(e.to_string()))?;

        pos += n;

        for (dst, src) in Iterator::zip(output.iter_mut(), chunk.iter()) {
            dst.extend_from_slice(src);
        }
    }

    for ch in output.iter_mut() {
        ch.drain(..skip);
        ch.splice(0..0, std::iter::repeat(0.0).take(lead));
        ch.truncate(out_len);
    }

    Ok(output)
}
