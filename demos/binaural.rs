use anyhow::{bail, Context, Error};
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sphar::binauraliser::Binauraliser;
use sphar::fifo::Fifo;

use std::env;

// Azimuth in degrees to move the source by every block
const ROTATION: f32 = 2.0;
// Single host block size in frames
const BLOCK_LEN: usize = 1024;
// Source distance in metres, close enough for near-field filtering
const DISTANCE: f32 = 0.4;

fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() != 3 {
        bail!("Usage: {} MONO_WAV_FILE OUTPUT_WAV_FILE", args[0].clone());
    }

    let mut reader = WavReader::open(&args[1]).context("Open wav file failed")?;
    let spec = reader.spec();

    if spec.channels != 1 {
        bail!("Unsupported format, must be mono");
    }

    info!("wave file spec: {:?}", spec);

    let input = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .context("Read samples failed")?,
        SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|s| s as f32 / scale))
                .collect::<Result<Vec<_>, _>>()
                .context("Read samples failed")?
        }
    };

    let mut binauraliser = Binauraliser::builder()
        .with_sample_rate(spec.sample_rate as f32)
        .with_num_sources(1)
        .build()
        .context("Create binauraliser failed")?;

    let params = binauraliser.params();
    params.set_near_field(true);
    params.set_source_distance(0, DISTANCE);

    let mut fifo = Fifo::for_processor(&binauraliser);
    let latency = fifo.latency() + binauraliser.latency();
    info!("rendering {} samples, latency {latency}", input.len());

    let out_spec = WavSpec {
        channels: 2,
        sample_rate: spec.sample_rate,
        bits_per_sample: 32,
        sample_format: SampleFormat::Float,
    };
    let mut writer = WavWriter::create(&args[2], out_spec).context("Create output file failed")?;

    let mut left = vec![0.0; BLOCK_LEN];
    let mut right = vec![0.0; BLOCK_LEN];
    let mut azimuth = 0.0;

    // pad with silence to flush the latency
    let total = input.len() + latency;
    let mut block = vec![0.0; BLOCK_LEN];
    let mut pos = 0;

    while pos < total {
        let len = BLOCK_LEN.min(total - pos);

        block.fill(0.0);
        if pos < input.len() {
            let n = len.min(input.len() - pos);
            block[..n].copy_from_slice(&input[pos..pos + n]);
        }

        params.set_source_direction(0, azimuth, 0.0);
        azimuth += ROTATION;
        if azimuth > 180.0 {
            azimuth -= 360.0;
        }

        let mut outputs = [&mut left[..len], &mut right[..len]];
        fifo.process_block(&mut binauraliser, &[&block[..len]], &mut outputs, len, true);

        if pos + len > latency {
            let skip = latency.saturating_sub(pos);
            for (l, r) in Iterator::zip(left[skip..len].iter(), right[skip..len].iter()) {
                writer.write_sample(*l)?;
                writer.write_sample(*r)?;
            }
        }

        pos += len;
    }

    writer.finalize().context("Finalize output file failed")?;
    info!("done");

    Ok(())
}
