//! PCM audio. Only WAV is understood; everything else is a black box the
//! registry can store but not inspect.

use crate::Decoded;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::io::Cursor;
use wold_metadata::models::AudioAttributes;

pub const FORMATS: &[&str] = &["wav"];

/// Interleaved samples normalized to `[-1, 1]`, with the WAV format they came in.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBuffer {
    pub spec: WavSpec,
    pub samples: Vec<f32>,
}

impl SampleBuffer {
    pub fn channels(&self) -> usize {
        usize::from(self.spec.channels.max(1))
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels()
    }

    pub fn duration_s(&self) -> f64 {
        match self.spec.sample_rate {
            0 => 0.0,
            rate => self.frames() as f64 / f64::from(rate),
        }
    }

    pub fn peak(&self) -> f32 {
        self.samples.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
    }
}

pub fn decode(bytes: &[u8], format: &str, size_bytes: u64) -> Result<Decoded<AudioAttributes>> {
    if format != "wav" {
        exn::bail!(ErrorKind::Unsupported(format!("audio format `{format}`")));
    }
    let reader = WavReader::new(Cursor::new(bytes)).or_raise(|| ErrorKind::malformed("WAV header"))?;
    let spec = reader.spec();
    let duration_s = match spec.sample_rate {
        0 => 0.0,
        rate => f64::from(reader.duration()) / f64::from(rate),
    };
    Ok(Decoded::new(AudioAttributes {
        duration_s,
        sample_rate: spec.sample_rate,
        channel_count: spec.channels,
        bit_depth: spec.bits_per_sample,
        bitrate_bps: bitrate(size_bytes, duration_s),
        is_compressed: false,
    }))
}

/// Whole-file bitrate, `0` for silence of zero length.
pub fn bitrate(size_bytes: u64, duration_s: f64) -> u64 {
    match duration_s > 0.0 {
        true => (size_bytes as f64 * 8.0 / duration_s).round() as u64,
        false => 0,
    }
}

pub fn read(bytes: &[u8]) -> Result<SampleBuffer> {
    let mut reader = WavReader::new(Cursor::new(bytes)).or_raise(|| ErrorKind::malformed("WAV header"))?;
    let spec = reader.spec();
    let samples: std::result::Result<Vec<f32>, hound::Error> = match spec.sample_format {
        SampleFormat::Float => reader.samples::<f32>().collect(),
        SampleFormat::Int => {
            let scale = int_scale(spec.bits_per_sample)?;
            reader.samples::<i32>().map(|s| s.map(|v| v as f32 / scale)).collect()
        },
    };
    Ok(SampleBuffer {
        spec,
        samples: samples.or_raise(|| ErrorKind::malformed("WAV samples"))?,
    })
}

pub fn write(buffer: &SampleBuffer) -> Result<Vec<u8>> {
    let mut out = Cursor::new(Vec::new());
    {
        let mut writer = WavWriter::new(&mut out, buffer.spec).or_raise(|| ErrorKind::Encode("WAV"))?;
        match buffer.spec.sample_format {
            SampleFormat::Float => {
                for s in &buffer.samples {
                    writer.write_sample(*s).or_raise(|| ErrorKind::Encode("WAV"))?;
                }
            },
            SampleFormat::Int => {
                let scale = int_scale(buffer.spec.bits_per_sample)?;
                let (lo, hi) = (-scale, scale - 1.0);
                for s in &buffer.samples {
                    let value = (s * scale).round().clamp(lo, hi) as i32;
                    writer.write_sample(value).or_raise(|| ErrorKind::Encode("WAV"))?;
                }
            },
        }
        writer.finalize().or_raise(|| ErrorKind::Encode("WAV"))?;
    }
    Ok(out.into_inner())
}

fn int_scale(bits: u16) -> Result<f32> {
    match bits {
        1..=32 => Ok(2f32.powi(i32::from(bits) - 1)),
        other => exn::bail!(ErrorKind::Unsupported(format!("{other}-bit integer PCM"))),
    }
}

/// Scale so the loudest sample sits at full scale. Silence is left alone.
pub fn normalize(buffer: &mut SampleBuffer) {
    let peak = buffer.peak();
    if peak > 0.0 {
        for s in &mut buffer.samples {
            *s /= peak;
        }
    }
}

/// Drop leading and trailing frames quieter than `top_db` below the peak.
/// A buffer that is silent throughout comes back empty.
pub fn trim_silence(buffer: &SampleBuffer, top_db: f32) -> SampleBuffer {
    let threshold = buffer.peak() * 10f32.powf(-top_db / 20.0);
    let channels = buffer.channels();
    let loud = |frame: &[f32]| frame.iter().any(|s| s.abs() >= threshold) && threshold > 0.0;
    let frames: Vec<&[f32]> = buffer.samples.chunks_exact(channels).collect();
    let samples = match (frames.iter().position(|f| loud(f)), frames.iter().rposition(|f| loud(f))) {
        (Some(first), Some(last)) => buffer.samples[first * channels..(last + 1) * channels].to_vec(),
        _ => Vec::new(),
    };
    SampleBuffer { spec: buffer.spec, samples }
}
