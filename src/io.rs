//! Loading, resampling and writing of the reference and accompaniment audio.
//!
//! Everything here runs once at session start; none of it is called from the
//! real-time tick.

use hound::{SampleFormat, WavSpec, WavWriter};
use ndarray::{Array2, ArrayView2};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::path::Path;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioSpec {
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("hound error: {0}")]
    Hound(#[from] hound::Error),
    #[error("symphonia error: {0}")]
    Symphonia(SymphoniaError),
    #[error("no audio track found")]
    NoAudioTrack,
    #[error("unsupported number of channels")]
    UnsupportedChannels,
    #[error("resampling error: {0}")]
    Resample(String),
}

impl From<SymphoniaError> for AudioError {
    fn from(err: SymphoniaError) -> Self {
        Self::Symphonia(err)
    }
}

/// Decode an audio file into a `(channels, frames)` array.
///
/// Supports every container/codec symphonia is built with (WAV, FLAC, OGG
/// Vorbis, MP3). When `target_sr` differs from the native rate the audio is
/// resampled once; when `mono` is set the channels are averaged.
///
/// # Example
/// ```no_run
/// use cadenza::io;
///
/// let (data, spec) = io::load_audio("solo.wav", Some(16000), true).unwrap();
/// assert_eq!(spec.sample_rate, 16000);
/// assert_eq!(data.shape()[0], 1);
/// ```
pub fn load_audio<P: AsRef<Path>>(
    path: P,
    target_sr: Option<u32>,
    mono: bool,
) -> Result<(Array2<f32>, AudioSpec), AudioError> {
    let path_ref = path.as_ref();
    let mut hint = Hint::new();
    if let Some(ext) = path_ref.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let file = std::fs::File::open(path_ref).map_err(SymphoniaError::IoError)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let opened = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;

    let mut format = opened.format;
    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.sample_rate.is_some())
        .ok_or(AudioError::NoAudioTrack)?
        .clone();

    let sample_rate = track.codec_params.sample_rate.unwrap_or(0);
    let channels = track
        .codec_params
        .channels
        .map(|c| c.count())
        .unwrap_or(0);
    if channels == 0 {
        return Err(AudioError::UnsupportedChannels);
    }

    let mut decoder =
        symphonia::default::get_codecs().make(&track.codec_params, &DecoderOptions::default())?;

    let mut samples: Vec<f32> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::ResetRequired) => {
                decoder.reset();
                continue;
            }
            Err(SymphoniaError::IoError(_)) => break,
            Err(e) => return Err(e.into()),
        };

        if packet.track_id() != track.id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(audio) => audio,
            Err(SymphoniaError::IoError(_)) => break,
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(e) => return Err(e.into()),
        };

        let mut sb = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
        sb.copy_interleaved_ref(decoded);
        samples.extend_from_slice(sb.samples());
    }

    let data = deinterleave(&samples, channels);
    log::debug!(
        "load_audio: {:?} decoded {} frames x {} channels at {} Hz",
        path_ref,
        data.ncols(),
        channels,
        sample_rate
    );
    prepare(data.view(), sample_rate, target_sr, mono)
}

/// Bring pre-loaded audio to the session format: optional mono mix, then a
/// single resampling pass to `target_sr`.
pub fn prepare(
    data: ArrayView2<f32>,
    native_sr: u32,
    target_sr: Option<u32>,
    mono: bool,
) -> Result<(Array2<f32>, AudioSpec), AudioError> {
    let data = if mono { to_mono(data) } else { data.to_owned() };
    let mut spec = AudioSpec {
        sample_rate: native_sr,
        channels: data.nrows() as u16,
    };
    if let Some(target) = target_sr
        && target != native_sr
        && native_sr > 0
    {
        let resampled = resample(&data, native_sr, target)?;
        spec.sample_rate = target;
        return Ok((resampled, spec));
    }
    Ok((data, spec))
}

fn deinterleave(samples: &[f32], channels: usize) -> Array2<f32> {
    let frames = samples.len() / channels.max(1);
    let mut data = Array2::<f32>::zeros((channels, frames));
    for frame in 0..frames {
        for ch in 0..channels {
            data[(ch, frame)] = samples[frame * channels + ch];
        }
    }
    data
}

/// Resample `(channels, frames)` audio from `src_sr` to `dst_sr`.
pub fn resample(data: &Array2<f32>, src_sr: u32, dst_sr: u32) -> Result<Array2<f32>, AudioError> {
    if src_sr == dst_sr {
        return Ok(data.clone());
    }

    let (channels, frames) = data.dim();
    if channels == 0 || frames == 0 {
        return Ok(Array2::<f32>::zeros((channels, frames)));
    }

    let input: Vec<Vec<f32>> = data.rows().into_iter().map(|r| r.to_vec()).collect();

    let gcd = gcd_u32(src_sr, dst_sr);
    let resample_ratio = (dst_sr / gcd) as f64 / (src_sr / gcd) as f64;

    let chunk_size = 1024usize;
    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let mut resampler = SincFixedIn::<f32>::new(resample_ratio, 2.0, params, chunk_size, channels)
        .map_err(|e| AudioError::Resample(e.to_string()))?;

    let mut output: Vec<Vec<f32>> = vec![Vec::new(); channels];
    let mut offset = 0usize;
    while offset < frames {
        let end = (offset + chunk_size).min(frames);
        let chunk: Vec<Vec<f32>> = input
            .iter()
            .map(|ch_data| {
                let mut buf = vec![0.0f32; chunk_size];
                buf[..end - offset].copy_from_slice(&ch_data[offset..end]);
                buf
            })
            .collect();

        let chunk_out = resampler
            .process(&chunk, None)
            .map_err(|e| AudioError::Resample(e.to_string()))?;
        for (out, produced) in output.iter_mut().zip(chunk_out.iter()) {
            out.extend_from_slice(produced);
        }
        offset = end;
    }

    let expected = ((frames as f64) * (dst_sr as f64) / (src_sr as f64)).round() as usize;
    let out_frames = output
        .iter()
        .map(|v| v.len())
        .min()
        .unwrap_or(0)
        .min(expected);
    let mut out = Array2::<f32>::zeros((channels, out_frames));
    for (ch, ch_data) in output.iter().enumerate() {
        for i in 0..out_frames {
            out[(ch, i)] = ch_data[i];
        }
    }
    Ok(out)
}

fn gcd_u32(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let r = a % b;
        a = b;
        b = r;
    }
    a
}

/// Convert multi-channel audio to mono by averaging channels.
pub fn to_mono(data: ArrayView2<f32>) -> Array2<f32> {
    let (channels, frames) = data.dim();
    if channels <= 1 {
        return data.to_owned();
    }
    let mut mono = Array2::<f32>::zeros((1, frames));
    for frame in 0..frames {
        let sum: f32 = data.column(frame).sum();
        mono[(0, frame)] = sum / channels as f32;
    }
    mono
}

/// Reject empty or non-finite audio.
pub fn valid_audio(y: ArrayView2<f32>) -> crate::Result<()> {
    if y.is_empty() {
        return Err(crate::Error::EmptyAudio);
    }
    if !y.iter().all(|v| v.is_finite()) {
        return Err(crate::Error::NonFiniteAudio);
    }
    Ok(())
}

/// Generate a pure tone.
pub fn tone(frequency: f32, sr: u32, duration: f32) -> Vec<f32> {
    let n_samples = (duration * sr as f32) as usize;
    let angular_freq = 2.0 * std::f32::consts::PI * frequency / sr as f32;
    (0..n_samples)
        .map(|i| (angular_freq * i as f32).sin())
        .collect()
}

/// Save audio data to a 16-bit PCM WAV file.
///
/// Samples are clipped to `[-1.0, 1.0]` before quantization.
pub fn save_wav<P: AsRef<Path>>(
    path: P,
    data: &Array2<f32>,
    sample_rate: u32,
) -> crate::Result<()> {
    let (channels, frames) = data.dim();
    let spec = WavSpec {
        channels: channels as u16,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec).map_err(AudioError::Hound)?;
    for frame in 0..frames {
        for ch in 0..channels {
            let sample = data[(ch, frame)].clamp(-1.0, 1.0);
            let s = (sample * i16::MAX as f32) as i16;
            writer.write_sample(s).map_err(AudioError::Hound)?;
        }
    }
    writer.finalize().map_err(AudioError::Hound)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn mono_mix_averages_channels() {
        let data = Array2::from_shape_vec((2, 3), vec![1.0, 0.0, -1.0, 0.0, 1.0, -1.0]).unwrap();
        let mono = to_mono(data.view());
        assert_eq!(mono.dim(), (1, 3));
        assert_relative_eq!(mono[(0, 0)], 0.5);
        assert_relative_eq!(mono[(0, 2)], -1.0);
    }

    #[test]
    fn prepare_without_resampling_keeps_data() {
        let data = Array2::from_shape_vec((1, 4), vec![0.1, 0.2, 0.3, 0.4]).unwrap();
        let (out, spec) = prepare(data.view(), 16000, Some(16000), true).unwrap();
        assert_eq!(out, data);
        assert_eq!(spec.sample_rate, 16000);
    }

    #[test]
    fn resample_halves_length() {
        let y = tone(440.0, 32000, 0.5);
        let data = Array2::from_shape_vec((1, y.len()), y).unwrap();
        let out = resample(&data, 32000, 16000).unwrap();
        let expected = 8000usize;
        assert!(out.ncols() <= expected && out.ncols() + 1100 >= expected);
    }

    #[test]
    fn wav_roundtrip_through_decoder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let y = tone(440.0, 16000, 0.25);
        let data = Array2::from_shape_vec((1, y.len()), y.iter().map(|v| v * 0.5).collect())
            .unwrap();
        save_wav(&path, &data, 16000).unwrap();
        let (loaded, spec) = load_audio(&path, None, true).unwrap();
        assert_eq!(spec.sample_rate, 16000);
        assert_eq!(loaded.ncols(), data.ncols());
        assert_relative_eq!(loaded[(0, 100)], data[(0, 100)], epsilon = 1e-3);
    }

    #[test]
    fn rejects_empty_and_nan() {
        let empty = Array2::<f32>::zeros((1, 0));
        assert!(matches!(valid_audio(empty.view()), Err(crate::Error::EmptyAudio)));
        let nan = Array2::from_elem((1, 3), f32::NAN);
        assert!(matches!(valid_audio(nan.view()), Err(crate::Error::NonFiniteAudio)));
    }
}
