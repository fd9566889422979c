//! Audio decoding for Resona: bytes in, interleaved f32 samples out.
//!
//! Decoding is a black box to the rest of the system; only this crate knows
//! about symphonia. Sources are either files on disk or in-memory blobs
//! (library bundles embed their audio, the built-in library is generated).

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Symphonia(#[from] SymphoniaError),
    #[error("no supported audio tracks found in source")]
    NoSupportedTracks,
}

/// A fully decoded audio file: interleaved f32 samples.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioData {
    pub sample_rate: u32,
    pub channels: u32,
    pub frames: u64,
    pub interleaved: Vec<f32>,
}

impl AudioData {
    pub fn ram_usage_bytes(&self) -> u64 {
        (self.interleaved.len() * std::mem::size_of::<f32>()) as u64
    }

    /// Samples of one frame, across all channels.
    pub fn frame(&self, index: u64) -> &[f32] {
        let start = (index * self.channels as u64) as usize;
        &self.interleaved[start..start + self.channels as usize]
    }
}

/// Decode a file on disk.
pub fn decode_path(path: &Path) -> Result<AudioData, DecodeError> {
    let file = File::open(path)?;
    decode_source(file, Some(path))
}

/// Decode an in-memory blob; `hint_path` supplies the extension hint.
pub fn decode_bytes(bytes: Arc<[u8]>, hint_path: Option<&Path>) -> Result<AudioData, DecodeError> {
    decode_source(MemorySource::new(bytes), hint_path)
}

/// Decode from any seekable source.
pub fn decode_source<R>(reader: R, hint_path: Option<&Path>) -> Result<AudioData, DecodeError>
where
    R: MediaSource + 'static,
{
    let mss = MediaSourceStream::new(Box::new(reader), Default::default());
    let mut hint = Hint::new();
    if let Some(path) = hint_path {
        if let Some(ext) = path.extension().and_then(|ext| ext.to_str()) {
            hint.with_extension(ext);
        }
    }

    let probed = symphonia::default::get_probe().format(
        &hint,
        mss,
        &FormatOptions::default(),
        &MetadataOptions::default(),
    )?;

    let mut format = probed.format;
    let (codec_params, track_id) = {
        let track = format
            .default_track()
            .ok_or(DecodeError::NoSupportedTracks)?;
        (track.codec_params.clone(), track.id)
    };

    let mut decoder =
        symphonia::default::get_codecs().make(&codec_params, &DecoderOptions::default())?;

    let mut sample_rate = codec_params.sample_rate.unwrap_or(48_000);
    let mut channels = codec_params.channels.map(|c| c.count()).unwrap_or(1) as u32;
    let mut interleaved = Vec::new();
    let mut sample_buffer: Option<SampleBuffer<f32>> = None;

    // The final next_packet error is the normal end-of-stream signal.
    while let Ok(packet) = format.next_packet() {
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = decoder.decode(&packet)?;
        let spec = *decoded.spec();
        sample_rate = spec.rate;
        channels = spec.channels.count() as u32;

        let buf = sample_buffer
            .get_or_insert_with(|| SampleBuffer::<f32>::new(decoded.capacity() as u64, spec));
        buf.copy_interleaved_ref(decoded);
        interleaved.extend_from_slice(buf.samples());
    }

    let frames = if channels == 0 {
        0
    } else {
        interleaved.len() as u64 / channels as u64
    };
    Ok(AudioData {
        sample_rate,
        channels,
        frames,
        interleaved,
    })
}

/// Seekable in-memory source for symphonia.
struct MemorySource {
    cursor: Cursor<Arc<[u8]>>,
}

impl MemorySource {
    fn new(bytes: Arc<[u8]>) -> Self {
        Self {
            cursor: Cursor::new(bytes),
        }
    }
}

impl Read for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemorySource {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl MediaSource for MemorySource {
    fn is_seekable(&self) -> bool {
        true
    }

    fn byte_len(&self) -> Option<u64> {
        Some(self.cursor.get_ref().len() as u64)
    }
}

/// Convenience used by tests across the workspace: render an in-memory WAV
/// with a recognisable ramp so decoded content can be asserted on.
pub fn test_wav(frames: u32, channels: u16, sample_rate: u32) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("in-memory wav");
        for frame in 0..frames {
            for channel in 0..channels {
                let value = (frame as f32 / frames.max(1) as f32) * 0.5
                    + channel as f32 * 0.001;
                writer.write_sample(value).expect("in-memory wav");
            }
        }
        writer.finalize().expect("in-memory wav");
    }
    cursor.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_wav_from_memory() {
        let bytes = test_wav(256, 2, 44_100);
        let audio = decode_bytes(bytes.into(), Some(Path::new("test.wav"))).unwrap();
        assert_eq!(audio.channels, 2);
        assert_eq!(audio.sample_rate, 44_100);
        assert_eq!(audio.frames, 256);
        assert_eq!(audio.interleaved.len(), 512);
        // ramp starts at zero
        assert!(audio.frame(0)[0].abs() < 1e-6);
        assert!(audio.frame(255)[0] > 0.4);
    }

    #[test]
    fn decodes_wav_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path: PathBuf = dir.path().join("ramp.wav");
        std::fs::write(&path, test_wav(64, 1, 48_000)).unwrap();
        let audio = decode_path(&path).unwrap();
        assert_eq!(audio.frames, 64);
        assert_eq!(audio.channels, 1);
    }

    #[test]
    fn garbage_bytes_fail_to_probe() {
        let result = decode_bytes(vec![0u8; 128].into(), Some(Path::new("junk.wav")));
        assert!(result.is_err());
    }
}
