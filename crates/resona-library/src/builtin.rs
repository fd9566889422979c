//! The built-in library: a synthetic, always-present library of impulse
//! responses rendered to in-memory WAV once on first use. It participates in
//! the registry like any scanned library, but is never watched nor removed
//! by orphan collection.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::Arc;

use crate::hash::hash_bytes;
use crate::model::{FileFormat, FileSource, ImpulseResponse, Library, MEMORY_PATH};

pub const BUILTIN_LIBRARY_NAME: &str = "Built-in";

struct IrSpec {
    name: &'static str,
    path: &'static str,
    seconds: f32,
    decay: f32,
}

const IRS: &[IrSpec] = &[
    IrSpec {
        name: "Small Room",
        path: "small_room.wav",
        seconds: 0.4,
        decay: 18.0,
    },
    IrSpec {
        name: "Large Hall",
        path: "large_hall.wav",
        seconds: 1.6,
        decay: 4.0,
    },
];

pub fn builtin_library() -> Library {
    let mut blobs: HashMap<String, Arc<[u8]>> = HashMap::new();
    let mut irs_by_name = HashMap::new();
    for spec in IRS {
        blobs.insert(spec.path.to_owned(), render_ir(spec).into());
        irs_by_name.insert(
            spec.name.to_owned(),
            ImpulseResponse {
                name: spec.name.to_owned(),
                path: spec.path.to_owned(),
            },
        );
    }

    Library {
        name: BUILTIN_LIBRARY_NAME.to_owned(),
        tagline: "Built-in impulse responses".to_owned(),
        author: "Resona".to_owned(),
        url: None,
        minor_version: 1,
        path: PathBuf::from(MEMORY_PATH),
        // No backing file to hash; the name stands in for the bytes. The
        // registry's dedup still wants a stable non-zero identity.
        file_hash: hash_bytes(BUILTIN_LIBRARY_NAME.as_bytes()),
        // Unused for a memory-backed library; the registry needs some tag.
        format: FileFormat::Script,
        instruments_by_name: HashMap::new(),
        irs_by_name,
        source: FileSource::Memory { blobs },
    }
}

/// Exponentially decaying noise burst, the classic synthetic IR.
fn render_ir(spec: &IrSpec) -> Vec<u8> {
    const SAMPLE_RATE: u32 = 44_100;
    let frames = (spec.seconds * SAMPLE_RATE as f32) as u32;

    let wav_spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };

    let mut cursor = Cursor::new(Vec::new());
    {
        // Writing into a Vec; hound errors here would mean a format bug.
        let mut writer = hound::WavWriter::new(&mut cursor, wav_spec)
            .unwrap_or_else(|_| unreachable!("in-memory wav header"));
        let mut noise_state: u32 = 0x9e37_79b9 ^ spec.name.len() as u32;
        for frame in 0..frames {
            // xorshift noise, deterministic per IR
            noise_state ^= noise_state << 13;
            noise_state ^= noise_state >> 17;
            noise_state ^= noise_state << 5;
            let noise = (noise_state as f32 / u32::MAX as f32) * 2.0 - 1.0;
            let t = frame as f32 / SAMPLE_RATE as f32;
            let envelope = (-spec.decay * t).exp();
            let _ = writer.write_sample(noise * envelope);
        }
        let _ = writer.finalize();
    }
    cursor.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AudioSource;

    #[test]
    fn builtin_irs_are_present_and_decodable() {
        let lib = builtin_library();
        assert_eq!(lib.name, BUILTIN_LIBRARY_NAME);
        assert_ne!(lib.file_hash, 0);
        assert_eq!(lib.irs_by_name.len(), IRS.len());

        for ir in lib.irs_by_name.values() {
            let source = lib.open_audio(&ir.path).unwrap();
            let bytes = match source {
                AudioSource::Memory(bytes) => bytes,
                AudioSource::File(_) => panic!("built-in IRs live in memory"),
            };
            let audio = resona_audio::decode_bytes(bytes, Some(std::path::Path::new(&ir.path)))
                .unwrap();
            assert!(audio.frames > 0);
            assert_eq!(audio.sample_rate, 44_100);
        }
    }

    #[test]
    fn builtin_library_is_deterministic() {
        let a = builtin_library();
        let b = builtin_library();
        let bytes = |lib: &Library, path: &str| match lib.open_audio(path).unwrap() {
            AudioSource::Memory(bytes) => bytes,
            AudioSource::File(_) => unreachable!(),
        };
        assert_eq!(
            bytes(&a, "small_room.wav")[..],
            bytes(&b, "small_room.wav")[..]
        );
    }
}
