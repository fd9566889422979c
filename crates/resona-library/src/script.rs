//! The scripted library format: a directory containing a `config.rhai`
//! descriptor plus loose audio files. The script is evaluated with hard
//! execution and data-size budgets and must produce a map:
//!
//! ```rhai
//! #{
//!     name: "My Library",
//!     author: "Someone",
//!     tagline: "strings and things",         // optional
//!     instruments: [
//!         #{
//!             name: "Single Sample",
//!             regions: [
//!                 #{ path: "samples/a.wav", root_key: 60 },
//!             ],
//!         },
//!     ],
//!     impulse_responses: [
//!         #{ name: "Hall", path: "irs/hall.wav" },
//!     ],
//! }
//! ```
//!
//! Region maps may also carry `key_range: [lo, hi]`, `velocity_range:
//! [lo, hi]`, `round_robin`, and `loop_points: #{ start, end, crossfade,
//! ping_pong }`. (`loop` itself is a rhai keyword, hence the longer name.)

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use rhai::{Dynamic, Engine, EvalAltResult, Map};

use crate::model::{
    FileFormat, FileSource, ImpulseResponse, Instrument, KeyRange, Library, LibraryError, Loop,
    Region, ScriptError,
};

/// Descriptor filename that marks a directory as a scripted library.
pub const SCRIPT_FILE_NAME: &str = "config.rhai";

const MAX_OPERATIONS: u64 = 5_000_000;
const MAX_DATA_SIZE: usize = 100_000;

/// Read a scripted library; `config_path` is the `config.rhai` file, and
/// audio paths resolve relative to its directory.
pub fn read(config_path: &Path) -> Result<Library, LibraryError> {
    let source = fs::read_to_string(config_path)?;
    let root = config_path
        .parent()
        .ok_or_else(|| ScriptError::Runtime("library descriptor has no parent directory".into()))?;

    let map = evaluate(&source)?;

    let name = required_str(&map, "name")?;
    let author = required_str(&map, "author")?;
    let tagline = optional_str(&map, "tagline")?.unwrap_or_default();
    let url = optional_str(&map, "url")?;
    let minor_version = optional_int(&map, "minor_version")?.unwrap_or(1) as u32;

    let mut instruments_by_name = HashMap::new();
    for entry in optional_array(&map, "instruments")? {
        let inst = parse_instrument(as_map(entry, "instrument")?)?;
        instruments_by_name.insert(inst.name.clone(), Arc::new(inst));
    }

    let mut irs_by_name = HashMap::new();
    for entry in optional_array(&map, "impulse_responses")? {
        let ir_map = as_map(entry, "impulse response")?;
        let ir = ImpulseResponse {
            name: required_str(&ir_map, "name")?,
            path: required_str(&ir_map, "path")?,
        };
        irs_by_name.insert(ir.name.clone(), ir);
    }

    Ok(Library {
        name,
        tagline,
        author,
        url,
        minor_version,
        path: config_path.to_path_buf(),
        file_hash: 0,
        format: FileFormat::Script,
        instruments_by_name,
        irs_by_name,
        source: FileSource::Directory {
            root: root.to_path_buf(),
        },
    })
}

fn evaluate(source: &str) -> Result<Map, ScriptError> {
    let mut engine = Engine::new();
    engine.set_max_operations(MAX_OPERATIONS);
    engine.set_max_array_size(MAX_DATA_SIZE);
    engine.set_max_map_size(MAX_DATA_SIZE);
    engine.set_max_string_size(MAX_DATA_SIZE);

    let ast = engine
        .compile(source)
        .map_err(|e| ScriptError::Syntax(e.to_string()))?;
    engine.eval_ast::<Map>(&ast).map_err(|e| match *e {
        EvalAltResult::ErrorTooManyOperations(_) => ScriptError::Timeout,
        EvalAltResult::ErrorDataTooLarge(..) => ScriptError::Memory,
        other => ScriptError::Runtime(other.to_string()),
    })
}

fn parse_instrument(map: Map) -> Result<Instrument, ScriptError> {
    let mut inst = Instrument::new(required_str(&map, "name")?);
    inst.folders = optional_str(&map, "folders")?;
    inst.description = optional_str(&map, "description")?;
    inst.waveform_path = optional_str(&map, "waveform")?;
    for tag in optional_array(&map, "tags")? {
        inst.tags.push(as_str(tag, "tag")?);
    }
    for entry in optional_array(&map, "regions")? {
        inst.regions.push(parse_region(as_map(entry, "region")?)?);
    }
    Ok(inst)
}

fn parse_region(map: Map) -> Result<Region, ScriptError> {
    let mut region = Region::spanning(required_str(&map, "path")?);
    if let Some(root) = optional_int(&map, "root_key")? {
        region.root_key = int_to_u8(root, "root_key")?;
    }
    if let Some(range) = optional_range(&map, "key_range")? {
        region.key_range = range;
    }
    if let Some(range) = optional_range(&map, "velocity_range")? {
        region.velocity_range = range;
    }
    if let Some(index) = optional_int(&map, "round_robin")? {
        region.round_robin = Some(index as u32);
    }
    if let Some(value) = map.get("loop_points") {
        let loop_map = as_map(value.clone(), "loop_points")?;
        region.loop_ = Some(Loop {
            start_frame: optional_int(&loop_map, "start")?.unwrap_or(0),
            end_frame: optional_int(&loop_map, "end")?.unwrap_or(-1),
            crossfade_frames: optional_int(&loop_map, "crossfade")?.unwrap_or(0) as u32,
            ping_pong: loop_map
                .get("ping_pong")
                .map(|v| v.as_bool().unwrap_or(false))
                .unwrap_or(false),
        });
    }
    Ok(region)
}

fn required_str(map: &Map, key: &str) -> Result<String, ScriptError> {
    match optional_str(map, key)? {
        Some(value) => Ok(value),
        None => Err(ScriptError::Runtime(format!("missing field \"{key}\""))),
    }
}

fn optional_str(map: &Map, key: &str) -> Result<Option<String>, ScriptError> {
    match map.get(key) {
        Some(value) => Ok(Some(as_str(value.clone(), key)?)),
        None => Ok(None),
    }
}

fn optional_int(map: &Map, key: &str) -> Result<Option<i64>, ScriptError> {
    match map.get(key) {
        Some(value) => value
            .as_int()
            .map(Some)
            .map_err(|actual| type_error(key, "integer", actual)),
        None => Ok(None),
    }
}

fn optional_array(map: &Map, key: &str) -> Result<Vec<Dynamic>, ScriptError> {
    match map.get(key) {
        Some(value) => value
            .clone()
            .into_array()
            .map_err(|actual| type_error(key, "array", actual)),
        None => Ok(Vec::new()),
    }
}

fn optional_range(map: &Map, key: &str) -> Result<Option<KeyRange>, ScriptError> {
    let Some(values) = map.get(key) else {
        return Ok(None);
    };
    let values = values
        .clone()
        .into_array()
        .map_err(|actual| type_error(key, "[lo, hi] array", actual))?;
    if values.len() != 2 {
        return Err(ScriptError::Runtime(format!(
            "\"{key}\" must be a two-element [lo, hi] array"
        )));
    }
    let lo = values[0]
        .as_int()
        .map_err(|actual| type_error(key, "integer", actual))?;
    let hi = values[1]
        .as_int()
        .map_err(|actual| type_error(key, "integer", actual))?;
    Ok(Some(KeyRange::new(
        int_to_u8(lo, key)?,
        int_to_u8(hi, key)?,
    )))
}

fn as_map(value: Dynamic, what: &str) -> Result<Map, ScriptError> {
    value
        .try_cast::<Map>()
        .ok_or_else(|| ScriptError::Runtime(format!("expected {what} to be a map")))
}

fn as_str(value: Dynamic, what: &str) -> Result<String, ScriptError> {
    value
        .into_string()
        .map_err(|actual| type_error(what, "string", actual))
}

fn int_to_u8(value: i64, what: &str) -> Result<u8, ScriptError> {
    u8::try_from(value)
        .map_err(|_| ScriptError::Runtime(format!("\"{what}\" value {value} is out of range")))
}

fn type_error(key: &str, expected: &str, actual: &str) -> ScriptError {
    ScriptError::Runtime(format!("\"{key}\" should be a {expected}, got {actual}"))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;

    fn read_script(source: &str) -> Result<Library, LibraryError> {
        let dir = tempdir().unwrap();
        let config = dir.path().join(SCRIPT_FILE_NAME);
        fs::write(&config, source).unwrap();
        read(&config)
    }

    #[test]
    fn parses_a_full_descriptor() {
        let lib = read_script(
            r#"
            let samples = ["samples/a.wav", "samples/b.wav"];
            #{
                name: "Test Script",
                author: "Tests",
                tagline: "scripted",
                instruments: [
                    #{
                        name: "Two Keys",
                        waveform: samples[0],
                        regions: [
                            #{ path: samples[0], root_key: 48, key_range: [0, 64] },
                            #{ path: samples[1], root_key: 72, key_range: [64, 128],
                               loop_points: #{ start: 100, end: -1, crossfade: 16,
                                               ping_pong: true } },
                        ],
                    },
                ],
                impulse_responses: [
                    #{ name: "Hall", path: "irs/hall.wav" },
                ],
            }
            "#,
        )
        .unwrap();

        assert_eq!(lib.name, "Test Script");
        assert_eq!(lib.format, FileFormat::Script);
        let inst = lib.instruments_by_name.get("Two Keys").unwrap();
        assert_eq!(inst.regions.len(), 2);
        assert_eq!(inst.regions[0].key_range, KeyRange::new(0, 64));
        assert_eq!(
            inst.regions[1].loop_,
            Some(Loop {
                start_frame: 100,
                end_frame: -1,
                crossfade_frames: 16,
                ping_pong: true,
            })
        );
        assert!(lib.irs_by_name.contains_key("Hall"));
    }

    #[test]
    fn syntax_errors_are_distinguished() {
        assert!(matches!(
            read_script("#{ name: "),
            Err(LibraryError::Script(ScriptError::Syntax(_)))
        ));
    }

    #[test]
    fn missing_fields_are_runtime_errors() {
        assert!(matches!(
            read_script(r#"#{ name: "No Author" }"#),
            Err(LibraryError::Script(ScriptError::Runtime(_)))
        ));
    }

    #[test]
    fn runaway_scripts_hit_the_execution_budget() {
        assert!(matches!(
            read_script(r#"let x = 0; while true { x += 1; } #{ name: "n", author: "a" }"#),
            Err(LibraryError::Script(ScriptError::Timeout))
        ));
    }
}
