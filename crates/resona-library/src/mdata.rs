//! The `.mdata` binary bundle format.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! magic "MDAT" | version u16
//! name str | tagline str | author str | url opt-str | minor_version u32
//! file table:  u32 count, then { path str, offset u64, len u64 }
//! ir table:    u32 count, then { name str, path str }
//! inst table:  u32 count, then { name str, folders opt-str, description
//!              opt-str, waveform opt-str, u16 tag count + tags,
//!              u32 region count + regions }
//! region:      path str | root_key u8 | key lo,hi u8 | vel lo,hi u8 |
//!              loop opt { start i64, end i64, crossfade u32, ping_pong u8 } |
//!              round_robin opt u32
//! data pool:   raw bytes; file-table offsets are relative to pool start
//! ```
//!
//! `str` is a u16 length prefix followed by UTF-8 bytes; `opt-*` is a u8
//! presence flag.

use std::collections::HashMap;
use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::model::{
    FileFormat, FileSource, ImpulseResponse, Instrument, KeyRange, Library, LibraryError, Loop,
    PoolBacking, Region,
};

const MAGIC: &[u8; 4] = b"MDAT";
const VERSION: u16 = 1;

pub const MDATA_EXTENSION: &str = "mdata";

/// Parse a bundle from disk. The whole header is read eagerly; pool audio is
/// read lazily through [`Library::open_audio`].
pub fn read(path: &Path) -> Result<Library, LibraryError> {
    let bytes = fs::read(path)?;
    parse(&bytes, path, PoolBacking::File(path.to_path_buf()))
}

/// Parse a bundle held entirely in memory. Used for tests and for bundles
/// that were already read for hashing.
pub fn read_from_memory(bytes: Arc<[u8]>, virtual_path: &Path) -> Result<Library, LibraryError> {
    parse(&bytes.clone(), virtual_path, PoolBacking::Memory(bytes))
}

fn parse(bytes: &[u8], path: &Path, backing: PoolBacking) -> Result<Library, LibraryError> {
    let mut cursor = Cursor::new(bytes);

    let mut magic = [0u8; 4];
    cursor.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(LibraryError::Mdata("bad magic".into()));
    }
    let version = cursor.read_u16::<LittleEndian>()?;
    if version != VERSION {
        return Err(LibraryError::Mdata(format!(
            "unsupported version {version}"
        )));
    }

    let name = read_str(&mut cursor)?;
    let tagline = read_str(&mut cursor)?;
    let author = read_str(&mut cursor)?;
    let url = read_opt_str(&mut cursor)?;
    let minor_version = cursor.read_u32::<LittleEndian>()?;

    let file_count = cursor.read_u32::<LittleEndian>()?;
    let mut entries = HashMap::with_capacity(file_count as usize);
    for _ in 0..file_count {
        let file_path = read_str(&mut cursor)?;
        let offset = cursor.read_u64::<LittleEndian>()?;
        let len = cursor.read_u64::<LittleEndian>()?;
        entries.insert(file_path, (offset, len));
    }

    let ir_count = cursor.read_u32::<LittleEndian>()?;
    let mut irs_by_name = HashMap::with_capacity(ir_count as usize);
    for _ in 0..ir_count {
        let ir_name = read_str(&mut cursor)?;
        let ir_path = read_str(&mut cursor)?;
        irs_by_name.insert(
            ir_name.clone(),
            ImpulseResponse {
                name: ir_name,
                path: ir_path,
            },
        );
    }

    let inst_count = cursor.read_u32::<LittleEndian>()?;
    let mut instruments_by_name = HashMap::with_capacity(inst_count as usize);
    for _ in 0..inst_count {
        let inst = read_instrument(&mut cursor)?;
        instruments_by_name.insert(inst.name.clone(), Arc::new(inst));
    }

    let pool_offset = cursor.position();
    let pool_len = bytes.len() as u64 - pool_offset;
    for (file_path, &(offset, len)) in &entries {
        // checked_add: a crafted offset near u64::MAX must not wrap past
        // the bounds check.
        if offset.checked_add(len).map_or(true, |end| end > pool_len) {
            return Err(LibraryError::Mdata(format!(
                "file entry \"{file_path}\" reaches past the data pool"
            )));
        }
    }

    Ok(Library {
        name,
        tagline,
        author,
        url,
        minor_version,
        path: path.to_path_buf(),
        file_hash: 0,
        format: FileFormat::Mdata,
        instruments_by_name,
        irs_by_name,
        source: FileSource::Pool {
            backing,
            pool_offset,
            entries,
        },
    })
}

fn read_instrument(cursor: &mut Cursor<&[u8]>) -> Result<Instrument, LibraryError> {
    let name = read_str(cursor)?;
    let folders = read_opt_str(cursor)?;
    let description = read_opt_str(cursor)?;
    let waveform_path = read_opt_str(cursor)?;

    let tag_count = cursor.read_u16::<LittleEndian>()?;
    let mut tags = Vec::with_capacity(tag_count as usize);
    for _ in 0..tag_count {
        tags.push(read_str(cursor)?);
    }

    let region_count = cursor.read_u32::<LittleEndian>()?;
    let mut regions = Vec::with_capacity(region_count as usize);
    for _ in 0..region_count {
        regions.push(read_region(cursor)?);
    }

    Ok(Instrument {
        name,
        folders,
        description,
        tags,
        waveform_path,
        regions,
    })
}

fn read_region(cursor: &mut Cursor<&[u8]>) -> Result<Region, LibraryError> {
    let path = read_str(cursor)?;
    let root_key = cursor.read_u8()?;
    let key_range = KeyRange::new(cursor.read_u8()?, cursor.read_u8()?);
    let velocity_range = KeyRange::new(cursor.read_u8()?, cursor.read_u8()?);
    let loop_ = if cursor.read_u8()? != 0 {
        Some(Loop {
            start_frame: cursor.read_i64::<LittleEndian>()?,
            end_frame: cursor.read_i64::<LittleEndian>()?,
            crossfade_frames: cursor.read_u32::<LittleEndian>()?,
            ping_pong: cursor.read_u8()? != 0,
        })
    } else {
        None
    };
    let round_robin = if cursor.read_u8()? != 0 {
        Some(cursor.read_u32::<LittleEndian>()?)
    } else {
        None
    };
    Ok(Region {
        path,
        root_key,
        key_range,
        velocity_range,
        loop_,
        round_robin,
    })
}

fn read_str(cursor: &mut Cursor<&[u8]>) -> Result<String, LibraryError> {
    let len = cursor.read_u16::<LittleEndian>()? as usize;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| LibraryError::Mdata("invalid utf-8 string".into()))
}

fn read_opt_str(cursor: &mut Cursor<&[u8]>) -> Result<Option<String>, LibraryError> {
    if cursor.read_u8()? != 0 {
        Ok(Some(read_str(cursor)?))
    } else {
        Ok(None)
    }
}

/// Builds `.mdata` bundles. Used by tests and packaging tools.
pub struct BundleBuilder {
    name: String,
    tagline: String,
    author: String,
    url: Option<String>,
    minor_version: u32,
    files: Vec<(String, Vec<u8>)>,
    irs: Vec<ImpulseResponse>,
    instruments: Vec<Instrument>,
}

impl BundleBuilder {
    pub fn new(name: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tagline: String::new(),
            author: author.into(),
            url: None,
            minor_version: 1,
            files: Vec::new(),
            irs: Vec::new(),
            instruments: Vec::new(),
        }
    }

    pub fn tagline(mut self, tagline: impl Into<String>) -> Self {
        self.tagline = tagline.into();
        self
    }

    /// Embed an audio file in the bundle's data pool.
    pub fn file(mut self, path: impl Into<String>, bytes: Vec<u8>) -> Self {
        self.files.push((path.into(), bytes));
        self
    }

    pub fn impulse_response(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.irs.push(ImpulseResponse {
            name: name.into(),
            path: path.into(),
        });
        self
    }

    pub fn instrument(mut self, instrument: Instrument) -> Self {
        self.instruments.push(instrument);
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Writes into a Vec, so the io errors below are unreachable.
        let mut out = Vec::new();
        self.write_to(&mut out)
            .unwrap_or_else(|_| unreachable!("writing to a Vec cannot fail"));
        out
    }

    pub fn write_to_file(&self, path: &Path) -> std::io::Result<()> {
        fs::write(path, self.to_bytes())
    }

    fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(MAGIC)?;
        w.write_u16::<LittleEndian>(VERSION)?;
        write_str(w, &self.name)?;
        write_str(w, &self.tagline)?;
        write_str(w, &self.author)?;
        write_opt_str(w, self.url.as_deref())?;
        w.write_u32::<LittleEndian>(self.minor_version)?;

        w.write_u32::<LittleEndian>(self.files.len() as u32)?;
        let mut offset = 0u64;
        for (path, bytes) in &self.files {
            write_str(w, path)?;
            w.write_u64::<LittleEndian>(offset)?;
            w.write_u64::<LittleEndian>(bytes.len() as u64)?;
            offset += bytes.len() as u64;
        }

        w.write_u32::<LittleEndian>(self.irs.len() as u32)?;
        for ir in &self.irs {
            write_str(w, &ir.name)?;
            write_str(w, &ir.path)?;
        }

        w.write_u32::<LittleEndian>(self.instruments.len() as u32)?;
        for inst in &self.instruments {
            write_instrument(w, inst)?;
        }

        for (_, bytes) in &self.files {
            w.write_all(bytes)?;
        }
        Ok(())
    }
}

fn write_instrument<W: Write>(w: &mut W, inst: &Instrument) -> std::io::Result<()> {
    write_str(w, &inst.name)?;
    write_opt_str(w, inst.folders.as_deref())?;
    write_opt_str(w, inst.description.as_deref())?;
    write_opt_str(w, inst.waveform_path.as_deref())?;
    w.write_u16::<LittleEndian>(inst.tags.len() as u16)?;
    for tag in &inst.tags {
        write_str(w, tag)?;
    }
    w.write_u32::<LittleEndian>(inst.regions.len() as u32)?;
    for region in &inst.regions {
        write_region(w, region)?;
    }
    Ok(())
}

fn write_region<W: Write>(w: &mut W, region: &Region) -> std::io::Result<()> {
    write_str(w, &region.path)?;
    w.write_u8(region.root_key)?;
    w.write_u8(region.key_range.start)?;
    w.write_u8(region.key_range.end)?;
    w.write_u8(region.velocity_range.start)?;
    w.write_u8(region.velocity_range.end)?;
    match &region.loop_ {
        Some(loop_) => {
            w.write_u8(1)?;
            w.write_i64::<LittleEndian>(loop_.start_frame)?;
            w.write_i64::<LittleEndian>(loop_.end_frame)?;
            w.write_u32::<LittleEndian>(loop_.crossfade_frames)?;
            w.write_u8(loop_.ping_pong as u8)?;
        }
        None => w.write_u8(0)?,
    }
    match region.round_robin {
        Some(index) => {
            w.write_u8(1)?;
            w.write_u32::<LittleEndian>(index)?;
        }
        None => w.write_u8(0)?,
    }
    Ok(())
}

fn write_str<W: Write>(w: &mut W, s: &str) -> std::io::Result<()> {
    w.write_u16::<LittleEndian>(s.len() as u16)?;
    w.write_all(s.as_bytes())
}

fn write_opt_str<W: Write>(w: &mut W, s: Option<&str>) -> std::io::Result<()> {
    match s {
        Some(s) => {
            w.write_u8(1)?;
            write_str(w, s)
        }
        None => w.write_u8(0),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::model::AudioSource;

    fn sample_instrument() -> Instrument {
        let mut inst = Instrument::new("Plucked");
        inst.tags = vec!["plucked".into(), "bright".into()];
        inst.waveform_path = Some("a.wav".into());
        inst.regions = vec![
            Region {
                loop_: Some(Loop {
                    start_frame: 10,
                    end_frame: -1,
                    crossfade_frames: 32,
                    ping_pong: true,
                }),
                round_robin: Some(2),
                ..Region::spanning("a.wav")
            },
            Region::spanning("b.wav"),
        ];
        inst
    }

    #[test]
    fn bundle_round_trips() {
        let bytes = BundleBuilder::new("Round Trip", "Tests")
            .tagline("a test bundle")
            .file("a.wav", vec![1, 2, 3, 4])
            .file("b.wav", vec![5, 6])
            .impulse_response("Hall", "a.wav")
            .instrument(sample_instrument())
            .to_bytes();

        let lib = read_from_memory(bytes.into(), Path::new("round_trip.mdata")).unwrap();
        assert_eq!(lib.name, "Round Trip");
        assert_eq!(lib.author, "Tests");
        assert_eq!(lib.format, FileFormat::Mdata);
        assert_eq!(lib.irs_by_name.len(), 1);

        let inst = lib.instruments_by_name.get("Plucked").unwrap();
        assert_eq!(**inst, sample_instrument());

        match lib.open_audio("b.wav").unwrap() {
            AudioSource::Memory(bytes) => assert_eq!(&bytes[..], &[5, 6]),
            AudioSource::File(_) => panic!("pool audio should resolve to memory"),
        }
    }

    #[test]
    fn rejects_truncated_bundles() {
        let bytes = BundleBuilder::new("Broken", "Tests")
            .file("a.wav", vec![0; 16])
            .to_bytes();
        let truncated = &bytes[..bytes.len() - 8];
        assert!(matches!(
            read_from_memory(truncated.to_vec().into(), Path::new("broken.mdata")),
            Err(LibraryError::Mdata(_))
        ));
    }

    #[test]
    fn rejects_overflowing_file_table_entries() {
        // offset + len would wrap; the bounds check must not.
        let mut bytes = Vec::new();
        bytes.extend_from_slice(MAGIC);
        bytes.write_u16::<LittleEndian>(VERSION).unwrap();
        write_str(&mut bytes, "Crafted").unwrap();
        write_str(&mut bytes, "").unwrap();
        write_str(&mut bytes, "Tests").unwrap();
        write_opt_str(&mut bytes, None).unwrap();
        bytes.write_u32::<LittleEndian>(1).unwrap();
        bytes.write_u32::<LittleEndian>(1).unwrap();
        write_str(&mut bytes, "a.wav").unwrap();
        bytes.write_u64::<LittleEndian>(u64::MAX).unwrap();
        bytes.write_u64::<LittleEndian>(2).unwrap();
        bytes.write_u32::<LittleEndian>(0).unwrap();
        bytes.write_u32::<LittleEndian>(0).unwrap();
        bytes.extend_from_slice(&[0u8; 8]);

        assert!(matches!(
            read_from_memory(bytes.into(), Path::new("crafted.mdata")),
            Err(LibraryError::Mdata(_))
        ));
    }

    #[test]
    fn rejects_bad_magic() {
        assert!(matches!(
            read_from_memory(vec![0u8; 64].into(), Path::new("zeros.mdata")),
            Err(LibraryError::Mdata(_))
        ));
    }
}
