//! Binary checkpoint helpers and the named checkpoint store.
//!
//! Checkpoint images are `MAGIC`, a u32 version, then a sequence of
//! `tag: [u8;4] | len: u32 | payload` chunks. Readers skip chunks they do
//! not recognize.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::NetworkError;

pub const MAGIC: &[u8; 8] = b"PITSIM01";
pub const VERSION_CURRENT: u32 = 1;

/// File extension for checkpoints kept on disk.
pub const CHECKPOINT_EXT: &str = "wts";

pub fn compress_lz4(input: &[u8]) -> Vec<u8> {
    lz4_flex::compress(input)
}

pub fn decompress_lz4(input: &[u8], expected_size: usize) -> io::Result<Vec<u8>> {
    lz4_flex::decompress(input, expected_size)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "lz4 decompression failed"))
}

/// Byte counter; sizes an image without allocating it.
#[derive(Debug, Default)]
pub struct CountingWriter {
    written: usize,
}

impl CountingWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written = self.written.saturating_add(buf.len());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_f32_le<W: Write>(w: &mut W, v: f32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_u32_le(w, len_u32(s.len())?)?;
    w.write_all(s.as_bytes())
}

/// Length-prefixed f32 slice.
pub fn write_f32s<W: Write>(w: &mut W, values: &[f32]) -> io::Result<()> {
    write_u32_le(w, len_u32(values.len())?)?;
    for &v in values {
        write_f32_le(w, v)?;
    }
    Ok(())
}

pub fn read_exact<const N: usize, R: Read>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn read_f32_le<R: Read>(r: &mut R) -> io::Result<f32> {
    Ok(f32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn read_string<R: Read>(r: &mut R) -> io::Result<String> {
    let n = read_u32_le(r)? as usize;
    let mut buf = vec![0u8; n];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "invalid utf-8 string"))
}

pub fn read_f32s<R: Read>(r: &mut R) -> io::Result<Vec<f32>> {
    let n = read_u32_le(r)? as usize;
    (0..n).map(|_| read_f32_le(r)).collect()
}

fn len_u32(len: usize) -> io::Result<u32> {
    u32::try_from(len).map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "length overflows u32"))
}

pub fn write_header<W: Write>(w: &mut W) -> io::Result<()> {
    w.write_all(MAGIC)?;
    write_u32_le(w, VERSION_CURRENT)
}

pub fn read_header<R: Read>(r: &mut R) -> io::Result<u32> {
    let magic = read_exact::<8, _>(r)?;
    if &magic != MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "bad checkpoint magic",
        ));
    }
    let version = read_u32_le(r)?;
    if version != VERSION_CURRENT {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported checkpoint version {version}"),
        ));
    }
    Ok(version)
}

pub fn write_chunk<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    w.write_all(&tag)?;
    write_u32_le(w, len_u32(payload.len())?)?;
    w.write_all(payload)
}

/// LZ4 chunk: `len` covers a u32 uncompressed length plus the compressed block.
pub fn write_chunk_lz4<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    let compressed = compress_lz4(payload);
    let total_len = 4u32.saturating_add(len_u32(compressed.len())?);

    w.write_all(&tag)?;
    write_u32_le(w, total_len)?;
    write_u32_le(w, len_u32(payload.len())?)?;
    w.write_all(&compressed)
}

/// Payload of an LZ4 chunk whose header was already consumed.
pub fn read_chunk_lz4<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let uncompressed_len = read_u32_le(r)? as usize;
    let mut compressed = Vec::new();
    r.read_to_end(&mut compressed)?;
    decompress_lz4(&compressed, uncompressed_len)
}

pub fn read_chunk_header<R: Read>(r: &mut R) -> io::Result<([u8; 4], u32)> {
    let tag = read_exact::<4, _>(r)?;
    let len = read_u32_le(r)?;
    Ok((tag, len))
}

/// Visit every chunk in `r` until EOF. The visitor receives a reader limited
/// to the chunk payload; bytes it leaves unread are skipped.
pub fn for_each_chunk<R, F>(r: &mut R, mut visit: F) -> io::Result<()>
where
    R: Read,
    F: FnMut([u8; 4], &mut io::Take<&mut R>) -> io::Result<()>,
{
    loop {
        let (tag, len) = match read_chunk_header(r) {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        let mut take = r.by_ref().take(len as u64);
        visit(tag, &mut take)?;
        io::copy(&mut take, &mut io::sink())?;
    }
    Ok(())
}

/// Named weight snapshots, in memory or as `<dir>/<name>.wts` files.
#[derive(Debug, Clone)]
pub enum CheckpointStore {
    Memory(HashMap<String, Vec<u8>>),
    Dir(PathBuf),
}

/// Checkpoint names become file stems under the store directory, so they
/// must be one plain path component.
pub fn check_name(name: &str) -> Result<(), NetworkError> {
    let mut components = Path::new(name).components();
    let single = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !single || name.contains(['/', '\\']) || name.contains("..") {
        return Err(NetworkError::InvalidCheckpointName {
            name: name.to_string(),
        });
    }
    Ok(())
}

impl Default for CheckpointStore {
    fn default() -> Self {
        CheckpointStore::Memory(HashMap::new())
    }
}

impl CheckpointStore {
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn dir(path: impl Into<PathBuf>) -> Self {
        CheckpointStore::Dir(path.into())
    }

    pub fn path_for(dir: &Path, name: &str) -> PathBuf {
        dir.join(format!("{name}.{CHECKPOINT_EXT}"))
    }

    pub fn put(&mut self, name: &str, bytes: Vec<u8>) -> Result<(), NetworkError> {
        check_name(name)?;
        match self {
            CheckpointStore::Memory(map) => {
                map.insert(name.to_string(), bytes);
            }
            CheckpointStore::Dir(dir) => {
                fs::create_dir_all(&*dir)?;
                let path = Self::path_for(dir, name);
                // Write then rename so a reader never sees a partial file.
                let tmp = path.with_extension("tmp");
                fs::write(&tmp, &bytes)?;
                fs::rename(&tmp, &path)?;
                debug!(path = %path.display(), bytes = bytes.len(), "checkpoint written");
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Vec<u8>, NetworkError> {
        check_name(name)?;
        let not_found = || NetworkError::CheckpointNotFound {
            name: name.to_string(),
        };
        match self {
            CheckpointStore::Memory(map) => map.get(name).cloned().ok_or_else(not_found),
            CheckpointStore::Dir(dir) => match fs::read(Self::path_for(dir, name)) {
                Ok(bytes) => Ok(bytes),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Err(not_found()),
                Err(e) => Err(e.into()),
            },
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        if check_name(name).is_err() {
            return false;
        }
        match self {
            CheckpointStore::Memory(map) => map.contains_key(name),
            CheckpointStore::Dir(dir) => Self::path_for(dir, name).is_file(),
        }
    }

    /// Stored checkpoint names, sorted.
    pub fn names(&self) -> io::Result<Vec<String>> {
        let mut names: Vec<String> = match self {
            CheckpointStore::Memory(map) => map.keys().cloned().collect(),
            CheckpointStore::Dir(dir) => {
                if !dir.is_dir() {
                    return Ok(Vec::new());
                }
                let mut names = Vec::new();
                for entry in fs::read_dir(dir)? {
                    let path = entry?.path();
                    if path.extension().and_then(|e| e.to_str()) != Some(CHECKPOINT_EXT) {
                        continue;
                    }
                    if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                        names.push(stem.to_string());
                    }
                }
                names
            }
        };
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_chunks_are_skipped() {
        let mut buf = Vec::new();
        write_header(&mut buf).unwrap();
        write_chunk(&mut buf, *b"XTRA", &[9, 9, 9]).unwrap();
        write_chunk_lz4(&mut buf, *b"DATA", &[7u8; 64]).unwrap();

        let mut r = buf.as_slice();
        assert_eq!(read_header(&mut r).unwrap(), VERSION_CURRENT);
        let mut seen = Vec::new();
        let mut data = Vec::new();
        for_each_chunk(&mut r, |tag, take| {
            seen.push(tag);
            if &tag == b"DATA" {
                data = read_chunk_lz4(take)?;
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![*b"XTRA", *b"DATA"]);
        assert_eq!(data, vec![7u8; 64]);
    }

    #[test]
    fn bad_magic_rejected() {
        let err = read_header(&mut &b"NOTPITSM\x01\0\0\0"[..]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn counting_writer_matches_buffer() {
        let mut buf = Vec::new();
        let mut cw = CountingWriter::new();
        for mut w in [&mut buf as &mut dyn Write, &mut cw] {
            write_string(&mut w, "Hidden1").unwrap();
            write_f32s(&mut w, &[0.5, -1.0]).unwrap();
        }
        assert_eq!(cw.written(), buf.len());
        let mut r = buf.as_slice();
        assert_eq!(read_string(&mut r).unwrap(), "Hidden1");
        assert_eq!(read_f32s(&mut r).unwrap(), vec![0.5, -1.0]);
    }

    #[test]
    fn memory_store_reports_missing() {
        let mut store = CheckpointStore::memory();
        store.put("trained", vec![1, 2]).unwrap();
        assert_eq!(store.get("trained").unwrap(), vec![1, 2]);
        assert!(matches!(
            store.get("nope"),
            Err(NetworkError::CheckpointNotFound { name }) if name == "nope"
        ));
        assert_eq!(store.names().unwrap(), vec!["trained".to_string()]);
    }

    #[test]
    fn dir_store_round_trips_files() {
        let dir = std::env::temp_dir().join(format!("pitsim-store-{}", std::process::id()));
        let mut store = CheckpointStore::dir(&dir);
        store.put("trained", vec![3, 4, 5]).unwrap();
        assert!(CheckpointStore::path_for(&dir, "trained").is_file());
        assert!(store.contains("trained"));
        assert_eq!(store.get("trained").unwrap(), vec![3, 4, 5]);
        assert!(matches!(
            store.get("missing"),
            Err(NetworkError::CheckpointNotFound { .. })
        ));
        assert_eq!(store.names().unwrap(), vec!["trained".to_string()]);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn names_escaping_the_directory_are_rejected() {
        let root = std::env::temp_dir().join(format!("pitsim-escape-{}", std::process::id()));
        let dir = root.join("checkpoints");
        let mut store = CheckpointStore::dir(&dir);
        let outside = root.join("outside");
        let absolute = outside.to_string_lossy().into_owned();
        for name in ["../outside", "a/b", "a\\b", "..", ".", "", absolute.as_str()] {
            assert!(
                matches!(
                    store.put(name, vec![1]),
                    Err(NetworkError::InvalidCheckpointName { .. })
                ),
                "{name:?} accepted"
            );
            assert!(matches!(
                store.get(name),
                Err(NetworkError::InvalidCheckpointName { .. })
            ));
            assert!(!store.contains(name));
        }
        assert!(!outside.with_extension(CHECKPOINT_EXT).exists());
        assert!(!root.join("outside.tmp").exists());

        let mut memory = CheckpointStore::memory();
        assert!(memory.put("../x", vec![1]).is_err());
        assert!(check_name("trained_v2.final").is_ok());
        let _ = fs::remove_dir_all(&root);
    }
}
