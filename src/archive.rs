use crate::error::{SyncError, SyncResult};
use sha1::{Digest, Sha1};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, BufReader, Read, Seek, SeekFrom, Write},
    path::Path,
};

pub const PRODUCT_ENTRY_MAGIC: u32 = 0x5665_7273;
pub const CHECKSUM_LEN: u64 = 20;
const TRAILER_LEN: u64 = 1 + CHECKSUM_LEN;
const MAX_NAME_LEN: usize = 1024;
const RECORD_FIELDS_LEN: u64 = 5 * 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub packing: u32,
    pub original_size: u32,
    /// Zero for payloads stored in header order; otherwise the absolute
    /// offset of the payload.
    pub reserved: u32,
    pub timestamp: u32,
    pub data_size: u32,
    pub reserved_pos: u64,
    pub offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveLayout {
    pub extensions: Vec<(String, String)>,
    pub entries: Vec<ArchiveEntry>,
    pub header_end: u64,
    pub content_end: u64,
    pub checksum: Option<[u8; 20]>,
}

impl ArchiveLayout {
    pub fn offsets(&self) -> BTreeMap<String, u64> {
        self.entries
            .iter()
            .map(|entry| (entry.name.clone(), entry.offset))
            .collect()
    }

    pub fn entry(&self, name: &str) -> Option<&ArchiveEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }
}

pub fn read_archive(path: &Path) -> SyncResult<ArchiveLayout> {
    let file = File::open(path).map_err(|err| SyncError::from_io(path, "open", err))?;
    let len = file
        .metadata()
        .map_err(|err| SyncError::from_io(path, "stat", err))?
        .len();
    parse_archive(BufReader::new(file), len).map_err(|err| match err {
        SyncError::Format { reason, .. } => SyncError::Format {
            what: format!("archive {:?}", path),
            reason,
        },
        other => other,
    })
}

pub fn parse_archive<R: Read + Seek>(mut reader: R, len: u64) -> SyncResult<ArchiveLayout> {
    let bad = |reason: String| SyncError::format("archive", reason);
    let io_err = |err: io::Error| bad(err.to_string());

    let mut extensions = Vec::new();
    let mut entries = Vec::new();
    let mut first = true;

    loop {
        let record_start = reader.stream_position().map_err(io_err)?;
        let name = read_cstring(&mut reader).map_err(io_err)?;
        let fields_pos = record_start + name.len() as u64 + 1;
        let packing = read_u32(&mut reader).map_err(io_err)?;
        let original_size = read_u32(&mut reader).map_err(io_err)?;
        let reserved = read_u32(&mut reader).map_err(io_err)?;
        let timestamp = read_u32(&mut reader).map_err(io_err)?;
        let data_size = read_u32(&mut reader).map_err(io_err)?;

        if name.is_empty() {
            if first && packing == PRODUCT_ENTRY_MAGIC {
                loop {
                    let key = read_cstring(&mut reader).map_err(io_err)?;
                    if key.is_empty() {
                        break;
                    }
                    let value = read_cstring(&mut reader).map_err(io_err)?;
                    extensions.push((key, value));
                }
                first = false;
                continue;
            }
            break;
        }
        first = false;
        entries.push(ArchiveEntry {
            name,
            packing,
            original_size,
            reserved,
            timestamp,
            data_size,
            reserved_pos: fields_pos + 8,
            offset: 0,
        });
    }

    let header_end = reader.stream_position().map_err(io_err)?;
    let mut cursor = header_end;
    let mut data_end = header_end;
    for entry in &mut entries {
        entry.offset = if entry.reserved != 0 {
            u64::from(entry.reserved)
        } else {
            cursor
        };
        cursor += u64::from(entry.data_size);
        let end = entry.offset + u64::from(entry.data_size);
        if entry.offset < header_end || end > len {
            return Err(bad(format!(
                "subfile {} at {}..{} outside payload area",
                entry.name, entry.offset, end
            )));
        }
        data_end = data_end.max(end).max(cursor);
    }
    if data_end > len {
        return Err(bad(format!("payload ends at {data_end}, file is {len} bytes")));
    }

    let mut checksum = None;
    let mut content_end = len;
    if len >= data_end + TRAILER_LEN {
        reader
            .seek(SeekFrom::Start(len - TRAILER_LEN))
            .map_err(io_err)?;
        let mut trailer = [0u8; TRAILER_LEN as usize];
        reader.read_exact(&mut trailer).map_err(io_err)?;
        if trailer[0] == 0 {
            let mut digest = [0u8; 20];
            digest.copy_from_slice(&trailer[1..]);
            checksum = Some(digest);
            content_end = len - TRAILER_LEN;
        }
    }

    Ok(ArchiveLayout {
        extensions,
        entries,
        header_end,
        content_end,
        checksum,
    })
}

pub fn content_digest(file: &mut File, len: u64) -> io::Result<[u8; 20]> {
    file.seek(SeekFrom::Start(0))?;
    let mut hasher = Sha1::new();
    io::copy(&mut Read::by_ref(file).take(len), &mut hasher)?;
    Ok(hasher.finalize().into())
}

pub fn verify_checksum(path: &Path) -> SyncResult<bool> {
    let layout = read_archive(path)?;
    let Some(stored) = layout.checksum else {
        return Ok(false);
    };
    let mut file = File::open(path).map_err(|err| SyncError::from_io(path, "open", err))?;
    let actual = content_digest(&mut file, layout.content_end)
        .map_err(|err| SyncError::from_io(path, "read", err))?;
    Ok(actual == stored)
}

#[derive(Debug, Default)]
pub struct ArchiveBuilder {
    extensions: Vec<(String, String)>,
    files: Vec<(String, Vec<u8>, u32)>,
}

impl ArchiveBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extension(mut self, key: &str, value: &str) -> Self {
        self.extensions.push((key.to_string(), value.to_string()));
        self
    }

    pub fn file(mut self, name: &str, data: impl Into<Vec<u8>>, timestamp: u32) -> Self {
        self.files.push((name.to_string(), data.into(), timestamp));
        self
    }

    pub fn write(&self, path: &Path) -> SyncResult<()> {
        let write_err = |err: io::Error| SyncError::from_io(path, "write", err);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| SyncError::from_io(parent, "create directory", err))?;
        }
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(write_err)?;

        let mut header = Vec::new();
        if !self.extensions.is_empty() {
            header.push(0);
            for field in [PRODUCT_ENTRY_MAGIC, 0, 0, 0, 0] {
                header.extend_from_slice(&field.to_le_bytes());
            }
            for (key, value) in &self.extensions {
                push_cstring(&mut header, key);
                push_cstring(&mut header, value);
            }
            header.push(0);
        }
        for (name, data, timestamp) in &self.files {
            let size = u32::try_from(data.len())
                .map_err(|_| SyncError::format("archive", format!("{name} too large")))?;
            push_cstring(&mut header, name);
            for field in [0, size, 0, *timestamp, size] {
                header.extend_from_slice(&field.to_le_bytes());
            }
        }
        header.extend_from_slice(&[0u8; 1 + RECORD_FIELDS_LEN as usize]);

        file.write_all(&header).map_err(write_err)?;
        for (_, data, _) in &self.files {
            file.write_all(data).map_err(write_err)?;
        }
        append_trailer(&mut file).map_err(write_err)?;
        file.sync_all().map_err(write_err)
    }
}

pub fn append_trailer(file: &mut File) -> io::Result<()> {
    let len = file.metadata()?.len();
    let digest = content_digest(file, len)?;
    file.seek(SeekFrom::End(0))?;
    file.write_all(&[0])?;
    file.write_all(&digest)?;
    Ok(())
}

fn push_cstring(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(value.as_bytes());
    out.push(0);
}

fn read_cstring<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        reader.read_exact(&mut byte)?;
        if byte[0] == 0 {
            break;
        }
        if bytes.len() >= MAX_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unterminated header string",
            ));
        }
        bytes.push(byte[0]);
    }
    String::from_utf8(bytes).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

fn read_u32<R: Read>(reader: &mut R) -> io::Result<u32> {
    let mut bytes = [0u8; 4];
    reader.read_exact(&mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    #[test]
    fn parses_extensions_entries_and_offsets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("main.pbo");
        ArchiveBuilder::new()
            .extension("prefix", "x\\main")
            .file("config.bin", vec![1u8; 12], 100)
            .file("data\\script.sqf", b"hint 'hi';".to_vec(), 200)
            .write(&path)
            .unwrap();

        let layout = read_archive(&path).unwrap();
        assert_eq!(layout.extensions, vec![("prefix".to_string(), "x\\main".to_string())]);
        assert_eq!(layout.entries.len(), 2);

        // product record (21) + "prefix\0x\\main\0\0" (15) + records + boundary (21)
        let expected_header = 21 + 15 + (11 + 20) + (16 + 20) + 21;
        assert_eq!(layout.header_end, expected_header);
        let offsets = layout.offsets();
        assert_eq!(offsets["config.bin"], expected_header);
        assert_eq!(offsets["data\\script.sqf"], expected_header + 12);
        assert_eq!(layout.entries[1].timestamp, 200);
        assert_eq!(layout.content_end, expected_header + 12 + 10);
        assert!(verify_checksum(&path).unwrap());
    }

    #[test]
    fn archive_without_extensions_or_trailer() {
        let mut bytes = Vec::new();
        push_cstring(&mut bytes, "a.txt");
        for field in [0u32, 3, 0, 0, 3] {
            bytes.extend_from_slice(&field.to_le_bytes());
        }
        bytes.extend_from_slice(&[0u8; 21]);
        bytes.extend_from_slice(b"abc");
        let len = bytes.len() as u64;

        let layout = parse_archive(Cursor::new(bytes), len).unwrap();
        assert!(layout.extensions.is_empty());
        assert_eq!(layout.entries[0].offset, 6 + 20 + 21);
        assert_eq!(layout.checksum, None);
        assert_eq!(layout.content_end, len);
    }

    #[test]
    fn explicit_offsets_are_honoured() {
        let mut bytes = Vec::new();
        push_cstring(&mut bytes, "a");
        for field in [0u32, 2, 60, 0, 2] {
            bytes.extend_from_slice(&field.to_le_bytes());
        }
        bytes.extend_from_slice(&[0u8; 21]);
        bytes.resize(62, 0);
        let layout = parse_archive(Cursor::new(bytes), 62).unwrap();
        assert_eq!(layout.entries[0].offset, 60);
        assert_eq!(layout.entries[0].reserved_pos, 2 + 8);
    }

    #[test]
    fn truncated_archive_is_a_format_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.pbo");
        ArchiveBuilder::new()
            .file("big.bin", vec![9u8; 64], 0)
            .write(&path)
            .unwrap();
        let raw = fs::read(&path).unwrap();
        fs::write(&path, &raw[..raw.len() - 40]).unwrap();

        assert!(matches!(read_archive(&path), Err(SyncError::Format { .. })));
        fs::write(&path, b"\x01\x02").unwrap();
        assert!(matches!(read_archive(&path), Err(SyncError::Format { .. })));
    }
}
