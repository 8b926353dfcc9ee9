//! Dataset container files
//!
//! The loader only needs block names, element counts, and byte sizes from
//! disk, so dataset files are a minimal container:
//!
//! ```text
//! u32  magic "WSDS"          (little-endian)
//! u16  format version
//! u16  entry count
//! per-entry records:
//!      u16 name_length
//!      name_length bytes (UTF-8, no NUL)
//!      u64 element_count
//!      u64 byte_size
//! raw payloads, one per entry, concatenated in entry order
//! ```

use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    slice,
};

use crate::error::{Result, StoreError};
use crate::layout::{Block, DataLayout, MAX_BLOCK_NAME_LEN};

/// Magic bytes identifying a dataset container ("WSDS")
pub const DATASET_MAGIC: u32 = u32::from_le_bytes(*b"WSDS");

/// Current container format version
pub const DATASET_VERSION: u16 = 1;

/// One block carried by a dataset container
#[derive(Debug, Clone)]
pub struct BlockEntry {
    pub name: String,
    pub element_count: u64,
    pub byte_size: u64,
}

/// An opened, validated dataset container
#[derive(Debug)]
pub struct BlockFile {
    path: PathBuf,
    file: File,
    entries: Vec<BlockEntry>,
    payload_offset: u64,
}

impl BlockFile {
    /// Open a container and validate its header
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| StoreError::from_io(e, &format!("could not open {}", path.display())))?;
        let file_len = file
            .metadata()
            .map_err(|e| StoreError::from_io(e, "could not stat dataset file"))?
            .len();
        let mut reader = BufReader::new(file);

        let magic = read_u32(&mut reader, path)?;
        if magic != DATASET_MAGIC {
            return Err(StoreError::dataset_format(path, "bad magic"));
        }
        let version = read_u16(&mut reader, path)?;
        if version != DATASET_VERSION {
            return Err(StoreError::dataset_format(
                path,
                format!("unsupported format version {}", version),
            ));
        }

        let entry_count = read_u16(&mut reader, path)? as usize;
        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            let name_len = read_u16(&mut reader, path)? as usize;
            if name_len == 0 || name_len > MAX_BLOCK_NAME_LEN {
                return Err(StoreError::dataset_format(
                    path,
                    format!("block name length {} out of range", name_len),
                ));
            }
            let mut name_bytes = vec![0u8; name_len];
            reader
                .read_exact(&mut name_bytes)
                .map_err(|_| StoreError::dataset_format(path, "truncated entry table"))?;
            let name = String::from_utf8(name_bytes)
                .map_err(|_| StoreError::dataset_format(path, "block name is not valid UTF-8"))?;
            let element_count = read_u64(&mut reader, path)?;
            let byte_size = read_u64(&mut reader, path)?;
            entries.push(BlockEntry {
                name,
                element_count,
                byte_size,
            });
        }

        let payload_offset = reader
            .stream_position()
            .map_err(|e| StoreError::from_io(e, "could not read stream position"))?;
        let payload_len: u64 = entries.iter().map(|e| e.byte_size).sum();
        if payload_offset + payload_len > file_len {
            return Err(StoreError::dataset_format(
                path,
                format!(
                    "payload of {} bytes declared but file holds {}",
                    payload_len,
                    file_len - payload_offset.min(file_len)
                ),
            ));
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: reader.into_inner(),
            entries,
            payload_offset,
        })
    }

    /// Blocks carried by this container, in file order
    pub fn entries(&self) -> &[BlockEntry] {
        &self.entries
    }

    /// Declare every block of this container in `layout`
    pub fn register_blocks(&self, layout: &mut DataLayout) -> Result<()> {
        for entry in &self.entries {
            layout.set_block(
                entry.name.clone(),
                Block::new(entry.element_count, entry.byte_size),
            )?;
        }
        Ok(())
    }

    /// Copy every payload into its block within the body at `base`.
    ///
    /// `base` must point to a body of at least `layout.size_of_layout()`
    /// writable bytes, and `layout` must already declare this container's
    /// blocks (normally via [`Self::register_blocks`]).
    pub fn copy_blocks(&mut self, layout: &DataLayout, base: *mut u8) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(self.payload_offset))
            .map_err(|e| StoreError::from_io(e, "could not seek to payload"))?;
        for entry in &self.entries {
            // guards against the file changing between sizing and populate
            if layout.get_block_size(&entry.name)? != entry.byte_size {
                return Err(StoreError::dataset_format(
                    &self.path,
                    format!("block {} changed size since the layout was built", entry.name),
                ));
            }
            let ptr: *mut u8 = layout.get_block_ptr(base, &entry.name)?;
            let dest = unsafe { slice::from_raw_parts_mut(ptr, entry.byte_size as usize) };
            self.file
                .read_exact(dest)
                .map_err(|_| StoreError::dataset_format(&self.path, "truncated payload"))?;
        }
        Ok(())
    }
}

/// Reader callback used by the publication file tables: blit every block of
/// the container into the segment body.
pub fn copy_file_blocks(path: &Path, layout: &DataLayout, base: *mut u8) -> Result<()> {
    BlockFile::open(path)?.copy_blocks(layout, base)
}

/// Builder for dataset containers, used by tooling and tests
#[derive(Default)]
pub struct BlockFileWriter {
    blocks: Vec<(BlockEntry, Vec<u8>)>,
}

impl BlockFileWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a block; `payload.len()` becomes its byte size
    pub fn add_block(
        &mut self,
        name: impl Into<String>,
        element_count: u64,
        payload: Vec<u8>,
    ) -> Result<()> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_BLOCK_NAME_LEN || name.contains('\0') {
            return Err(StoreError::invalid_parameter(
                "name",
                "invalid block name",
            ));
        }
        self.blocks.push((
            BlockEntry {
                name,
                element_count,
                byte_size: payload.len() as u64,
            },
            payload,
        ));
        Ok(())
    }

    /// Write the container to `path`, replacing any existing file
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .map_err(|e| StoreError::from_io(e, &format!("could not create {}", path.display())))?;
        let mut writer = BufWriter::new(file);

        write_all(&mut writer, &DATASET_MAGIC.to_le_bytes())?;
        write_all(&mut writer, &DATASET_VERSION.to_le_bytes())?;
        write_all(&mut writer, &(self.blocks.len() as u16).to_le_bytes())?;
        for (entry, _) in &self.blocks {
            write_all(&mut writer, &(entry.name.len() as u16).to_le_bytes())?;
            write_all(&mut writer, entry.name.as_bytes())?;
            write_all(&mut writer, &entry.element_count.to_le_bytes())?;
            write_all(&mut writer, &entry.byte_size.to_le_bytes())?;
        }
        for (_, payload) in &self.blocks {
            write_all(&mut writer, payload)?;
        }
        writer
            .flush()
            .map_err(|e| StoreError::from_io(e, "could not flush dataset file"))?;
        Ok(())
    }
}

fn write_all(writer: &mut impl Write, bytes: &[u8]) -> Result<()> {
    writer
        .write_all(bytes)
        .map_err(|e| StoreError::from_io(e, "could not write dataset file"))
}

fn read_u16(reader: &mut impl Read, path: &Path) -> Result<u16> {
    let mut buf = [0u8; 2];
    reader
        .read_exact(&mut buf)
        .map_err(|_| StoreError::dataset_format(path, "truncated header"))?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(reader: &mut impl Read, path: &Path) -> Result<u32> {
    let mut buf = [0u8; 4];
    reader
        .read_exact(&mut buf)
        .map_err(|_| StoreError::dataset_format(path, "truncated header"))?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(reader: &mut impl Read, path: &Path) -> Result<u64> {
    let mut buf = [0u8; 8];
    reader
        .read_exact(&mut buf)
        .map_err(|_| StoreError::dataset_format(path, "truncated header"))?;
    Ok(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("berlin.ws.graph");

        let mut writer = BlockFileWriter::new();
        writer.add_block("nodes", 4, vec![1u8; 32]).unwrap();
        writer.add_block("edges", 2, vec![2u8; 16]).unwrap();
        writer.write_to(&path).unwrap();

        let block_file = BlockFile::open(&path).unwrap();
        assert_eq!(block_file.entries().len(), 2);
        assert_eq!(block_file.entries()[0].name, "nodes");
        assert_eq!(block_file.entries()[0].element_count, 4);
        assert_eq!(block_file.entries()[0].byte_size, 32);
    }

    #[test]
    fn test_copy_blocks_into_body() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.ws.graph");

        let mut writer = BlockFileWriter::new();
        writer.add_block("a", 8, vec![0xAA; 8]).unwrap();
        writer.add_block("b", 4, vec![0xBB; 4]).unwrap();
        writer.write_to(&path).unwrap();

        let mut block_file = BlockFile::open(&path).unwrap();
        let mut layout = DataLayout::new();
        block_file.register_blocks(&mut layout).unwrap();

        let mut body = vec![0u8; layout.size_of_layout() as usize];
        block_file.copy_blocks(&layout, body.as_mut_ptr()).unwrap();

        assert_eq!(&body[0..8], &[0xAA; 8]);
        // "b" starts at the next 8-byte boundary
        assert_eq!(&body[8..12], &[0xBB; 4]);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bogus.ws.graph");
        std::fs::write(&path, b"not a dataset").unwrap();

        let err = BlockFile::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::DatasetFormat { .. }));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.ws.graph");

        let mut writer = BlockFileWriter::new();
        writer.add_block("a", 8, vec![0xAA; 64]).unwrap();
        writer.write_to(&path).unwrap();

        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 8]).unwrap();

        let err = BlockFile::open(&path).unwrap_err();
        assert!(matches!(err, StoreError::DatasetFormat { .. }));
    }
}
