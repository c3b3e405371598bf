//! Volume files.
//!
//! A volume is a flat file of fixed-size pages. Page 0 is the head: it
//! carries the volume identity, the page size, the allocation high-water
//! mark, and the roots of the directory tree and the garbage list. All other
//! pages are reached through those roots.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(unix)]
use std::os::unix::fs::FileExt as _;
#[cfg(windows)]
use std::os::windows::fs::FileExt as _;

use crate::error::{Error, Result};
use crate::page::{KEY_BLOCK_START, Page, PageType};

pub const VOLUME_MAGIC: [u8; 16] = *b"ARBORDBVOLUME\0\0\0";
pub const VOLUME_VERSION: u32 = 1;

pub const MIN_PAGE_SIZE: usize = 1024;
pub const MAX_PAGE_SIZE: usize = 16384;

// Head field offsets, following the 32-byte page header.
const OFF_MAGIC: usize = KEY_BLOCK_START; // [u8;16]
const OFF_VERSION: usize = 48; // u32
const OFF_PAGE_SIZE: usize = 52; // u32
const OFF_VOLUME_ID: usize = 56; // u64
const OFF_NEXT_AVAILABLE: usize = 64; // u64
const OFF_DIRECTORY_ROOT: usize = 72; // u64
const OFF_DIRECTORY_DEPTH: usize = 80; // u16
const OFF_GARBAGE_ROOT: usize = 88; // u64
const OFF_CREATED_MS: usize = 96; // u64
const OFF_OPENED_MS: usize = 104; // u64

pub fn valid_page_size(size: usize) -> bool {
    size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Decoded head-page fields. Mutated only under the head page's exclusive
/// claim; the encoded form is the page image itself.
#[derive(Debug, Clone, Copy)]
pub struct VolumeHeader {
    pub version: u32,
    pub page_size: u32,
    pub volume_id: u64,
    pub next_available: u64,
    pub directory_root: u64,
    pub directory_depth: u16,
    pub garbage_root: u64,
    pub created_ms: u64,
    pub opened_ms: u64,
}

impl VolumeHeader {
    pub fn new(page_size: usize, volume_id: u64) -> VolumeHeader {
        let now = now_ms();
        VolumeHeader {
            version: VOLUME_VERSION,
            page_size: page_size as u32,
            volume_id,
            next_available: 1,
            directory_root: 0,
            directory_depth: 0,
            garbage_root: 0,
            created_ms: now,
            opened_ms: now,
        }
    }

    pub fn encode_into(&self, page: &mut Page) {
        let buf = page.bytes_mut();
        buf[OFF_MAGIC..OFF_MAGIC + 16].copy_from_slice(&VOLUME_MAGIC);
        buf[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&self.version.to_be_bytes());
        buf[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 4].copy_from_slice(&self.page_size.to_be_bytes());
        buf[OFF_VOLUME_ID..OFF_VOLUME_ID + 8].copy_from_slice(&self.volume_id.to_be_bytes());
        buf[OFF_NEXT_AVAILABLE..OFF_NEXT_AVAILABLE + 8]
            .copy_from_slice(&self.next_available.to_be_bytes());
        buf[OFF_DIRECTORY_ROOT..OFF_DIRECTORY_ROOT + 8]
            .copy_from_slice(&self.directory_root.to_be_bytes());
        buf[OFF_DIRECTORY_DEPTH..OFF_DIRECTORY_DEPTH + 2]
            .copy_from_slice(&self.directory_depth.to_be_bytes());
        buf[OFF_GARBAGE_ROOT..OFF_GARBAGE_ROOT + 8]
            .copy_from_slice(&self.garbage_root.to_be_bytes());
        buf[OFF_CREATED_MS..OFF_CREATED_MS + 8].copy_from_slice(&self.created_ms.to_be_bytes());
        buf[OFF_OPENED_MS..OFF_OPENED_MS + 8].copy_from_slice(&self.opened_ms.to_be_bytes());
    }

    pub fn decode(page: &Page) -> Result<VolumeHeader> {
        let buf = page.bytes();
        if buf.len() < OFF_OPENED_MS + 8 || buf[OFF_MAGIC..OFF_MAGIC + 16] != VOLUME_MAGIC {
            return Err(Error::corrupt_volume(0, "bad head magic"));
        }
        let field_u32 = |off: usize| u32::from_be_bytes(buf[off..off + 4].try_into().unwrap());
        let field_u64 = |off: usize| u64::from_be_bytes(buf[off..off + 8].try_into().unwrap());
        let header = VolumeHeader {
            version: field_u32(OFF_VERSION),
            page_size: field_u32(OFF_PAGE_SIZE),
            volume_id: field_u64(OFF_VOLUME_ID),
            next_available: field_u64(OFF_NEXT_AVAILABLE),
            directory_root: field_u64(OFF_DIRECTORY_ROOT),
            directory_depth: u16::from_be_bytes(
                buf[OFF_DIRECTORY_DEPTH..OFF_DIRECTORY_DEPTH + 2]
                    .try_into()
                    .unwrap(),
            ),
            garbage_root: field_u64(OFF_GARBAGE_ROOT),
            created_ms: field_u64(OFF_CREATED_MS),
            opened_ms: field_u64(OFF_OPENED_MS),
        };
        if header.version != VOLUME_VERSION {
            return Err(Error::corrupt_volume(
                0,
                format!("unsupported volume version {}", header.version),
            ));
        }
        if !valid_page_size(header.page_size as usize) {
            return Err(Error::corrupt_volume(
                0,
                format!("invalid page size {}", header.page_size),
            ));
        }
        Ok(header)
    }
}

pub struct Volume {
    path: PathBuf,
    file: File,
    page_size: usize,
    volume_id: u64,
    read_only: bool,
}

impl Volume {
    pub fn create(path: impl AsRef<Path>, page_size: usize) -> Result<Volume> {
        let path = path.as_ref();
        if !valid_page_size(page_size) {
            return Err(Error::InvalidArgument(format!(
                "page size {page_size} must be a power of two in [{MIN_PAGE_SIZE}, {MAX_PAGE_SIZE}]"
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let volume_id = now_ms().wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ u64::from(std::process::id());
        let volume = Volume {
            path: path.to_path_buf(),
            file,
            page_size,
            volume_id,
            read_only: false,
        };
        let mut head = Page::new(page_size, PageType::Head, 0);
        VolumeHeader::new(page_size, volume_id).encode_into(&mut head);
        volume.write_page(&head)?;
        volume.sync()?;
        Ok(volume)
    }

    pub fn open(path: impl AsRef<Path>, read_only: bool) -> Result<Volume> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        // The page size is discovered from the head; read the smallest legal
        // page first, then the full head once the size is known.
        let mut probe = vec![0u8; MIN_PAGE_SIZE];
        read_exact_at(&file, &mut probe, 0)?;
        let probe_page = Page::from_bytes(probe.into_boxed_slice());
        let header = VolumeHeader::decode(&probe_page)?;
        let page_size = header.page_size as usize;
        let mut volume = Volume {
            path: path.to_path_buf(),
            file,
            page_size,
            volume_id: header.volume_id,
            read_only,
        };
        if page_size != MIN_PAGE_SIZE {
            let head = volume.read_page(0)?;
            let header = VolumeHeader::decode(&head)?;
            volume.volume_id = header.volume_id;
        }
        Ok(volume)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn volume_id(&self) -> u64 {
        self.volume_id
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn read_page(&self, address: u64) -> Result<Page> {
        let mut buf = vec![0u8; self.page_size];
        let offset = address
            .checked_mul(self.page_size as u64)
            .ok_or_else(|| Error::corrupt_volume(address, "page offset overflow"))?;
        read_exact_at(&self.file, &mut buf, offset)?;
        Ok(Page::from_bytes(buf.into_boxed_slice()))
    }

    pub fn write_page(&self, page: &Page) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        debug_assert_eq!(page.page_size(), self.page_size);
        let offset = page.page_address() * self.page_size as u64;
        write_all_at(&self.file, page.bytes(), offset)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    file.read_exact_at(buf, offset).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            Error::corrupt_volume(offset / buf.len().max(1) as u64, "page beyond end of file")
        } else {
            Error::Io(e)
        }
    })
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> Result<()> {
    file.write_all_at(buf, offset)?;
    Ok(())
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> Result<()> {
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(Error::corrupt_volume(0, "page beyond end of file"));
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> Result<()> {
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}
