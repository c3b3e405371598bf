//! Page codec.
//!
//! A page is a fixed-size byte block with a 32-byte header, an array of
//! 4-byte keyblocks growing up from `KEY_BLOCK_START`, and variable-length
//! tail blocks growing down from the end of the page. Keys are stored
//! front-compressed: each keyblock elides the `EBC` leading bytes its key
//! shares with its predecessor, caches the first differing byte (`DB`), and
//! points at a tail block holding the remaining key bytes plus the value.
//!
//! Index pages store an 8-byte child address where data pages store value
//! bytes. Long-record and garbage pages reuse the header but carry flat
//! bodies; see `long_payload` and the garbage accessors.

use crate::error::{Error, Result};
use crate::key::{Key, common_prefix};
use crate::mvv;
use crate::{MAX_TREE_DEPTH, MAX_VALID_PAGE_ADDR};

// Common header offsets.
const OFF_TYPE: usize = 0; // u8
const OFF_FLAGS: usize = 1; // u8, reserved
const OFF_ALLOC: usize = 2; // u16, low-water of the tail region
const OFF_KEYBLOCK_END: usize = 4; // u16, high-water of the keyblock region
const OFF_RESERVED: usize = 6; // u16
const OFF_TIMESTAMP: usize = 8; // u64, last-modified
const OFF_PAGE_ADDRESS: usize = 16; // u64
const OFF_RIGHT_SIBLING: usize = 24; // u64

pub const KEY_BLOCK_START: usize = 32;
pub const KEYBLOCK_SIZE: usize = 4;
const TAILBLOCK_HEADER_SIZE: usize = 4;

// Page type codes. Index levels are encoded relative to TYPE_DATA so that
// `page_type == TYPE_DATA + level` holds at every level of a tree.
const TYPE_UNUSED: u8 = 0;
const TYPE_HEAD: u8 = 1;
const TYPE_GARBAGE: u8 = 2;
const TYPE_LONG_RECORD: u8 = 3;
const TYPE_DATA: u8 = 4;
const TYPE_INDEX_MAX: u8 = TYPE_DATA + MAX_TREE_DEPTH as u8;

/// Value-region tag for a long-record descriptor.
pub const LONGREC_TYPE: u8 = 0xFF;
/// Size of the descriptor stored in place of the value.
pub const LONGREC_SIZE: usize = 25;
/// Leading value bytes kept inline in the descriptor.
pub const LONGREC_PREFIX_SIZE: usize = 8;

/// Size of one `{left_page, right_page}` entry in a garbage page body.
pub const GARBAGE_BLOCK_SIZE: usize = 16;

fn read_u16_be(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes(buf[off..off + 2].try_into().unwrap())
}

fn write_u16_be(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_be_bytes());
}

fn read_u32_be(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes(buf[off..off + 4].try_into().unwrap())
}

fn write_u32_be(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_be_bytes());
}

pub(crate) fn read_u64_be(buf: &[u8], off: usize) -> u64 {
    u64::from_be_bytes(buf[off..off + 8].try_into().unwrap())
}

pub(crate) fn write_u64_be(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_be_bytes());
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

// Keyblock bitfields: EBC:11 | DB:8 | TBL:13, with TBL stored as offset/4.
fn kb_encode(ebc: usize, db: u8, tbl: usize) -> u32 {
    debug_assert!(ebc < (1 << 11));
    debug_assert_eq!(tbl & 3, 0);
    debug_assert!((tbl >> 2) < (1 << 13));
    ((ebc as u32) << 21) | ((db as u32) << 13) | ((tbl >> 2) as u32)
}

fn kb_ebc(kb: u32) -> usize {
    (kb >> 21) as usize
}

fn kb_db(kb: u32) -> u8 {
    ((kb >> 13) & 0xFF) as u8
}

fn kb_tbl(kb: u32) -> usize {
    ((kb & 0x1FFF) as usize) << 2
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageType {
    Unused,
    Head,
    Garbage,
    LongRecord,
    Data,
    Index(usize),
}

impl PageType {
    pub fn code(self) -> u8 {
        match self {
            PageType::Unused => TYPE_UNUSED,
            PageType::Head => TYPE_HEAD,
            PageType::Garbage => TYPE_GARBAGE,
            PageType::LongRecord => TYPE_LONG_RECORD,
            PageType::Data => TYPE_DATA,
            PageType::Index(level) => TYPE_DATA + level as u8,
        }
    }

    pub fn from_code(code: u8) -> Result<PageType> {
        match code {
            TYPE_UNUSED => Ok(PageType::Unused),
            TYPE_HEAD => Ok(PageType::Head),
            TYPE_GARBAGE => Ok(PageType::Garbage),
            TYPE_LONG_RECORD => Ok(PageType::LongRecord),
            TYPE_DATA => Ok(PageType::Data),
            c if c > TYPE_DATA && c <= TYPE_INDEX_MAX => {
                Ok(PageType::Index((c - TYPE_DATA) as usize))
            }
            c => Err(Error::InvalidArgument(format!("unknown page type {c}"))),
        }
    }

    /// The type a page reached at tree level `level` must carry (I5).
    pub fn for_level(level: usize) -> PageType {
        if level == 0 {
            PageType::Data
        } else {
            PageType::Index(level)
        }
    }

    pub fn is_index(self) -> bool {
        matches!(self, PageType::Index(_))
    }
}

impl std::fmt::Display for PageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PageType::Unused => write!(f, "unused"),
            PageType::Head => write!(f, "head"),
            PageType::Garbage => write!(f, "garbage"),
            PageType::LongRecord => write!(f, "long-record"),
            PageType::Data => write!(f, "data"),
            PageType::Index(level) => write!(f, "index{level}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Lookup {
    pub found: bool,
    pub slot: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Replaced,
    NeedsSplit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LongRecDescriptor {
    pub total_size: u64,
    pub first_page: u64,
    pub prefix: [u8; LONGREC_PREFIX_SIZE],
}

impl LongRecDescriptor {
    pub fn encode(&self) -> [u8; LONGREC_SIZE] {
        let mut out = [0u8; LONGREC_SIZE];
        out[0] = LONGREC_TYPE;
        out[1..9].copy_from_slice(&self.total_size.to_be_bytes());
        out[9..17].copy_from_slice(&self.first_page.to_be_bytes());
        out[17..25].copy_from_slice(&self.prefix);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<LongRecDescriptor> {
        if bytes.len() != LONGREC_SIZE || bytes[0] != LONGREC_TYPE {
            return Err(Error::InvalidArgument(
                "malformed long-record descriptor".into(),
            ));
        }
        Ok(LongRecDescriptor {
            total_size: read_u64_be(bytes, 1),
            first_page: read_u64_be(bytes, 9),
            prefix: bytes[17..25].try_into().unwrap(),
        })
    }

    /// Bytes carried by the page chain, beyond the inline prefix.
    pub fn chain_size(&self) -> u64 {
        self.total_size.saturating_sub(LONGREC_PREFIX_SIZE as u64)
    }
}

/// A structural problem found by [`Page::verify`].
#[derive(Debug, Clone)]
pub struct PageFault {
    pub description: String,
    pub position: usize,
}

/// Per-page observations accumulated by [`Page::verify`].
#[derive(Debug, Default, Clone, Copy)]
pub struct PageScan {
    pub records: usize,
    pub mvv_records: usize,
    pub mvv_overhead: usize,
    pub mvv_anti_values: usize,
    pub has_mvv: bool,
}

pub struct Page {
    buf: Box<[u8]>,
}

impl Page {
    pub fn new(page_size: usize, page_type: PageType, address: u64) -> Page {
        let mut page = Page {
            buf: vec![0u8; page_size].into_boxed_slice(),
        };
        page.init(page_type, address);
        page
    }

    pub fn from_bytes(bytes: Box<[u8]>) -> Page {
        Page { buf: bytes }
    }

    /// Re-initializes the buffer as an empty page of the given type.
    pub fn init(&mut self, page_type: PageType, address: u64) {
        self.buf.fill(0);
        self.buf[OFF_TYPE] = page_type.code();
        let buf_len = self.buf.len() as u16;
        write_u16_be(&mut self.buf, OFF_ALLOC, buf_len);
        write_u16_be(&mut self.buf, OFF_KEYBLOCK_END, KEY_BLOCK_START as u16);
        write_u64_be(&mut self.buf, OFF_PAGE_ADDRESS, address);
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn page_size(&self) -> usize {
        self.buf.len()
    }

    pub fn page_type(&self) -> Result<PageType> {
        PageType::from_code(self.buf[OFF_TYPE])
    }

    pub fn set_page_type(&mut self, t: PageType) {
        self.buf[OFF_TYPE] = t.code();
    }

    pub fn alloc(&self) -> usize {
        read_u16_be(&self.buf, OFF_ALLOC) as usize
    }

    fn set_alloc(&mut self, v: usize) {
        write_u16_be(&mut self.buf, OFF_ALLOC, v as u16);
    }

    pub fn keyblock_end(&self) -> usize {
        read_u16_be(&self.buf, OFF_KEYBLOCK_END) as usize
    }

    fn set_keyblock_end(&mut self, v: usize) {
        write_u16_be(&mut self.buf, OFF_KEYBLOCK_END, v as u16);
    }

    pub fn timestamp(&self) -> u64 {
        read_u64_be(&self.buf, OFF_TIMESTAMP)
    }

    pub fn set_timestamp(&mut self, ts: u64) {
        write_u64_be(&mut self.buf, OFF_TIMESTAMP, ts);
    }

    pub fn page_address(&self) -> u64 {
        read_u64_be(&self.buf, OFF_PAGE_ADDRESS)
    }

    pub fn set_page_address(&mut self, addr: u64) {
        write_u64_be(&mut self.buf, OFF_PAGE_ADDRESS, addr);
    }

    pub fn right_sibling(&self) -> u64 {
        read_u64_be(&self.buf, OFF_RIGHT_SIBLING)
    }

    pub fn set_right_sibling(&mut self, addr: u64) {
        write_u64_be(&mut self.buf, OFF_RIGHT_SIBLING, addr);
    }

    pub fn key_count(&self) -> usize {
        (self.keyblock_end() - KEY_BLOCK_START) / KEYBLOCK_SIZE
    }

    fn keyblock(&self, slot: usize) -> u32 {
        read_u32_be(&self.buf, KEY_BLOCK_START + slot * KEYBLOCK_SIZE)
    }

    fn set_keyblock(&mut self, slot: usize, kb: u32) {
        write_u32_be(&mut self.buf, KEY_BLOCK_START + slot * KEYBLOCK_SIZE, kb);
    }

    /// `(ebc, db, tail_offset)` for a slot.
    pub fn keyblock_fields(&self, slot: usize) -> (usize, u8, usize) {
        let kb = self.keyblock(slot);
        (kb_ebc(kb), kb_db(kb), kb_tbl(kb))
    }

    // Tail block accessors. Layout: [size: u16][klength: u16][key bytes][value].
    fn tail_size(&self, tbl: usize) -> usize {
        read_u16_be(&self.buf, tbl) as usize
    }

    fn tail_klength(&self, tbl: usize) -> usize {
        read_u16_be(&self.buf, tbl + 2) as usize
    }

    fn tail_key_bytes(&self, slot: usize) -> &[u8] {
        let (ebc, _, tbl) = self.keyblock_fields(slot);
        let klength = self.tail_klength(tbl);
        let start = tbl + TAILBLOCK_HEADER_SIZE;
        &self.buf[start..start + (klength - ebc - 1)]
    }

    /// The raw value region of a slot. On index pages this is the 8-byte
    /// child pointer.
    pub fn value_at(&self, slot: usize) -> &[u8] {
        let (ebc, _, tbl) = self.keyblock_fields(slot);
        let klength = self.tail_klength(tbl);
        let size = self.tail_size(tbl);
        let start = tbl + TAILBLOCK_HEADER_SIZE + (klength - ebc - 1);
        &self.buf[start..tbl + size]
    }

    pub fn child_at(&self, slot: usize) -> Result<u64> {
        let v = self.value_at(slot);
        if v.len() != 8 {
            return Err(Error::corrupt_volume(
                self.page_address(),
                format!("index slot {slot} carries a {}-byte pointer", v.len()),
            ));
        }
        Ok(read_u64_be(v, 0))
    }

    /// Reconstructs the full key at `slot`. O(slot); iteration should use
    /// [`Page::next_key`] instead.
    pub fn key_at(&self, slot: usize) -> Key {
        let mut key = Key::new();
        for s in 0..=slot {
            self.next_key(s, &mut key);
        }
        key
    }

    /// Extends `key` (holding the full key of `slot - 1`, or anything for
    /// slot 0) into the full key at `slot`. Returns false past the last slot.
    pub fn next_key(&self, slot: usize, key: &mut Key) -> bool {
        if slot >= self.key_count() {
            return false;
        }
        let (ebc, db, _) = self.keyblock_fields(slot);
        key.truncate(ebc);
        key.push_bytes(&[db]);
        key.push_bytes(self.tail_key_bytes(slot));
        true
    }

    /// Front-coded search. `matched` tracks the length of the common prefix
    /// between the sought key and the last stored key passed over, so most
    /// slots are rejected on `(EBC, DB)` alone.
    pub fn find(&self, key: &Key) -> Lookup {
        let k = key.encoded();
        let count = self.key_count();
        let mut matched = 0usize;
        for slot in 0..count {
            let (ebc, db, _) = self.keyblock_fields(slot);
            if ebc > matched {
                // This key shares more with its predecessor than the sought
                // key does, and the predecessor sorted below: still below.
                continue;
            }
            if ebc < matched {
                // Diverges from the predecessor before the sought key does:
                // first key above the sought one.
                return Lookup { found: false, slot };
            }
            if matched >= k.len() {
                // Only reachable on a corrupt page; the sought key cannot be
                // a prefix of a key already passed over.
                return Lookup { found: false, slot };
            }
            let target = k[matched];
            if db < target {
                continue;
            }
            if db > target {
                return Lookup { found: false, slot };
            }
            // Discriminator matches; resolve against the tail bytes.
            let tail = self.tail_key_bytes(slot);
            let rest = &k[matched + 1..];
            let mut j = 0;
            while j < tail.len() && j < rest.len() && tail[j] == rest[j] {
                j += 1;
            }
            if j == tail.len() && j == rest.len() {
                return Lookup { found: true, slot };
            }
            if j == tail.len() {
                // Stored key is a proper prefix of the sought key.
                matched = matched + 1 + j;
                continue;
            }
            if j == rest.len() || tail[j] > rest[j] {
                return Lookup { found: false, slot };
            }
            matched = matched + 1 + j;
        }
        Lookup {
            found: false,
            slot: count,
        }
    }

    fn tail_extent(&self, tbl: usize) -> usize {
        align4(self.tail_size(tbl))
    }

    /// Total free bytes: the gap between the regions plus every hole in the
    /// tail region.
    pub fn free_space(&self) -> usize {
        let mut used = 0usize;
        for slot in 0..self.key_count() {
            let (_, _, tbl) = self.keyblock_fields(slot);
            used += self.tail_extent(tbl);
        }
        self.buf.len() - self.keyblock_end() - used
    }

    /// Bytes in use, header and keyblocks included.
    pub fn used_bytes(&self) -> usize {
        self.buf.len() - self.free_space()
    }

    /// Slides live tail blocks to the high end of the page, squeezing out
    /// holes, and rewrites every TBL. `exclude` names a slot whose block is
    /// treated as dead (it is about to be rewritten).
    fn compact_tail(&mut self, exclude: Option<usize>) {
        let mut live: Vec<(usize, usize, usize)> = Vec::with_capacity(self.key_count());
        for slot in 0..self.key_count() {
            if exclude == Some(slot) {
                continue;
            }
            let (_, _, tbl) = self.keyblock_fields(slot);
            live.push((slot, tbl, self.tail_extent(tbl)));
        }
        live.sort_by(|a, b| b.1.cmp(&a.1));
        let mut dst = self.buf.len();
        for (slot, tbl, extent) in live {
            dst -= extent;
            if dst != tbl {
                self.buf.copy_within(tbl..tbl + extent, dst);
                let kb = self.keyblock(slot);
                self.set_keyblock(slot, kb_encode(kb_ebc(kb), kb_db(kb), dst));
            }
        }
        self.set_alloc(dst);
    }

    /// Carves `extent` bytes out of the gap. The caller has already verified
    /// total free space and compacted if needed.
    fn alloc_tail(&mut self, extent: usize, reserve: usize) -> Option<usize> {
        let alloc = self.alloc();
        if alloc < extent || alloc - extent < self.keyblock_end() + reserve {
            return None;
        }
        let tbl = alloc - extent;
        self.set_alloc(tbl);
        Some(tbl)
    }

    fn write_tail(&mut self, tbl: usize, klength: usize, key_bytes: &[u8], value: &[u8]) {
        let size = TAILBLOCK_HEADER_SIZE + key_bytes.len() + value.len();
        write_u16_be(&mut self.buf, tbl, size as u16);
        write_u16_be(&mut self.buf, tbl + 2, klength as u16);
        let mut at = tbl + TAILBLOCK_HEADER_SIZE;
        self.buf[at..at + key_bytes.len()].copy_from_slice(key_bytes);
        at += key_bytes.len();
        self.buf[at..at + value.len()].copy_from_slice(value);
    }

    fn insert_keyblock(&mut self, slot: usize, kb: u32) {
        let end = self.keyblock_end();
        let at = KEY_BLOCK_START + slot * KEYBLOCK_SIZE;
        self.buf.copy_within(at..end, at + KEYBLOCK_SIZE);
        self.set_keyblock_end(end + KEYBLOCK_SIZE);
        self.set_keyblock(slot, kb);
    }

    fn remove_keyblock(&mut self, slot: usize) {
        let end = self.keyblock_end();
        let at = KEY_BLOCK_START + slot * KEYBLOCK_SIZE;
        self.buf.copy_within(at + KEYBLOCK_SIZE..end, at);
        self.set_keyblock_end(end - KEYBLOCK_SIZE);
    }

    /// Inserts or replaces `key`. Returns `NeedsSplit` without mutating the
    /// page when the record cannot be made to fit.
    pub fn insert(&mut self, key: &Key, value: &[u8]) -> Result<InsertOutcome> {
        let lookup = self.find(key);
        if lookup.found {
            return self.replace_value(lookup.slot, value);
        }
        let slot = lookup.slot;
        let k = key.encoded();
        if k.is_empty() {
            return Err(Error::InvalidArgument("empty key".into()));
        }

        let ebc = if slot == 0 {
            0
        } else {
            common_prefix(self.key_at(slot - 1).encoded(), k)
        };
        debug_assert!(ebc < k.len(), "duplicate key reached insert path");
        let key_bytes = &k[ebc + 1..];
        let extent = align4(TAILBLOCK_HEADER_SIZE + key_bytes.len() + value.len());

        if self.free_space() < KEYBLOCK_SIZE + extent {
            return Ok(InsertOutcome::NeedsSplit);
        }
        let tbl = match self.alloc_tail(extent, KEYBLOCK_SIZE) {
            Some(tbl) => tbl,
            None => {
                // Free space exists but the gap is fragmented.
                self.compact_tail(None);
                match self.alloc_tail(extent, KEYBLOCK_SIZE) {
                    Some(tbl) => tbl,
                    None => return Ok(InsertOutcome::NeedsSplit),
                }
            }
        };
        self.write_tail(tbl, k.len(), key_bytes, value);
        self.insert_keyblock(slot, kb_encode(ebc, k[ebc], tbl));

        // The old occupant of `slot` now follows the new key, which can only
        // lengthen its elided prefix. Its stored bytes shrink to a suffix of
        // themselves, so the rewrite stays inside its block.
        if slot + 1 < self.key_count() {
            self.tighten_successor(slot + 1, k);
        }
        Ok(InsertOutcome::Inserted)
    }

    fn replace_value(&mut self, slot: usize, value: &[u8]) -> Result<InsertOutcome> {
        let (ebc, db, tbl) = self.keyblock_fields(slot);
        let klength = self.tail_klength(tbl);
        let key_bytes_len = klength - ebc - 1;
        let new_size = TAILBLOCK_HEADER_SIZE + key_bytes_len + value.len();
        let old_extent = self.tail_extent(tbl);
        if new_size <= old_extent {
            write_u16_be(&mut self.buf, tbl, new_size as u16);
            let at = tbl + TAILBLOCK_HEADER_SIZE + key_bytes_len;
            self.buf[at..at + value.len()].copy_from_slice(value);
            return Ok(InsertOutcome::Replaced);
        }
        let extent = align4(new_size);
        if self.free_space() + old_extent < extent {
            return Ok(InsertOutcome::NeedsSplit);
        }
        let key_bytes =
            self.buf[tbl + TAILBLOCK_HEADER_SIZE..tbl + TAILBLOCK_HEADER_SIZE + key_bytes_len]
                .to_vec();
        self.compact_tail(Some(slot));
        let new_tbl = match self.alloc_tail(extent, 0) {
            Some(t) => t,
            None => return Ok(InsertOutcome::NeedsSplit),
        };
        self.write_tail(new_tbl, klength, &key_bytes, value);
        self.set_keyblock(slot, kb_encode(ebc, db, new_tbl));
        Ok(InsertOutcome::Replaced)
    }

    /// Re-elides `slot` against a new, closer predecessor. The elision can
    /// only grow, so the block is rewritten in place.
    fn tighten_successor(&mut self, slot: usize, pred: &[u8]) {
        let (old_ebc, _, tbl) = self.keyblock_fields(slot);
        let klength = self.tail_klength(tbl);
        let full = self.key_at(slot);
        let new_ebc = common_prefix(pred, full.encoded());
        debug_assert!(new_ebc >= old_ebc);
        if new_ebc == old_ebc {
            return;
        }
        let drop = new_ebc - old_ebc;
        let old_key_len = klength - old_ebc - 1;
        let new_key_len = klength - new_ebc - 1;
        let value_len = self.tail_size(tbl) - TAILBLOCK_HEADER_SIZE - old_key_len;
        let db = full.encoded()[new_ebc];
        let body = tbl + TAILBLOCK_HEADER_SIZE;
        // Stored bytes become a suffix of themselves; slide key tail and
        // value left over the dropped prefix.
        self.buf
            .copy_within(body + drop..body + old_key_len + value_len, body);
        write_u16_be(
            &mut self.buf,
            tbl,
            (TAILBLOCK_HEADER_SIZE + new_key_len + value_len) as u16,
        );
        self.set_keyblock(slot, kb_encode(new_ebc, db, tbl));
    }

    /// Removes the key at `slot`, freeing its tail block and re-eliding the
    /// successor against its new predecessor.
    pub fn remove(&mut self, slot: usize) -> Result<()> {
        let count = self.key_count();
        if slot >= count {
            return Err(Error::InvalidArgument(format!(
                "remove slot {slot} of {count}"
            )));
        }
        let has_successor = slot + 1 < count;
        let (succ_key, succ_value) = if has_successor {
            (self.key_at(slot + 1), self.value_at(slot + 1).to_vec())
        } else {
            (Key::new(), Vec::new())
        };
        let pred_key = if slot > 0 {
            Some(self.key_at(slot - 1))
        } else {
            None
        };
        self.remove_keyblock(slot);
        if !has_successor {
            return Ok(());
        }
        // The successor now sits at `slot` with a stale (too-long) elision;
        // rebuild its block. The freed block guarantees the space.
        let new_ebc = match &pred_key {
            Some(p) => common_prefix(p.encoded(), succ_key.encoded()),
            None => 0,
        };
        self.rebuild_slot(slot, &succ_key, new_ebc, &succ_value)
    }

    fn rebuild_slot(&mut self, slot: usize, full_key: &Key, ebc: usize, value: &[u8]) -> Result<()> {
        let k = full_key.encoded();
        let key_bytes = &k[ebc + 1..];
        let extent = align4(TAILBLOCK_HEADER_SIZE + key_bytes.len() + value.len());
        self.compact_tail(Some(slot));
        let tbl = self.alloc_tail(extent, 0).ok_or_else(|| {
            Error::corrupt_volume(self.page_address(), "tail region exhausted during rebuild")
        })?;
        self.write_tail(tbl, k.len(), key_bytes, value);
        self.set_keyblock(slot, kb_encode(ebc, k[ebc], tbl));
        Ok(())
    }

    /// Splits this page, placing `key`/`value` (an insert or replacement that
    /// returned `NeedsSplit`) into the proper half. `right` must be an empty
    /// page of the same size and type. Returns the promoted key, the first
    /// key of the right half.
    pub fn split_into(&mut self, right: &mut Page, key: &Key, value: &[u8]) -> Result<Key> {
        let lookup = self.find(key);
        let count = self.key_count();
        if count < 2 {
            return Err(Error::corrupt_volume(
                self.page_address(),
                "page too small to split",
            ));
        }

        // Materialize the merged sequence, applying the incoming record.
        let mut entries: Vec<(Key, Vec<u8>)> = Vec::with_capacity(count + 1);
        let mut scratch = Key::new();
        for slot in 0..count {
            self.next_key(slot, &mut scratch);
            entries.push((scratch.clone(), self.value_at(slot).to_vec()));
        }
        if lookup.found {
            entries[lookup.slot].1 = value.to_vec();
        } else {
            entries.insert(lookup.slot, (key.clone(), value.to_vec()));
        }
        let incoming = lookup.slot;

        let split = choose_split(&entries, incoming, self.buf.len())?;

        let page_type = self.page_type()?;
        let address = self.page_address();
        let timestamp = self.timestamp();
        let sibling = self.right_sibling();
        self.init(page_type, address);
        self.set_timestamp(timestamp);
        self.set_right_sibling(sibling);
        right.set_page_type(page_type);
        for (i, (k, v)) in entries.iter().enumerate() {
            let target = if i < split { &mut *self } else { &mut *right };
            match target.insert(k, v)? {
                InsertOutcome::Inserted => {}
                _ => {
                    return Err(Error::corrupt_volume(
                        address,
                        "split halves failed to absorb their records",
                    ));
                }
            }
        }
        Ok(entries[split].0.clone())
    }

    /// Yields `(slot, descriptor)` for the first long-record value at or
    /// after `from_slot`.
    pub fn next_long_record(&self, from_slot: usize) -> Option<(usize, LongRecDescriptor)> {
        for slot in from_slot..self.key_count() {
            let v = self.value_at(slot);
            if v.first() == Some(&LONGREC_TYPE) {
                if let Ok(d) = LongRecDescriptor::decode(v) {
                    return Some((slot, d));
                }
            }
        }
        None
    }

    pub fn has_mvv(&self) -> bool {
        if !matches!(self.page_type(), Ok(PageType::Data)) {
            return false;
        }
        (0..self.key_count()).any(|slot| mvv::is_array(self.value_at(slot)))
    }

    // Long-record pages: flat payload after the header, length tracked in
    // the alloc field.
    pub fn long_payload_capacity(&self) -> usize {
        self.buf.len() - KEY_BLOCK_START
    }

    pub fn set_long_payload(&mut self, payload: &[u8]) {
        debug_assert!(payload.len() <= self.long_payload_capacity());
        self.buf[KEY_BLOCK_START..KEY_BLOCK_START + payload.len()].copy_from_slice(payload);
        self.set_alloc(KEY_BLOCK_START + payload.len());
    }

    pub fn long_payload(&self) -> &[u8] {
        let end = self.alloc().clamp(KEY_BLOCK_START, self.buf.len());
        &self.buf[KEY_BLOCK_START..end]
    }

    // Garbage pages: dense {left, right} run entries after the header, fill
    // pointer tracked in keyblock_end.
    pub fn garbage_count(&self) -> usize {
        (self.keyblock_end() - KEY_BLOCK_START) / GARBAGE_BLOCK_SIZE
    }

    pub fn garbage_entry(&self, index: usize) -> (u64, u64) {
        let at = KEY_BLOCK_START + index * GARBAGE_BLOCK_SIZE;
        (read_u64_be(&self.buf, at), read_u64_be(&self.buf, at + 8))
    }

    pub fn set_garbage_entry(&mut self, index: usize, left: u64, right: u64) {
        let at = KEY_BLOCK_START + index * GARBAGE_BLOCK_SIZE;
        write_u64_be(&mut self.buf, at, left);
        write_u64_be(&mut self.buf, at + 8, right);
    }

    pub fn push_garbage_entry(&mut self, left: u64, right: u64) -> bool {
        let end = self.keyblock_end();
        if end + GARBAGE_BLOCK_SIZE > self.buf.len() {
            return false;
        }
        self.set_keyblock_end(end + GARBAGE_BLOCK_SIZE);
        let index = (end - KEY_BLOCK_START) / GARBAGE_BLOCK_SIZE;
        self.set_garbage_entry(index, left, right);
        true
    }

    pub fn pop_garbage_entry(&mut self) -> Option<(u64, u64)> {
        let count = self.garbage_count();
        if count == 0 {
            return None;
        }
        let entry = self.garbage_entry(count - 1);
        self.set_keyblock_end(self.keyblock_end() - GARBAGE_BLOCK_SIZE);
        Some(entry)
    }

    /// Structural verification of one page. Returns the first fault found;
    /// observations accumulate in `scan` regardless.
    pub fn verify(&self, expected: PageType, scan: &mut PageScan) -> Option<PageFault> {
        let page_type = match self.page_type() {
            Ok(t) => t,
            Err(_) => {
                return Some(PageFault {
                    description: format!("invalid page type code {}", self.buf[OFF_TYPE]),
                    position: OFF_TYPE,
                });
            }
        };
        if page_type != expected {
            return Some(PageFault {
                description: format!("page type {page_type} where {expected} expected"),
                position: OFF_TYPE,
            });
        }
        let keyblock_end = self.keyblock_end();
        let alloc = self.alloc();
        if keyblock_end < KEY_BLOCK_START
            || keyblock_end > self.buf.len()
            || (keyblock_end - KEY_BLOCK_START) % KEYBLOCK_SIZE != 0
        {
            return Some(PageFault {
                description: format!("keyblock_end {keyblock_end} out of bounds"),
                position: OFF_KEYBLOCK_END,
            });
        }
        if alloc < keyblock_end || alloc > self.buf.len() {
            return Some(PageFault {
                description: format!("alloc {alloc} outside [{keyblock_end}, {}]", self.buf.len()),
                position: OFF_ALLOC,
            });
        }

        let mut fault = None;
        let mut prev = Key::new();
        let mut cur = Key::new();
        let mut extents: Vec<(usize, usize)> = Vec::with_capacity(self.key_count());
        for slot in 0..self.key_count() {
            scan.records += 1;
            let (ebc, _, tbl) = self.keyblock_fields(slot);
            if tbl < alloc || tbl + TAILBLOCK_HEADER_SIZE > self.buf.len() {
                fault = fault.or(Some(PageFault {
                    description: format!("slot {slot} tail offset {tbl} outside tail region"),
                    position: slot,
                }));
                break;
            }
            let size = self.tail_size(tbl);
            let klength = self.tail_klength(tbl);
            if size < TAILBLOCK_HEADER_SIZE || tbl + align4(size) > self.buf.len() {
                fault = fault.or(Some(PageFault {
                    description: format!("slot {slot} tail block size {size} out of bounds"),
                    position: slot,
                }));
                break;
            }
            if klength < ebc + 1 || TAILBLOCK_HEADER_SIZE + (klength - ebc - 1) > size {
                fault = fault.or(Some(PageFault {
                    description: format!(
                        "slot {slot} key length {klength} inconsistent with ebc {ebc}"
                    ),
                    position: slot,
                }));
                break;
            }
            extents.push((tbl, align4(size)));
            if slot == 0 && ebc != 0 {
                fault = fault.or(Some(PageFault {
                    description: "first keyblock elides a nonexistent predecessor".into(),
                    position: 0,
                }));
            }
            if ebc > prev.len() {
                fault = fault.or(Some(PageFault {
                    description: format!(
                        "slot {slot} elides {ebc} bytes but predecessor has {}",
                        prev.len()
                    ),
                    position: slot,
                }));
                break;
            }
            cur.set_encoded(prev.encoded());
            self.next_key(slot, &mut cur);
            if slot > 0 && cur.encoded() <= prev.encoded() {
                fault = fault.or(Some(PageFault {
                    description: format!("slot {slot} key not greater than predecessor"),
                    position: slot,
                }));
            }
            std::mem::swap(&mut prev, &mut cur);

            if let Some(f) = self.verify_value(expected, slot, scan) {
                fault = fault.or(Some(f));
            }
        }

        extents.sort_unstable();
        for pair in extents.windows(2) {
            let (a, a_len) = pair[0];
            let (b, _) = pair[1];
            if a + a_len > b {
                fault = fault.or(Some(PageFault {
                    description: format!("tail blocks at {a} and {b} overlap"),
                    position: a,
                }));
            }
        }
        fault
    }

    fn verify_value(&self, expected: PageType, slot: usize, scan: &mut PageScan) -> Option<PageFault> {
        let v = self.value_at(slot);
        if expected.is_index() {
            return match self.child_at(slot) {
                Ok(child) if child > 0 && child <= MAX_VALID_PAGE_ADDR => None,
                Ok(child) => Some(PageFault {
                    description: format!("slot {slot} child pointer {child} invalid"),
                    position: slot,
                }),
                Err(_) => Some(PageFault {
                    description: format!("slot {slot} malformed child pointer"),
                    position: slot,
                }),
            };
        }
        match v.first() {
            Some(&LONGREC_TYPE) => match LongRecDescriptor::decode(v) {
                Ok(d) if d.first_page > 0 && d.first_page <= MAX_VALID_PAGE_ADDR => None,
                Ok(d) => Some(PageFault {
                    description: format!("slot {slot} long-record chain at {} invalid", d.first_page),
                    position: slot,
                }),
                Err(_) => Some(PageFault {
                    description: format!("slot {slot} malformed long-record descriptor"),
                    position: slot,
                }),
            },
            Some(&mvv::TYPE_MVV) => match mvv::scan_info(v) {
                Ok(info) => {
                    scan.has_mvv = true;
                    scan.mvv_records += info.versions;
                    scan.mvv_overhead += info.overhead;
                    scan.mvv_anti_values += info.anti_values;
                    if !info.monotonic {
                        Some(PageFault {
                            description: format!("slot {slot} version handles not increasing"),
                            position: slot,
                        })
                    } else {
                        None
                    }
                }
                Err(_) => Some(PageFault {
                    description: format!("slot {slot} malformed multi-version value"),
                    position: slot,
                }),
            },
            _ => None,
        }
    }

    /// Prunes every multi-version value on a data page; keys whose pruned
    /// value collapses to a primordial anti-value are removed.
    pub fn prune_mvv(
        &mut self,
        oracle: &dyn mvv::CommitOracle,
        floor: u64,
    ) -> Result<mvv::PruneStats> {
        let mut stats = mvv::PruneStats::default();
        let mut slot = 0;
        while slot < self.key_count() {
            let value = self.value_at(slot);
            if !mvv::is_array(value) {
                slot += 1;
                continue;
            }
            match mvv::prune(value, oracle, floor)? {
                mvv::Pruned::Unchanged => slot += 1,
                mvv::Pruned::Rewritten(bytes) => {
                    stats.rewritten += 1;
                    let key = self.key_at(slot);
                    match self.insert(&key, &bytes)? {
                        InsertOutcome::Replaced => {}
                        // Pruned values only shrink; anything else is a bug
                        // in the caller's claim discipline.
                        _ => {
                            return Err(Error::corrupt_volume(
                                self.page_address(),
                                "pruned value failed to replace in place",
                            ));
                        }
                    }
                    slot += 1;
                }
                mvv::Pruned::RemoveKey => {
                    stats.removed_keys += 1;
                    self.remove(slot)?;
                }
            }
        }
        Ok(stats)
    }
}

/// Picks the split index over the merged entry sequence: byte-balanced, with
/// a tie broken toward the smaller left half when the incoming record sits at
/// or above the balance point.
fn choose_split(entries: &[(Key, Vec<u8>)], incoming: usize, page_size: usize) -> Result<usize> {
    let sizes: Vec<usize> = entries
        .iter()
        .enumerate()
        .map(|(i, (k, v))| {
            let ebc = if i == 0 {
                0
            } else {
                common_prefix(entries[i - 1].0.encoded(), k.encoded())
            };
            align4(TAILBLOCK_HEADER_SIZE + (k.len() - ebc - 1) + v.len())
        })
        .collect();
    let total: usize = sizes.iter().sum();

    let mut best = 1usize;
    let mut best_diff = usize::MAX;
    let mut cum = 0usize;
    for s in 1..entries.len() {
        cum += sizes[s - 1];
        let diff = cum.abs_diff(total - cum);
        if diff < best_diff {
            best = s;
            best_diff = diff;
        } else if diff == best_diff && incoming < best {
            // Tie: grow the left half only when the incoming record sorts
            // below the balance point; otherwise keep the earlier split so
            // the right page takes the incoming record.
            best = s;
        }
    }

    // Both halves must physically fit, counting the right half's first key
    // stored unelided. Walk outward from the balanced point.
    let fits = |s: usize| -> bool {
        half_bytes(entries, 0, s) <= page_size - KEY_BLOCK_START
            && half_bytes(entries, s, entries.len()) <= page_size - KEY_BLOCK_START
    };
    if fits(best) {
        return Ok(best);
    }
    for delta in 1..entries.len() {
        if best > delta && fits(best - delta) {
            return Ok(best - delta);
        }
        if best + delta < entries.len() && fits(best + delta) {
            return Ok(best + delta);
        }
    }
    Err(Error::InvalidArgument(
        "record too large to fit either split half".into(),
    ))
}

fn half_bytes(entries: &[(Key, Vec<u8>)], from: usize, to: usize) -> usize {
    let mut sum = 0usize;
    for i in from..to {
        let ebc = if i == from {
            0
        } else {
            common_prefix(entries[i - 1].0.encoded(), entries[i].0.encoded())
        };
        sum += KEYBLOCK_SIZE
            + align4(TAILBLOCK_HEADER_SIZE + (entries[i].0.len() - ebc - 1) + entries[i].1.len());
    }
    sum
}
