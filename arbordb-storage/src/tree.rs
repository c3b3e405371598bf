//! B+tree operations over the buffer pool.
//!
//! A tree is a root address and a depth; level 0 is data pages, the root is
//! at `depth - 1`. Index entries map a key to the child whose subtree starts
//! at that key, with the leftmost child keyed by the left-edge key. The
//! directory tree, rooted in the volume head, maps tree names to their roots.
//!
//! Mutations descend with exclusive claims held along the path so splits can
//! propagate; reads use shared claims with lock coupling. Pages are never
//! rebalanced on delete; space comes back when a tree is dropped.

use crate::buffer::BufferPool;
use crate::error::{Error, Result};
use crate::key::{Key, MAX_KEY_SIZE};
use crate::mvv;
use crate::page::{InsertOutcome, LONGREC_PREFIX_SIZE, LongRecDescriptor, Page, PageType};
use crate::volume::VolumeHeader;
use crate::MAX_TREE_DEPTH;

/// Name under which the directory tree identifies itself in journal records.
pub const DIRECTORY_TREE_NAME: &str = "_directory";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tree {
    pub name: String,
    pub root: u64,
    pub depth: usize,
}

/// Values longer than this spill into a long-record chain.
pub fn long_record_threshold(page_size: usize) -> usize {
    page_size / 4
}

pub fn max_key_size(page_size: usize) -> usize {
    MAX_KEY_SIZE.min(page_size / 8)
}

pub struct TreeOps<'a> {
    pool: &'a BufferPool,
}

impl<'a> TreeOps<'a> {
    pub fn new(pool: &'a BufferPool) -> TreeOps<'a> {
        TreeOps { pool }
    }

    pub fn pool(&self) -> &BufferPool {
        self.pool
    }

    // ---- directory tree ----------------------------------------------

    /// The directory tree, when the volume has one.
    pub fn directory_tree(&self) -> Result<Option<Tree>> {
        let header = self.pool.read_header()?;
        if header.directory_root == 0 {
            return Ok(None);
        }
        Ok(Some(Tree {
            name: DIRECTORY_TREE_NAME.to_string(),
            root: header.directory_root,
            depth: header.directory_depth as usize,
        }))
    }

    fn save_directory(&self, tree: &Tree) -> Result<()> {
        let mut head = self.pool.claim_exclusive(0)?;
        let mut header = VolumeHeader::decode(head.page())?;
        header.directory_root = tree.root;
        header.directory_depth = tree.depth as u16;
        header.encode_into(head.page_mut());
        self.pool.release(head)
    }

    fn ensure_directory(&self) -> Result<Tree> {
        if let Some(tree) = self.directory_tree()? {
            return Ok(tree);
        }
        let root = self.pool.allocate_page(PageType::Data)?;
        let tree = Tree {
            name: DIRECTORY_TREE_NAME.to_string(),
            root: root.address(),
            depth: 1,
        };
        self.pool.release(root)?;
        self.save_directory(&tree)?;
        Ok(tree)
    }

    fn encode_tree_value(tree: &Tree) -> [u8; 10] {
        let mut out = [0u8; 10];
        out[0..8].copy_from_slice(&tree.root.to_be_bytes());
        out[8..10].copy_from_slice(&(tree.depth as u16).to_be_bytes());
        out
    }

    fn decode_tree_value(name: &str, value: &[u8]) -> Result<Tree> {
        if value.len() != 10 {
            return Err(Error::corrupt_volume(
                0,
                format!("directory entry for {name} is {} bytes", value.len()),
            ));
        }
        Ok(Tree {
            name: name.to_string(),
            root: u64::from_be_bytes(value[0..8].try_into().unwrap()),
            depth: u16::from_be_bytes(value[8..10].try_into().unwrap()) as usize,
        })
    }

    pub fn get_tree(&self, name: &str) -> Result<Option<Tree>> {
        let Some(directory) = self.directory_tree()? else {
            return Ok(None);
        };
        let key = Key::from_str(name)?;
        match self.fetch_raw(&directory, &key)? {
            None => Ok(None),
            Some(value) => Self::decode_tree_value(name, &value).map(Some),
        }
    }

    pub fn create_tree(&self, name: &str) -> Result<Tree> {
        if let Some(tree) = self.get_tree(name)? {
            return Ok(tree);
        }
        let mut directory = self.ensure_directory()?;
        let root = self.pool.allocate_page(PageType::Data)?;
        let tree = Tree {
            name: name.to_string(),
            root: root.address(),
            depth: 1,
        };
        self.pool.release(root)?;
        let key = Key::from_str(name)?;
        self.store_in(&mut directory, &key, &Self::encode_tree_value(&tree), false)?;
        self.save_directory(&directory)?;
        Ok(tree)
    }

    fn save_tree(&self, tree: &Tree) -> Result<()> {
        if tree.name == DIRECTORY_TREE_NAME {
            return self.save_directory(tree);
        }
        let mut directory = self
            .directory_tree()?
            .ok_or_else(|| Error::TreeNotFound(tree.name.clone()))?;
        let key = Key::from_str(&tree.name)?;
        self.store_in(&mut directory, &key, &Self::encode_tree_value(tree), false)?;
        self.save_directory(&directory)?;
        Ok(())
    }

    pub fn list_trees(&self) -> Result<Vec<Tree>> {
        let Some(directory) = self.directory_tree()? else {
            return Ok(Vec::new());
        };
        let mut trees = Vec::new();
        self.traverse(&directory, |key, value| {
            let name = String::from_utf8_lossy(&key.encoded()[1..]).into_owned();
            trees.push(Self::decode_tree_value(&name, value)?);
            Ok(())
        })?;
        Ok(trees)
    }

    // ---- store -------------------------------------------------------

    fn check_key(&self, key: &Key) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidArgument("empty key".into()));
        }
        if key.len() > max_key_size(self.pool.page_size()) {
            return Err(Error::KeyTooLong(key.len()));
        }
        Ok(())
    }

    /// Stores a plain (primordial) value.
    pub fn store(&self, tree: &mut Tree, key: &Key, value: &[u8]) -> Result<()> {
        self.check_key(key)?;
        self.journal_store(tree, key, value)?;
        // A replaced long record must give its chain back.
        let displaced = match self.fetch_raw(tree, key)? {
            Some(region) if region.first() == Some(&crate::page::LONGREC_TYPE) => {
                Some(LongRecDescriptor::decode(&region)?)
            }
            _ => None,
        };
        let shape = (tree.root, tree.depth);
        self.store_in(tree, key, value, false)?;
        if tree.name != DIRECTORY_TREE_NAME && (tree.root, tree.depth) != shape {
            self.save_tree(tree)?;
        }
        if let Some(descriptor) = displaced {
            self.free_long_record(&descriptor)?;
        }
        Ok(())
    }

    /// Stores a value as a new version in the key's multi-version chain.
    pub fn store_version(&self, tree: &mut Tree, key: &Key, value: &[u8], version: u64) -> Result<()> {
        self.check_key(key)?;
        self.journal_store(tree, key, value)?;
        let shape = (tree.root, tree.depth);
        let entry = mvv::wrap_literal(value);
        self.store_in(tree, key, &version_payload(version, &entry), true)?;
        if (tree.root, tree.depth) != shape {
            self.save_tree(tree)?;
        }
        Ok(())
    }

    /// Records a delete at `version` without removing the key.
    pub fn remove_version(&self, tree: &mut Tree, key: &Key, version: u64) -> Result<()> {
        self.journal_remove(tree, key)?;
        let shape = (tree.root, tree.depth);
        self.store_in(
            tree,
            key,
            &version_payload(version, &[mvv::TYPE_ANTIVALUE]),
            true,
        )?;
        if (tree.root, tree.depth) != shape {
            self.save_tree(tree)?;
        }
        Ok(())
    }

    fn journal_store(&self, tree: &Tree, key: &Key, value: &[u8]) -> Result<()> {
        let Some(link) = self.pool.journal() else {
            return Ok(());
        };
        let ts = self.pool.next_timestamp();
        link.with_writer(|writer| -> Result<()> {
            let tree_handle = writer.handle_for_tree(ts, link.volume_handle(), &tree.name)?;
            writer.append(
                ts,
                &crate::journal::JournalRecord::TxStart {
                    start_timestamp: ts,
                },
            )?;
            writer.append(
                ts,
                &crate::journal::JournalRecord::Store {
                    tree_handle,
                    key: key.encoded().to_vec(),
                    value: value.to_vec(),
                },
            )?;
            writer.append(ts, &crate::journal::JournalRecord::TxCommit)?;
            Ok(())
        })
    }

    fn journal_remove(&self, tree: &Tree, key: &Key) -> Result<()> {
        let Some(link) = self.pool.journal() else {
            return Ok(());
        };
        let ts = self.pool.next_timestamp();
        link.with_writer(|writer| -> Result<()> {
            let tree_handle = writer.handle_for_tree(ts, link.volume_handle(), &tree.name)?;
            writer.append(
                ts,
                &crate::journal::JournalRecord::TxStart {
                    start_timestamp: ts,
                },
            )?;
            writer.append(
                ts,
                &crate::journal::JournalRecord::DeleteRange {
                    tree_handle,
                    key1: key.encoded().to_vec(),
                    key2: key.encoded().to_vec(),
                },
            )?;
            writer.append(ts, &crate::journal::JournalRecord::TxCommit)?;
            Ok(())
        })
    }

    /// The workhorse: resolves long-record spill, descends, splits, grows
    /// the root. `versioned` routes the payload through the MVV appender at
    /// the leaf instead of overwriting.
    fn store_in(
        &self,
        tree: &mut Tree,
        key: &Key,
        value: &[u8],
        versioned: bool,
    ) -> Result<()> {
        self.pool.wait_if_suspended();
        let page_size = self.pool.page_size();
        if key.len() > max_key_size(page_size) {
            return Err(Error::KeyTooLong(key.len()));
        }
        let spilled;
        let stored: &[u8] = if versioned {
            // Already a version payload; the leaf routes it through the
            // multi-version appender untouched.
            value
        } else if value.len() > long_record_threshold(page_size) {
            spilled = self.write_long_record(value)?;
            &spilled
        } else {
            spilled = mvv::wrap_literal(value).into_owned();
            &spilled
        };

        if let Some((promoted, right)) =
            self.insert_descend(tree.root, tree.depth - 1, key, stored, versioned)?
        {
            self.grow_root(tree, promoted, right)?;
        }
        Ok(())
    }

    fn insert_descend(
        &self,
        page_address: u64,
        level: usize,
        key: &Key,
        value: &[u8],
        versioned: bool,
    ) -> Result<Option<(Key, u64)>> {
        let mut guard = self.pool.claim_exclusive(page_address)?;
        if level == 0 {
            let payload;
            let stored: &[u8] = if versioned {
                let lookup = guard.page().find(key);
                let existing = if lookup.found {
                    guard.page().value_at(lookup.slot)
                } else {
                    &[]
                };
                if existing.first() == Some(&crate::page::LONGREC_TYPE) {
                    return Err(Error::StateViolation(
                        "cannot add a version to a long-record value",
                    ));
                }
                let (version, bytes) = split_version_payload(value);
                payload = mvv::append_version(existing, version, bytes)?;
                &payload
            } else {
                value
            };
            match guard.page_mut().insert(key, stored)? {
                InsertOutcome::Inserted | InsertOutcome::Replaced => {
                    self.pool.release(guard)?;
                    Ok(None)
                }
                InsertOutcome::NeedsSplit => self.split_page(guard, key, stored),
            }
        } else {
            let slot = self.descend_slot(guard.page(), key, page_address)?;
            let child = guard.page().child_at(slot)?;
            let split = self.insert_descend(child, level - 1, key, value, versioned)?;
            match split {
                None => {
                    self.pool.release(guard)?;
                    Ok(None)
                }
                Some((promoted, right_address)) => {
                    match guard
                        .page_mut()
                        .insert(&promoted, &right_address.to_be_bytes())?
                    {
                        InsertOutcome::Inserted | InsertOutcome::Replaced => {
                            self.pool.release(guard)?;
                            Ok(None)
                        }
                        InsertOutcome::NeedsSplit => {
                            self.split_page(guard, &promoted, &right_address.to_be_bytes())
                        }
                    }
                }
            }
        }
    }

    /// The child slot covering `key` on an index page.
    fn descend_slot(&self, page: &Page, key: &Key, address: u64) -> Result<usize> {
        let lookup = page.find(key);
        if lookup.found {
            return Ok(lookup.slot);
        }
        if lookup.slot == 0 {
            return Err(Error::corrupt_volume(address, "index page missing left edge"));
        }
        Ok(lookup.slot - 1)
    }

    fn split_page(
        &self,
        mut guard: crate::buffer::ExclusiveGuard,
        key: &Key,
        value: &[u8],
    ) -> Result<Option<(Key, u64)>> {
        let page_type = guard.page().page_type()?;
        let mut right = self.pool.allocate_page(page_type)?;
        let right_address = right.address();
        let promoted = guard
            .page_mut()
            .split_into(right.page_mut(), key, value)?;
        right
            .page_mut()
            .set_right_sibling(guard.page().right_sibling());
        guard.page_mut().set_right_sibling(right_address);
        self.pool.release(right)?;
        self.pool.release(guard)?;
        Ok(Some((promoted, right_address)))
    }

    fn grow_root(&self, tree: &mut Tree, promoted: Key, right: u64) -> Result<()> {
        if tree.depth >= MAX_TREE_DEPTH {
            return Err(Error::StateViolation("tree depth limit reached"));
        }
        let mut root = self.pool.allocate_page(PageType::Index(tree.depth))?;
        let root_address = root.address();
        root.page_mut()
            .insert(&Key::left_edge(), &tree.root.to_be_bytes())?;
        root.page_mut().insert(&promoted, &right.to_be_bytes())?;
        self.pool.release(root)?;
        tree.root = root_address;
        tree.depth += 1;
        Ok(())
    }

    // ---- fetch -------------------------------------------------------

    /// The latest value under a key, long records assembled, version chains
    /// resolved at the top.
    pub fn fetch(&self, tree: &Tree, key: &Key) -> Result<Option<Vec<u8>>> {
        self.fetch_at(tree, key, u64::MAX)
    }

    /// The value visible to `snapshot`.
    pub fn fetch_at(&self, tree: &Tree, key: &Key, snapshot: u64) -> Result<Option<Vec<u8>>> {
        let Some(region) = self.fetch_raw(tree, key)? else {
            return Ok(None);
        };
        if region.first() == Some(&crate::page::LONGREC_TYPE) {
            let descriptor = LongRecDescriptor::decode(&region)?;
            return self.read_long_record(&descriptor).map(Some);
        }
        match mvv::fetch_visible(&region, snapshot)? {
            mvv::Visibility::Absent | mvv::Visibility::Deleted => Ok(None),
            mvv::Visibility::Value(v) => Ok(Some(v.to_vec())),
        }
    }

    /// The raw value region, tags and all.
    fn fetch_raw(&self, tree: &Tree, key: &Key) -> Result<Option<Vec<u8>>> {
        let mut address = tree.root;
        for level in (1..tree.depth).rev() {
            let guard = self.pool.claim_shared(address)?;
            let expected = PageType::for_level(level);
            if guard.page().page_type()? != expected {
                return Err(Error::corrupt_volume(
                    address,
                    format!("expected {expected} page"),
                ));
            }
            let slot = self.descend_slot(guard.page(), key, address)?;
            address = guard.page().child_at(slot)?;
        }
        let guard = self.pool.claim_shared(address)?;
        let lookup = guard.page().find(key);
        if !lookup.found {
            return Ok(None);
        }
        Ok(Some(guard.page().value_at(lookup.slot).to_vec()))
    }

    // ---- remove ------------------------------------------------------

    /// Removes a key outright. Returns whether it was present.
    pub fn remove(&self, tree: &mut Tree, key: &Key) -> Result<bool> {
        self.pool.wait_if_suspended();
        self.journal_remove(tree, key)?;
        let mut address = tree.root;
        let mut level = tree.depth - 1;
        let mut guards = Vec::new();
        while level > 0 {
            let guard = self.pool.claim_exclusive(address)?;
            let slot = self.descend_slot(guard.page(), key, address)?;
            address = guard.page().child_at(slot)?;
            guards.push(guard);
            level -= 1;
        }
        let mut leaf = self.pool.claim_exclusive(address)?;
        let lookup = leaf.page().find(key);
        if !lookup.found {
            drop(leaf);
            return Ok(false);
        }
        let value = leaf.page().value_at(lookup.slot).to_vec();
        leaf.page_mut().remove(lookup.slot)?;
        self.pool.release(leaf)?;
        for guard in guards {
            // Index entries are left in place; an empty leaf keeps its slot.
            drop(guard);
        }
        if value.first() == Some(&crate::page::LONGREC_TYPE) {
            let descriptor = LongRecDescriptor::decode(&value)?;
            self.free_long_record(&descriptor)?;
        }
        Ok(true)
    }

    // ---- long records ------------------------------------------------

    fn write_long_record(&self, value: &[u8]) -> Result<Vec<u8>> {
        let capacity = Page::new(self.pool.page_size(), PageType::LongRecord, 0)
            .long_payload_capacity();
        let mut prefix = [0u8; LONGREC_PREFIX_SIZE];
        prefix.copy_from_slice(&value[..LONGREC_PREFIX_SIZE]);
        let chain = &value[LONGREC_PREFIX_SIZE..];

        let mut first_page = 0u64;
        let mut previous: Option<crate::buffer::ExclusiveGuard> = None;
        for chunk in chain.chunks(capacity) {
            let mut guard = self.pool.allocate_page(PageType::LongRecord)?;
            guard.page_mut().set_long_payload(chunk);
            if first_page == 0 {
                first_page = guard.address();
            }
            if let Some(mut prev) = previous.take() {
                prev.page_mut().set_right_sibling(guard.address());
                self.pool.release(prev)?;
            }
            previous = Some(guard);
        }
        if let Some(last) = previous {
            self.pool.release(last)?;
        }
        let descriptor = LongRecDescriptor {
            total_size: value.len() as u64,
            first_page,
            prefix,
        };
        Ok(descriptor.encode().to_vec())
    }

    fn read_long_record(&self, descriptor: &LongRecDescriptor) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(descriptor.total_size as usize);
        out.extend_from_slice(&descriptor.prefix);
        let mut address = descriptor.first_page;
        while address != 0 && (out.len() as u64) < descriptor.total_size {
            let guard = self.pool.claim_shared(address)?;
            if guard.page().page_type()? != PageType::LongRecord {
                return Err(Error::corrupt_volume(address, "long-record chain broken"));
            }
            out.extend_from_slice(guard.page().long_payload());
            address = guard.page().right_sibling();
        }
        if out.len() as u64 != descriptor.total_size {
            return Err(Error::corrupt_volume(
                descriptor.first_page,
                format!(
                    "long-record chain holds {} of {} bytes",
                    out.len(),
                    descriptor.total_size
                ),
            ));
        }
        Ok(out)
    }

    fn free_long_record(&self, descriptor: &LongRecDescriptor) -> Result<()> {
        let mut address = descriptor.first_page;
        while address != 0 {
            let next = {
                let guard = self.pool.claim_shared(address)?;
                guard.page().right_sibling()
            };
            self.pool.deallocate_run(address, address)?;
            address = next;
        }
        Ok(())
    }

    // ---- traversal and teardown --------------------------------------

    /// Visits every key left to right, with the raw value region.
    pub fn traverse(
        &self,
        tree: &Tree,
        mut visitor: impl FnMut(&Key, &[u8]) -> Result<()>,
    ) -> Result<()> {
        // Leftmost descent.
        let mut address = tree.root;
        for _ in (1..tree.depth).rev() {
            let guard = self.pool.claim_shared(address)?;
            if guard.page().key_count() == 0 {
                return Err(Error::corrupt_volume(address, "empty index page"));
            }
            address = guard.page().child_at(0)?;
        }
        while address != 0 {
            let guard = self.pool.claim_shared(address)?;
            let mut key = Key::new();
            for slot in 0..guard.page().key_count() {
                guard.page().next_key(slot, &mut key);
                visitor(&key, guard.page().value_at(slot))?;
            }
            address = guard.page().right_sibling();
        }
        Ok(())
    }

    /// Deallocates every page of a tree and drops its directory entry.
    pub fn drop_tree(&self, tree: &Tree) -> Result<()> {
        self.pool.wait_if_suspended();
        if let Some(link) = self.pool.journal() {
            let ts = self.pool.next_timestamp();
            link.with_writer(|writer| -> Result<()> {
                let tree_handle = writer.handle_for_tree(ts, link.volume_handle(), &tree.name)?;
                writer.append(ts, &crate::journal::JournalRecord::DeleteTree { tree_handle })?;
                Ok(())
            })?;
        }
        let mut pages = Vec::new();
        self.collect_pages(tree.root, tree.depth - 1, &mut pages)?;
        if let Some(directory) = self.directory_tree()?
            && tree.name != DIRECTORY_TREE_NAME
        {
            let mut directory = directory;
            let key = Key::from_str(&tree.name)?;
            let removed = self.remove_directory_entry(&mut directory, &key)?;
            if !removed {
                return Err(Error::TreeNotFound(tree.name.clone()));
            }
        }
        pages.sort_unstable();
        pages.dedup();
        // Coalesce into runs before threading them onto the garbage list.
        let mut run_start = 0u64;
        let mut run_end = 0u64;
        for &page in &pages {
            if run_start == 0 {
                run_start = page;
                run_end = page;
            } else if page == run_end + 1 {
                run_end = page;
            } else {
                self.pool.deallocate_run(run_start, run_end)?;
                run_start = page;
                run_end = page;
            }
        }
        if run_start != 0 {
            self.pool.deallocate_run(run_start, run_end)?;
        }
        Ok(())
    }

    fn remove_directory_entry(&self, directory: &mut Tree, key: &Key) -> Result<bool> {
        // The directory tree journals nothing; its entries are implied by
        // IT records.
        let mut address = directory.root;
        for _ in (1..directory.depth).rev() {
            let guard = self.pool.claim_exclusive(address)?;
            let slot = self.descend_slot(guard.page(), key, address)?;
            address = guard.page().child_at(slot)?;
        }
        let mut leaf = self.pool.claim_exclusive(address)?;
        let lookup = leaf.page().find(key);
        if !lookup.found {
            return Ok(false);
        }
        leaf.page_mut().remove(lookup.slot)?;
        self.pool.release(leaf)?;
        Ok(true)
    }

    fn collect_pages(&self, address: u64, level: usize, out: &mut Vec<u64>) -> Result<()> {
        out.push(address);
        let guard = self.pool.claim_shared(address)?;
        if level == 0 {
            let mut slot = 0;
            while let Some((at, descriptor)) = guard.page().next_long_record(slot) {
                let mut chain = descriptor.first_page;
                while chain != 0 {
                    out.push(chain);
                    let link = self.pool.claim_shared(chain)?;
                    chain = link.page().right_sibling();
                }
                slot = at + 1;
            }
            return Ok(());
        }
        for slot in 0..guard.page().key_count() {
            let child = guard.page().child_at(slot)?;
            self.collect_pages(child, level - 1, out)?;
        }
        Ok(())
    }
}

/// Packs `(version, bytes)` through the non-versioned plumbing: an 8-byte
/// big-endian version followed by the payload.
fn version_payload(version: u64, bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + bytes.len());
    out.extend_from_slice(&version.to_be_bytes());
    out.extend_from_slice(bytes);
    out
}

fn split_version_payload(payload: &[u8]) -> (u64, &[u8]) {
    let version = u64::from_be_bytes(payload[..8].try_into().unwrap());
    (version, &payload[8..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::volume::Volume;
    use tempfile::tempdir;

    fn setup(page_size: usize) -> (tempfile::TempDir, BufferPool) {
        let dir = tempdir().unwrap();
        let volume = Volume::create(dir.path().join("t.avol"), page_size).unwrap();
        (dir, BufferPool::new(volume))
    }

    fn skey(s: &str) -> Key {
        Key::from_str(s).unwrap()
    }

    #[test]
    fn create_store_fetch() {
        let (_dir, pool) = setup(1024);
        let ops = TreeOps::new(&pool);
        let mut tree = ops.create_tree("accounts").unwrap();
        ops.store(&mut tree, &skey("alice"), b"100").unwrap();
        ops.store(&mut tree, &skey("bob"), b"250").unwrap();
        assert_eq!(ops.fetch(&tree, &skey("alice")).unwrap().unwrap(), b"100");
        assert_eq!(ops.fetch(&tree, &skey("bob")).unwrap().unwrap(), b"250");
        assert!(ops.fetch(&tree, &skey("carol")).unwrap().is_none());
        // Replacement.
        ops.store(&mut tree, &skey("alice"), b"75").unwrap();
        assert_eq!(ops.fetch(&tree, &skey("alice")).unwrap().unwrap(), b"75");
    }

    #[test]
    fn tree_survives_reopen_via_directory() {
        let (_dir, pool) = setup(1024);
        let ops = TreeOps::new(&pool);
        let mut tree = ops.create_tree("t1").unwrap();
        ops.store(&mut tree, &skey("k"), b"v").unwrap();
        let found = ops.get_tree("t1").unwrap().unwrap();
        assert_eq!(found, tree);
        assert!(ops.get_tree("missing").unwrap().is_none());
        let names: Vec<String> = ops
            .list_trees()
            .unwrap()
            .into_iter()
            .map(|t| t.name)
            .collect();
        assert_eq!(names, vec!["t1".to_string()]);
    }

    #[test]
    fn splits_grow_the_tree_and_keep_order() {
        let (_dir, pool) = setup(1024);
        let ops = TreeOps::new(&pool);
        let mut tree = ops.create_tree("big").unwrap();
        let n = 500u64;
        for i in 0..n {
            // A spread-out insertion order exercises mid-page splits.
            let k = (i * 7919) % 10_000;
            ops.store(&mut tree, &Key::from_u64(k), format!("v{k}").as_bytes())
                .unwrap();
        }
        assert!(tree.depth > 1, "expected the root to split");
        for i in 0..n {
            let k = (i * 7919) % 10_000;
            assert_eq!(
                ops.fetch(&tree, &Key::from_u64(k)).unwrap().unwrap(),
                format!("v{k}").as_bytes()
            );
        }
        // Left-to-right traversal is strictly ordered.
        let mut previous: Option<Key> = None;
        let mut seen = 0usize;
        ops.traverse(&tree, |key, _| {
            if let Some(p) = &previous {
                assert!(key > p, "traversal regressed at {key}");
            }
            previous = Some(key.clone());
            seen += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, n as usize);
    }

    #[test]
    fn remove_and_refill() {
        let (_dir, pool) = setup(1024);
        let ops = TreeOps::new(&pool);
        let mut tree = ops.create_tree("r").unwrap();
        for i in 0..100u64 {
            ops.store(&mut tree, &Key::from_u64(i), b"x").unwrap();
        }
        for i in (0..100u64).step_by(2) {
            assert!(ops.remove(&mut tree, &Key::from_u64(i)).unwrap());
        }
        assert!(!ops.remove(&mut tree, &Key::from_u64(0)).unwrap());
        for i in 0..100u64 {
            let got = ops.fetch(&tree, &Key::from_u64(i)).unwrap();
            if i % 2 == 0 {
                assert!(got.is_none());
            } else {
                assert_eq!(got.unwrap(), b"x");
            }
        }
    }

    #[test]
    fn long_record_round_trip() {
        let (_dir, pool) = setup(1024);
        let ops = TreeOps::new(&pool);
        let mut tree = ops.create_tree("blobs").unwrap();
        let value: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        ops.store(&mut tree, &skey("blob"), &value).unwrap();
        assert_eq!(ops.fetch(&tree, &skey("blob")).unwrap().unwrap(), value);
        // The descriptor, not the value, lives on the data page.
        assert!(ops.remove(&mut tree, &skey("blob")).unwrap());
        assert!(ops.fetch(&tree, &skey("blob")).unwrap().is_none());
        // Freed chain pages are reusable.
        let header = pool.read_header().unwrap();
        assert_ne!(header.garbage_root, 0);
    }

    #[test]
    fn versioned_store_and_snapshot_reads() {
        let (_dir, pool) = setup(1024);
        let ops = TreeOps::new(&pool);
        let mut tree = ops.create_tree("mv").unwrap();
        ops.store(&mut tree, &skey("k"), b"base").unwrap();
        ops.store_version(&mut tree, &skey("k"), b"second", 10).unwrap();
        ops.store_version(&mut tree, &skey("k"), b"third", 20).unwrap();
        assert_eq!(ops.fetch_at(&tree, &skey("k"), 5).unwrap().unwrap(), b"base");
        assert_eq!(
            ops.fetch_at(&tree, &skey("k"), 10).unwrap().unwrap(),
            b"second"
        );
        assert_eq!(ops.fetch(&tree, &skey("k")).unwrap().unwrap(), b"third");
    }

    #[test]
    fn versioned_delete_hides_the_key() {
        let (_dir, pool) = setup(1024);
        let ops = TreeOps::new(&pool);
        let mut tree = ops.create_tree("mvd").unwrap();
        ops.store(&mut tree, &skey("k"), b"v").unwrap();
        ops.remove_version(&mut tree, &skey("k"), 9).unwrap();
        assert_eq!(ops.fetch_at(&tree, &skey("k"), 8).unwrap().unwrap(), b"v");
        assert!(ops.fetch_at(&tree, &skey("k"), 9).unwrap().is_none());
    }

    #[test]
    fn drop_tree_returns_pages_to_garbage() {
        let (_dir, pool) = setup(1024);
        let ops = TreeOps::new(&pool);
        let mut tree = ops.create_tree("gone").unwrap();
        for i in 0..200u64 {
            ops.store(&mut tree, &Key::from_u64(i), &[0u8; 40]).unwrap();
        }
        let tree = ops.get_tree("gone").unwrap().unwrap();
        ops.drop_tree(&tree).unwrap();
        assert!(ops.get_tree("gone").unwrap().is_none());
        let header = pool.read_header().unwrap();
        assert_ne!(header.garbage_root, 0);
        // The freed pages satisfy new allocations before the file grows.
        let before = pool.read_header().unwrap().next_available;
        let guard = pool.allocate_page(PageType::Data).unwrap();
        assert!(guard.address() < before);
        pool.release(guard).unwrap();
    }

    #[test]
    fn oversized_key_is_rejected() {
        let (_dir, pool) = setup(1024);
        let ops = TreeOps::new(&pool);
        let mut tree = ops.create_tree("limits").unwrap();
        let long = "k".repeat(max_key_size(1024) + 1);
        assert!(matches!(
            ops.store(&mut tree, &Key::from_str(&long).unwrap(), b"v"),
            Err(Error::KeyTooLong(_))
        ));
    }
}
