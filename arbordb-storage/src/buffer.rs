//! Buffer pool.
//!
//! Every page access goes through a claim: shared for readers, exclusive for
//! writers, with a timeout that surfaces as [`Error::InUse`]. Frames are
//! write-through: releasing an exclusive claim on a dirty page appends the
//! page-image journal record first and then writes the page to the volume,
//! which is the ordering recovery depends on.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawRwLock, RwLock};

use crate::error::{Error, Result};
use crate::journal::JournalLink;
use crate::page::{Page, PageType};
use crate::volume::{Volume, VolumeHeader};

pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Claim {
    Shared,
    Exclusive,
}

pub struct Frame {
    page: Page,
    dirty: bool,
    generation: u64,
}

type FrameLock = Arc<RwLock<Frame>>;

pub struct BufferPool {
    volume: Volume,
    frames: Mutex<HashMap<u64, FrameLock>>,
    timestamp: AtomicU64,
    generation: AtomicU64,
    suspended: AtomicBool,
    claim_timeout: Duration,
    journal: Option<Arc<JournalLink>>,
}

pub struct SharedGuard {
    address: u64,
    guard: ArcRwLockReadGuard<RawRwLock, Frame>,
}

impl SharedGuard {
    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn page(&self) -> &Page {
        &self.guard.page
    }

    pub fn generation(&self) -> u64 {
        self.guard.generation
    }
}

pub struct ExclusiveGuard {
    address: u64,
    guard: ArcRwLockWriteGuard<RawRwLock, Frame>,
}

impl ExclusiveGuard {
    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn page(&self) -> &Page {
        &self.guard.page
    }

    pub fn page_mut(&mut self) -> &mut Page {
        self.guard.dirty = true;
        &mut self.guard.page
    }
}

impl BufferPool {
    pub fn new(volume: Volume) -> BufferPool {
        BufferPool {
            volume,
            frames: Mutex::new(HashMap::new()),
            timestamp: AtomicU64::new(1),
            generation: AtomicU64::new(1),
            suspended: AtomicBool::new(false),
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
            journal: None,
        }
    }

    pub fn with_claim_timeout(mut self, timeout: Duration) -> BufferPool {
        self.claim_timeout = timeout;
        self
    }

    pub fn attach_journal(&mut self, link: Arc<JournalLink>) {
        self.journal = Some(link);
    }

    pub fn journal(&self) -> Option<&Arc<JournalLink>> {
        self.journal.as_ref()
    }

    pub fn volume(&self) -> &Volume {
        &self.volume
    }

    pub fn page_size(&self) -> usize {
        self.volume.page_size()
    }

    /// Engine-wide timestamp counter; every mutation stamps its page with a
    /// fresh value.
    pub fn next_timestamp(&self) -> u64 {
        self.timestamp.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::SeqCst)
    }

    /// Raises the timestamp floor, e.g. after replaying a journal whose
    /// records carry later timestamps.
    pub fn observe_timestamp(&self, ts: u64) {
        self.timestamp.fetch_max(ts + 1, Ordering::SeqCst);
    }

    pub fn set_suspend_updates(&self, suspend: bool) {
        self.suspended.store(suspend, Ordering::SeqCst);
    }

    pub fn updates_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    /// Mutators call this at their suspension points before claiming pages.
    pub fn wait_if_suspended(&self) {
        while self.updates_suspended() {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn frame(&self, address: u64, load: bool) -> Result<FrameLock> {
        let mut frames = self.frames.lock();
        if let Some(frame) = frames.get(&address) {
            return Ok(frame.clone());
        }
        let page = if load {
            self.volume.read_page(address)?
        } else {
            Page::new(self.volume.page_size(), PageType::Unused, address)
        };
        let frame = Arc::new(RwLock::new(Frame {
            page,
            dirty: false,
            generation: self.generation.fetch_add(1, Ordering::Relaxed),
        }));
        frames.insert(address, frame.clone());
        Ok(frame)
    }

    pub fn claim_shared(&self, address: u64) -> Result<SharedGuard> {
        let frame = self.frame(address, true)?;
        let guard = frame
            .try_read_arc_for(self.claim_timeout)
            .ok_or(Error::InUse { address })?;
        Ok(SharedGuard { address, guard })
    }

    pub fn claim_exclusive(&self, address: u64) -> Result<ExclusiveGuard> {
        if self.volume.read_only() {
            return Err(Error::ReadOnly);
        }
        let frame = self.frame(address, true)?;
        let guard = frame
            .try_write_arc_for(self.claim_timeout)
            .ok_or(Error::InUse { address })?;
        Ok(ExclusiveGuard { address, guard })
    }

    /// Claims a page that has never been written, initializing it in memory
    /// instead of reading the volume.
    pub fn claim_new(&self, address: u64, page_type: PageType) -> Result<ExclusiveGuard> {
        if self.volume.read_only() {
            return Err(Error::ReadOnly);
        }
        let frame = self.frame(address, false)?;
        let mut guard = frame
            .try_write_arc_for(self.claim_timeout)
            .ok_or(Error::InUse { address })?;
        guard.page.init(page_type, address);
        guard.dirty = true;
        guard.generation = self.generation.fetch_add(1, Ordering::Relaxed);
        Ok(ExclusiveGuard { address, guard })
    }

    /// Releases an exclusive claim, journaling and writing back the page if
    /// it was modified.
    pub fn release(&self, mut guard: ExclusiveGuard) -> Result<()> {
        if !guard.guard.dirty {
            return Ok(());
        }
        let ts = self.next_timestamp();
        guard.guard.page.set_timestamp(ts);
        if let Some(link) = &self.journal {
            link.write_page_image(ts, &guard.guard.page)?;
        }
        self.volume.write_page(&guard.guard.page)?;
        guard.guard.dirty = false;
        Ok(())
    }

    /// Drops a dirty exclusive claim without writing back, e.g. when the
    /// operation that dirtied the page failed part-way.
    pub fn discard(&self, guard: ExclusiveGuard) {
        drop(guard);
    }

    pub fn read_header(&self) -> Result<VolumeHeader> {
        let head = self.claim_shared(0)?;
        VolumeHeader::decode(head.page())
    }

    /// Allocates a page: pops the garbage list if possible, otherwise
    /// extends the volume. Returns an exclusive claim on the fresh page.
    pub fn allocate_page(&self, page_type: PageType) -> Result<ExclusiveGuard> {
        let mut head = self.claim_exclusive(0)?;
        let mut header = VolumeHeader::decode(head.page())?;
        let address = match self.pop_garbage(&mut header)? {
            Some(address) => address,
            None => {
                let address = header.next_available;
                header.next_available += 1;
                address
            }
        };
        header.encode_into(head.page_mut());
        self.release(head)?;
        self.claim_new(address, page_type)
    }

    fn pop_garbage(&self, header: &mut VolumeHeader) -> Result<Option<u64>> {
        if header.garbage_root == 0 {
            return Ok(None);
        }
        let mut garbage = self.claim_exclusive(header.garbage_root)?;
        match garbage.page_mut().pop_garbage_entry() {
            Some((left, right)) => {
                if left < right {
                    // Put the rest of the run back.
                    garbage.page_mut().push_garbage_entry(left + 1, right);
                }
                self.release(garbage)?;
                Ok(Some(left))
            }
            None => {
                // The empty garbage page itself is the next allocation.
                let address = garbage.address();
                header.garbage_root = garbage.page().right_sibling();
                self.release(garbage)?;
                Ok(Some(address))
            }
        }
    }

    /// Pushes an inclusive run of free pages onto the garbage list. The run
    /// must no longer be reachable from any tree.
    pub fn deallocate_run(&self, left: u64, right: u64) -> Result<()> {
        if left == 0 || left > right {
            return Err(Error::InvalidArgument(format!(
                "bad garbage run [{left}, {right}]"
            )));
        }
        let mut head = self.claim_exclusive(0)?;
        let mut header = VolumeHeader::decode(head.page())?;
        if header.garbage_root != 0 {
            let mut garbage = self.claim_exclusive(header.garbage_root)?;
            if garbage.page_mut().push_garbage_entry(left, right) {
                self.release(garbage)?;
                self.release(head)?;
                return Ok(());
            }
            self.discard(garbage);
        }
        // No room: the run's first page becomes a new garbage page chained
        // in front of the list.
        let mut garbage = self.claim_new(left, PageType::Garbage)?;
        garbage.page_mut().set_right_sibling(header.garbage_root);
        if left < right {
            garbage.page_mut().push_garbage_entry(left + 1, right);
        }
        self.release(garbage)?;
        header.garbage_root = left;
        header.encode_into(head.page_mut());
        self.release(head)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pool(page_size: usize) -> (tempfile::TempDir, BufferPool) {
        let dir = tempdir().unwrap();
        let volume = Volume::create(dir.path().join("t.avol"), page_size).unwrap();
        (dir, BufferPool::new(volume))
    }

    #[test]
    fn allocate_extends_volume() {
        let (_dir, pool) = pool(1024);
        let a = pool.allocate_page(PageType::Data).unwrap();
        assert_eq!(a.address(), 1);
        pool.release(a).unwrap();
        let b = pool.allocate_page(PageType::Data).unwrap();
        assert_eq!(b.address(), 2);
        pool.release(b).unwrap();
        assert_eq!(pool.read_header().unwrap().next_available, 3);
    }

    #[test]
    fn deallocate_then_reallocate() {
        let (_dir, pool) = pool(1024);
        for _ in 0..5 {
            let g = pool.allocate_page(PageType::Data).unwrap();
            pool.release(g).unwrap();
        }
        // Pages 2..=4 become garbage; page 2 itself hosts the list.
        pool.deallocate_run(2, 4).unwrap();
        let header = pool.read_header().unwrap();
        assert_eq!(header.garbage_root, 2);

        // The run {3,4} comes back first, then the emptied garbage page.
        let a = pool.allocate_page(PageType::Data).unwrap();
        assert_eq!(a.address(), 3);
        pool.release(a).unwrap();
        let b = pool.allocate_page(PageType::Data).unwrap();
        assert_eq!(b.address(), 4);
        pool.release(b).unwrap();
        let c = pool.allocate_page(PageType::Data).unwrap();
        assert_eq!(c.address(), 2);
        pool.release(c).unwrap();
        assert_eq!(pool.read_header().unwrap().garbage_root, 0);
        // The free list is exhausted; allocation extends again.
        let d = pool.allocate_page(PageType::Data).unwrap();
        assert_eq!(d.address(), 6);
        pool.release(d).unwrap();
    }

    #[test]
    fn exclusive_claim_times_out() {
        let (_dir, pool) = pool(1024);
        let pool = pool.with_claim_timeout(Duration::from_millis(50));
        let g = pool.allocate_page(PageType::Data).unwrap();
        let held = g.address();
        match pool.claim_exclusive(held) {
            Err(Error::InUse { address }) => assert_eq!(address, held),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("claim should have timed out"),
        }
        pool.release(g).unwrap();
        let again = pool.claim_exclusive(held).unwrap();
        pool.release(again).unwrap();
    }

    #[test]
    fn shared_claims_coexist() {
        let (_dir, pool) = pool(1024);
        let g = pool.allocate_page(PageType::Data).unwrap();
        let address = g.address();
        pool.release(g).unwrap();
        let a = pool.claim_shared(address).unwrap();
        let b = pool.claim_shared(address).unwrap();
        assert_eq!(a.page().page_address(), b.page().page_address());
    }

    #[test]
    fn release_writes_through() {
        let (_dir, pool) = pool(1024);
        let mut g = pool.allocate_page(PageType::Data).unwrap();
        let address = g.address();
        g.page_mut().set_right_sibling(77);
        pool.release(g).unwrap();
        let read = pool.volume().read_page(address).unwrap();
        assert_eq!(read.right_sibling(), 77);
        assert!(read.timestamp() > 0);
    }
}
