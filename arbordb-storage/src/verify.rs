//! Integrity verification.
//!
//! The checker walks every selected tree pre-order, holding a shared claim
//! on each page while its children are visited, and reconciles sibling
//! chains against parent pointers by walking right between successive
//! children. Every touched page is flagged in a 64-bit bitset; a second
//! touch, a broken sibling, a garbage-list overlap, or a page that fails
//! byte-level verification becomes a fault. Faults carry the descent path so
//! a reader can find the page from the root.
//!
//! With pruning enabled the checker revisits clean multi-version data pages
//! under an exclusive claim and drops obsolete versions through the commit
//! oracle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use regex::Regex;
use serde::Serialize;

use crate::MAX_TREE_DEPTH;
use crate::alert::{AlertLevel, AlertMonitor};
use crate::bitset::LongBitSet;
use crate::buffer::BufferPool;
use crate::error::{Error, Result};
use crate::key::Key;
use crate::mvv;
use crate::page::{PageScan, PageType, KEY_BLOCK_START};
use crate::tree::{Tree, TreeOps};

pub const MAX_WALK_RIGHT: usize = 1000;
pub const MAX_HOLES_TO_FIX: usize = 1000;
pub const MAX_FAULTS: usize = 200;
pub const MAX_PRUNING_ERRORS: u64 = 50;

const ALERT_VERIFY: &str = "verify";
const ALERT_PRUNE: &str = "prune";

/// A right-sibling at some level whose parent pointer is missing one level
/// up. Offered to the cleanup collaborator; the checker never repairs index
/// pages itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IndexHole {
    pub tree: String,
    pub page: u64,
    pub level: usize,
}

pub trait CleanupSink {
    fn offer(&self, hole: &IndexHole) -> bool;
}

#[derive(Clone, Debug, Serialize)]
pub struct Fault {
    pub resource: String,
    pub description: String,
    /// Page addresses from the faulting level up to the root.
    pub path: Vec<u64>,
    pub level: usize,
    pub position: usize,
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} (level {}, position {}, path {:?})",
            self.resource, self.description, self.level, self.position, self.path
        )
    }
}

#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct CheckCounters {
    pub index_pages: u64,
    pub index_bytes: u64,
    pub data_pages: u64,
    pub data_bytes: u64,
    pub long_record_pages: u64,
    pub long_record_bytes: u64,
    pub mvv_pages: u64,
    pub mvv_records: u64,
    pub mvv_overhead: u64,
    pub mvv_anti_values: u64,
    pub index_holes: u64,
    pub pruned_pages: u64,
}

impl CheckCounters {
    pub const CSV_HEADER: &'static str = "IndexPages,IndexBytes,DataPages,DataBytes,\
        LongRecordPages,LongRecordBytes,MvvPages,MvvRecords,MvvOverhead,MvvAntiValues,\
        IndexHoles,PrunedPages";

    pub fn csv_row(&self) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{},{},{}",
            self.index_pages,
            self.index_bytes,
            self.data_pages,
            self.data_bytes,
            self.long_record_pages,
            self.long_record_bytes,
            self.mvv_pages,
            self.mvv_records,
            self.mvv_overhead,
            self.mvv_anti_values,
            self.index_holes,
            self.pruned_pages
        )
    }
}

#[derive(Clone, Debug)]
pub struct IntegrityCheckOptions {
    /// Tree name selector: glob by default (`*`, `?`), regex with
    /// `selector_is_regex`.
    pub tree_selector: String,
    pub selector_is_regex: bool,
    /// Freeze updates for the duration of the run (cleared by the CLI's `u`
    /// flag).
    pub freeze_updates: bool,
    pub fix_holes: bool,
    pub prune: bool,
    pub prune_and_clear: bool,
    pub verbose: bool,
    pub csv: bool,
    /// Settle wait after freezing, letting in-flight mutations finish.
    pub settle: Duration,
    /// Low-water version for pruning; the engine timestamp when absent.
    pub prune_floor: Option<u64>,
}

impl Default for IntegrityCheckOptions {
    fn default() -> IntegrityCheckOptions {
        IntegrityCheckOptions {
            tree_selector: "*".to_string(),
            selector_is_regex: false,
            freeze_updates: true,
            fix_holes: false,
            prune: false,
            prune_and_clear: false,
            verbose: false,
            csv: false,
            settle: Duration::from_secs(3),
            prune_floor: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub counters: CheckCounters,
    pub faults: Vec<Fault>,
    pub holes: Vec<IndexHole>,
    pub trees_checked: Vec<String>,
    pub pages_visited: u64,
    pub garbage_pages: u64,
    pub free_bytes: u64,
    pub used_page_count: u64,
    pub next_available: u64,
    pub pruning_errors: u64,
    pub holes_offered: u64,
}

impl CheckReport {
    pub fn is_clean(&self) -> bool {
        self.faults.is_empty()
    }

    pub fn to_csv(&self) -> String {
        format!("{}\n{}", CheckCounters::CSV_HEADER, self.counters.csv_row())
    }
}

pub struct IntegrityCheck<'a> {
    pool: &'a BufferPool,
    options: IntegrityCheckOptions,
    oracle: Option<&'a dyn mvv::CommitOracle>,
    cleanup: Option<&'a dyn CleanupSink>,
    monitor: Option<&'a AlertMonitor>,
    stop: Arc<AtomicBool>,

    used: LongBitSet,
    faults: Vec<Fault>,
    counters: CheckCounters,
    holes: Vec<IndexHole>,
    path: Vec<u64>,
    edge_page: [u64; MAX_TREE_DEPTH],
    edge_key: [Key; MAX_TREE_DEPTH],
    free_bytes: u64,
    pages_visited: u64,
    garbage_pages: u64,
    pruning_errors: u64,
    resource: String,
}

impl<'a> IntegrityCheck<'a> {
    pub fn new(pool: &'a BufferPool) -> IntegrityCheck<'a> {
        IntegrityCheck {
            pool,
            options: IntegrityCheckOptions::default(),
            oracle: None,
            cleanup: None,
            monitor: None,
            stop: Arc::new(AtomicBool::new(false)),
            used: LongBitSet::new(),
            faults: Vec::new(),
            counters: CheckCounters::default(),
            holes: Vec::new(),
            path: Vec::new(),
            edge_page: [0; MAX_TREE_DEPTH],
            edge_key: std::array::from_fn(|_| Key::new()),
            free_bytes: 0,
            pages_visited: 0,
            garbage_pages: 0,
            pruning_errors: 0,
            resource: String::new(),
        }
    }

    pub fn with_options(mut self, options: IntegrityCheckOptions) -> IntegrityCheck<'a> {
        self.options = options;
        self
    }

    pub fn with_oracle(mut self, oracle: &'a dyn mvv::CommitOracle) -> IntegrityCheck<'a> {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_cleanup(mut self, cleanup: &'a dyn CleanupSink) -> IntegrityCheck<'a> {
        self.cleanup = Some(cleanup);
        self
    }

    pub fn with_monitor(mut self, monitor: &'a AlertMonitor) -> IntegrityCheck<'a> {
        self.monitor = Some(monitor);
        self
    }

    /// Cooperative cancellation; checked between page visits.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    fn fault(&mut self, level: usize, position: usize, description: String) {
        if let Some(monitor) = self.monitor {
            monitor.post_now(ALERT_VERIFY, AlertLevel::Warn, &description);
        }
        if self.faults.len() >= MAX_FAULTS {
            return;
        }
        let mut path = self.path.clone();
        path.reverse();
        self.faults.push(Fault {
            resource: self.resource.clone(),
            description,
            path,
            level,
            position,
        });
    }

    fn selector(&self) -> Result<Regex> {
        let pattern = if self.options.selector_is_regex {
            self.options.tree_selector.clone()
        } else {
            // Glob: `*` and `?`, everything else literal.
            let mut out = String::with_capacity(self.options.tree_selector.len() + 4);
            out.push('^');
            for c in self.options.tree_selector.chars() {
                match c {
                    '*' => out.push_str(".*"),
                    '?' => out.push('.'),
                    c => out.push_str(&regex::escape(&c.to_string())),
                }
            }
            out.push('$');
            out
        };
        Regex::new(&pattern)
            .map_err(|e| Error::InvalidArgument(format!("bad tree selector: {e}")))
    }

    pub fn run(&mut self) -> Result<CheckReport> {
        if self.options.prune_and_clear && self.options.tree_selector != "*" {
            return Err(Error::StateViolation(
                "prune-and-clear requires the whole-volume selector",
            ));
        }
        let selector = self.selector()?;
        let ops = TreeOps::new(self.pool);

        let frozen = self.options.freeze_updates;
        if frozen {
            self.pool.set_suspend_updates(true);
            std::thread::sleep(self.options.settle);
        }
        let outcome = self.run_inner(&ops, &selector);
        if frozen {
            self.pool.set_suspend_updates(false);
        }
        outcome
    }

    fn run_inner(&mut self, ops: &TreeOps<'_>, selector: &Regex) -> Result<CheckReport> {
        let header = self.pool.read_header()?;

        let mut trees: Vec<Tree> = Vec::new();
        if let Some(directory) = ops.directory_tree()? {
            trees.push(directory);
        }
        for tree in ops.list_trees()? {
            if selector.is_match(&tree.name) {
                trees.push(tree);
            }
        }

        let mut checked = Vec::new();
        for tree in &trees {
            if self.stopped() {
                break;
            }
            checked.push(tree.name.clone());
            self.check_tree(tree)?;
        }

        self.traverse_garbage(header.garbage_root, header.next_available)?;
        // The closure check is only meaningful when every tree was walked.
        if self.options.tree_selector == "*" && !self.stopped() {
            self.account_for_every_page(header.next_available);
        }

        let mut holes_offered = 0u64;
        if self.options.fix_holes
            && let Some(cleanup) = self.cleanup
        {
            for hole in &self.holes {
                if cleanup.offer(hole) {
                    holes_offered += 1;
                }
            }
        }
        if self.options.prune_and_clear
            && let Some(oracle) = self.oracle
        {
            oracle.reset_mvv_counts(0);
        }

        Ok(CheckReport {
            counters: self.counters,
            faults: std::mem::take(&mut self.faults),
            holes: std::mem::take(&mut self.holes),
            trees_checked: checked,
            pages_visited: self.pages_visited,
            garbage_pages: self.garbage_pages,
            free_bytes: self.free_bytes,
            used_page_count: self.used.count_ones(),
            next_available: header.next_available,
            pruning_errors: self.pruning_errors,
            holes_offered,
        })
    }

    fn check_tree(&mut self, tree: &Tree) -> Result<()> {
        self.resource = tree.name.clone();
        self.edge_page = [0; MAX_TREE_DEPTH];
        for key in &mut self.edge_key {
            key.clear();
        }
        self.path.clear();
        if tree.depth == 0 || tree.depth > MAX_TREE_DEPTH {
            self.fault(0, 0, format!("tree depth {} out of range", tree.depth));
            return Ok(());
        }
        self.visit_page(tree, tree.root, tree.depth - 1, None)
    }

    fn visit_page(
        &mut self,
        tree: &Tree,
        address: u64,
        level: usize,
        parent_key: Option<&Key>,
    ) -> Result<()> {
        if self.stopped() {
            return Ok(());
        }
        // Lateral reconciliation: siblings between the last child seen at
        // this level and this page are index holes.
        let edge = self.edge_page[level];
        if edge != 0 && edge != address {
            self.walk_right(tree, level, edge, address)?;
        }

        if self.used.set(address) {
            self.fault(level, 0, format!("page {address} has more than one parent"));
            return Ok(());
        }
        self.visit_marked(tree, address, level, parent_key)
    }

    /// Visits a page already flagged in the used set.
    fn visit_marked(
        &mut self,
        tree: &Tree,
        address: u64,
        level: usize,
        parent_key: Option<&Key>,
    ) -> Result<()> {
        self.path.push(address);
        let outcome = self.visit_claimed(tree, address, level, parent_key);
        self.path.pop();
        outcome
    }

    fn visit_claimed(
        &mut self,
        tree: &Tree,
        address: u64,
        level: usize,
        parent_key: Option<&Key>,
    ) -> Result<()> {
        self.pages_visited += 1;
        let guard = match self.pool.claim_shared(address) {
            Ok(guard) => guard,
            Err(Error::InUse { .. }) => {
                self.fault(level, 0, format!("page {address} claim timed out"));
                return Ok(());
            }
            Err(e) => {
                // An unreadable page costs the subtree, not the run.
                self.fault(level, 0, format!("page {address} unreadable: {e}"));
                return Ok(());
            }
        };
        self.edge_page[level] = address;

        let expected = PageType::for_level(level);
        let mut scan = PageScan::default();
        let page_fault = guard.page().verify(expected, &mut scan);

        // Counters stay accurate even for faulty pages.
        let used_bytes = guard.page().used_bytes() as u64;
        let page_size = guard.page().page_size() as u64;
        self.free_bytes += page_size - used_bytes;
        if level == 0 {
            self.counters.data_pages += 1;
            self.counters.data_bytes += used_bytes;
            if scan.has_mvv {
                self.counters.mvv_pages += 1;
            }
            self.counters.mvv_records += scan.mvv_records as u64;
            self.counters.mvv_overhead += scan.mvv_overhead as u64;
            self.counters.mvv_anti_values += scan.mvv_anti_values as u64;
        } else {
            self.counters.index_pages += 1;
            self.counters.index_bytes += used_bytes;
        }

        if let Some(fault) = page_fault {
            self.fault(level, fault.position, fault.description);
            return Ok(());
        }

        // Key ordering across the level (and against the parent entry).
        let count = guard.page().key_count();
        if count > 0 {
            let first = guard.page().key_at(0);
            if let Some(parent_key) = parent_key
                && first.encoded() < parent_key.encoded()
            {
                self.fault(
                    level,
                    0,
                    format!("first key {first} sorts below its parent entry {parent_key}"),
                );
            }
            if !self.edge_key[level].is_empty()
                && first.encoded() <= self.edge_key[level].encoded()
            {
                self.fault(
                    level,
                    0,
                    format!("first key {first} does not advance the level"),
                );
            }
            let last = guard.page().key_at(count - 1);
            self.edge_key[level].set_encoded(last.encoded());
        }

        if level > 0 {
            let mut entry_key = Key::new();
            for slot in 0..count {
                if self.stopped() {
                    break;
                }
                guard.page().next_key(slot, &mut entry_key);
                let child = match guard.page().child_at(slot) {
                    Ok(child) => child,
                    Err(_) => {
                        self.fault(level, slot, format!("slot {slot} malformed child pointer"));
                        continue;
                    }
                };
                let child_key = entry_key.clone();
                self.visit_page(tree, child, level - 1, Some(&child_key))?;
            }
        } else {
            self.chase_long_records(level, &guard)?;
        }

        let prune_wanted = self.options.prune || self.options.prune_and_clear;
        if prune_wanted && level == 0 && scan.has_mvv && !self.pool.volume().read_only() {
            drop(guard);
            self.prune_page(address);
        }
        Ok(())
    }

    fn chase_long_records(&mut self, level: usize, guard: &crate::buffer::SharedGuard) -> Result<()> {
        let mut slot = 0;
        while let Some((at, descriptor)) = guard.page().next_long_record(slot) {
            slot = at + 1;
            let mut chain_bytes = 0u64;
            let mut address = descriptor.first_page;
            let mut hops = 0usize;
            while address != 0 {
                if self.used.set(address) {
                    self.fault(
                        level,
                        at,
                        format!("long-record page {address} appears in two chains"),
                    );
                    break;
                }
                hops += 1;
                if hops > MAX_WALK_RIGHT {
                    self.fault(level, at, "long-record chain exceeds hop limit".to_string());
                    break;
                }
                let link = match self.pool.claim_shared(address) {
                    Ok(link) => link,
                    Err(e) => {
                        self.fault(level, at, format!("long-record page {address}: {e}"));
                        break;
                    }
                };
                match link.page().page_type() {
                    Ok(PageType::LongRecord) => {}
                    _ => {
                        self.fault(
                            level,
                            at,
                            format!("long-record chain reaches a foreign page {address}"),
                        );
                        break;
                    }
                }
                let payload = link.page().long_payload().len() as u64;
                chain_bytes += payload;
                self.counters.long_record_pages += 1;
                self.counters.long_record_bytes += payload + KEY_BLOCK_START as u64;
                self.free_bytes +=
                    link.page().page_size() as u64 - payload - KEY_BLOCK_START as u64;
                self.pages_visited += 1;
                address = link.page().right_sibling();
            }
            if chain_bytes != descriptor.chain_size() {
                self.fault(
                    level,
                    at,
                    format!(
                        "long-record chain holds {chain_bytes} bytes, descriptor says {}",
                        descriptor.chain_size()
                    ),
                );
            }
        }
        Ok(())
    }

    fn walk_right(&mut self, tree: &Tree, level: usize, from: u64, target: u64) -> Result<()> {
        let start = from;
        let mut current = from;
        let mut hops = 0usize;
        loop {
            if self.stopped() {
                return Ok(());
            }
            let sibling = match self.pool.claim_shared(current) {
                Ok(guard) => guard.page().right_sibling(),
                Err(e) => {
                    self.fault(level, 0, format!("walk-right blocked at {current}: {e}"));
                    return Ok(());
                }
            };
            if sibling == target {
                return Ok(());
            }
            if sibling == 0 || sibling > crate::MAX_VALID_PAGE_ADDR {
                self.fault(
                    level,
                    0,
                    format!("right sibling {sibling} of {current} is invalid"),
                );
                return Ok(());
            }
            if sibling == start {
                self.fault(level, 0, format!("right pointer cycle through {start}"));
                return Ok(());
            }
            hops += 1;
            if hops > MAX_WALK_RIGHT {
                self.fault(level, 0, "walk-right exceeded the hop limit".to_string());
                return Ok(());
            }
            // A sibling the parent level does not reference.
            if self.holes.len() < MAX_HOLES_TO_FIX {
                self.holes.push(IndexHole {
                    tree: tree.name.clone(),
                    page: sibling,
                    level,
                });
                self.counters.index_holes += 1;
            }
            if !self.used.set(sibling) {
                self.visit_marked(tree, sibling, level, None)?;
            }
            current = sibling;
        }
    }

    fn prune_page(&mut self, address: u64) {
        let floor = self
            .options
            .prune_floor
            .unwrap_or_else(|| self.pool.current_timestamp());
        let outcome = (|| -> Result<bool> {
            let mut guard = self.pool.claim_exclusive(address)?;
            let oracle = self.oracle.unwrap_or(&mvv::AssumeCommitted);
            let stats = guard.page_mut().prune_mvv(oracle, floor)?;
            self.pool.release(guard)?;
            Ok(stats.rewritten + stats.removed_keys > 0)
        })();
        match outcome {
            Ok(true) => self.counters.pruned_pages += 1,
            Ok(false) => {}
            Err(e) => {
                if let Some(monitor) = self.monitor {
                    monitor.post_now(ALERT_PRUNE, AlertLevel::Error, &e.to_string());
                }
                if self.pruning_errors < MAX_PRUNING_ERRORS {
                    self.pruning_errors += 1;
                }
            }
        }
    }

    fn traverse_garbage(&mut self, garbage_root: u64, next_available: u64) -> Result<()> {
        self.resource = "_garbage".to_string();
        self.path.clear();
        let mut address = garbage_root;
        let mut hops = 0usize;
        while address != 0 {
            if self.stopped() {
                return Ok(());
            }
            hops += 1;
            if hops > MAX_WALK_RIGHT {
                self.fault(0, 0, "garbage chain exceeds the hop limit".to_string());
                return Ok(());
            }
            if self.used.set(address) {
                self.fault(0, 0, format!("garbage page {address} is also tree-reachable"));
                return Ok(());
            }
            self.garbage_pages += 1;
            let guard = match self.pool.claim_shared(address) {
                Ok(guard) => guard,
                Err(e) => {
                    self.fault(0, 0, format!("garbage page {address} unreadable: {e}"));
                    return Ok(());
                }
            };
            if !matches!(guard.page().page_type(), Ok(PageType::Garbage)) {
                self.fault(0, 0, format!("page {address} on the garbage chain is not garbage"));
            }
            for index in 0..guard.page().garbage_count() {
                let (left, right) = guard.page().garbage_entry(index);
                if left == 0 || left > right || right >= next_available {
                    self.fault(0, index, format!("garbage run [{left}, {right}] is invalid"));
                    continue;
                }
                for page in left..=right {
                    if self.used.set(page) {
                        self.fault(
                            0,
                            index,
                            format!("free page {page} is also reachable"),
                        );
                    } else {
                        self.garbage_pages += 1;
                    }
                }
            }
            address = guard.page().right_sibling();
        }
        Ok(())
    }

    /// I4 closure: every address in [1, next_available) is either reachable
    /// or free-listed.
    fn account_for_every_page(&mut self, next_available: u64) {
        let mut orphans = 0u64;
        let mut first = None;
        for address in 1..next_available {
            if !self.used.get(address) {
                orphans += 1;
                first.get_or_insert(address);
            }
        }
        if orphans > 0 {
            self.resource = "_volume".to_string();
            self.path.clear();
            self.fault(
                0,
                0,
                format!(
                    "{orphans} page(s) neither reachable nor free, first at {}",
                    first.unwrap_or_default()
                ),
            );
        }
    }
}
