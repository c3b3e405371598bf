//! Multi-version value codec.
//!
//! A value region on a data page either holds a primordial byte string or,
//! when its first byte is [`TYPE_MVV`], an array of versions. Each entry is
//! `{version: varlong}{length: varint}{bytes}`, stored in append order with
//! strictly increasing version handles. A delete at a version is recorded as
//! the single byte [`TYPE_ANTIVALUE`].
//!
//! The top byte range 0xFC..=0xFF is reserved for tags; a caller value that
//! begins with one of them is stored behind a [`TYPE_LITERAL`] escape byte.

use std::borrow::Cow;

use crate::error::{Error, Result};

pub const TYPE_MVV: u8 = 0xFE;
pub const TYPE_ANTIVALUE: u8 = 0xFD;
pub const TYPE_LITERAL: u8 = 0xFC;

/// The version handle standing for "before all versions".
pub const PRIMORDIAL_VALUE_VERSION: u64 = 0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitStatus {
    Committed,
    Aborted,
    Unknown,
}

/// The slice of the transaction index the codec consumes.
pub trait CommitOracle {
    fn status(&self, version: u64) -> CommitStatus;

    /// Clears per-transaction MVV bookkeeping accumulated since `since`;
    /// returns the number of entries cleared.
    fn reset_mvv_counts(&self, since: u64) -> u64 {
        let _ = since;
        0
    }
}

/// Treats every version as committed. Suitable for offline tools running
/// against a volume with no live transactions.
pub struct AssumeCommitted;

impl CommitOracle for AssumeCommitted {
    fn status(&self, _version: u64) -> CommitStatus {
        CommitStatus::Committed
    }
}

pub fn is_array(bytes: &[u8]) -> bool {
    bytes.first() == Some(&TYPE_MVV)
}

pub fn is_anti_value(bytes: &[u8]) -> bool {
    bytes == [TYPE_ANTIVALUE]
}

/// Escapes a caller value whose first byte collides with a reserved tag.
pub fn wrap_literal(value: &[u8]) -> Cow<'_, [u8]> {
    match value.first() {
        Some(&b) if b >= TYPE_LITERAL => {
            let mut out = Vec::with_capacity(value.len() + 1);
            out.push(TYPE_LITERAL);
            out.extend_from_slice(value);
            Cow::Owned(out)
        }
        _ => Cow::Borrowed(value),
    }
}

pub fn unwrap_literal(region: &[u8]) -> &[u8] {
    match region.first() {
        Some(&TYPE_LITERAL) => &region[1..],
        _ => region,
    }
}

pub(crate) fn write_varlong(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push((v as u8) | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

pub(crate) fn read_varlong(buf: &[u8], at: usize) -> Option<(u64, usize)> {
    let mut v: u64 = 0;
    let mut shift = 0u32;
    for (i, &b) in buf.get(at..)?.iter().enumerate() {
        let chunk = u64::from(b & 0x7F);
        v |= chunk.checked_shl(shift)?;
        if (b & 0x80) == 0 {
            return Some((v, at + i + 1));
        }
        shift += 7;
        if shift > 63 {
            return None;
        }
    }
    None
}

struct Entry<'a> {
    version: u64,
    bytes: &'a [u8],
}

fn parse(region: &[u8]) -> Result<Vec<Entry<'_>>> {
    debug_assert!(is_array(region));
    let mut entries = Vec::new();
    let mut at = 1;
    while at < region.len() {
        let (version, next) = read_varlong(region, at)
            .ok_or_else(|| Error::InvalidArgument("truncated version handle".into()))?;
        let (len, next) = read_varlong(region, next)
            .ok_or_else(|| Error::InvalidArgument("truncated version length".into()))?;
        let len = len as usize;
        if next + len > region.len() {
            return Err(Error::InvalidArgument(
                "version content runs past the region".into(),
            ));
        }
        entries.push(Entry {
            version,
            bytes: &region[next..next + len],
        });
        at = next + len;
    }
    Ok(entries)
}

fn encode(entries: &[Entry<'_>]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + entries.len() * 4);
    out.push(TYPE_MVV);
    for e in entries {
        write_varlong(&mut out, e.version);
        write_varlong(&mut out, e.bytes.len() as u64);
        out.extend_from_slice(e.bytes);
    }
    out
}

/// Calls `visit(version, offset, length)` for each entry in stored order.
pub fn visit(region: &[u8], mut visit: impl FnMut(u64, usize, usize)) -> Result<()> {
    for e in parse(region)? {
        let offset = e.bytes.as_ptr() as usize - region.as_ptr() as usize;
        visit(e.version, offset, e.bytes.len());
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MvvInfo {
    pub versions: usize,
    /// Bytes spent on the tag and per-entry framing rather than content.
    pub overhead: usize,
    pub anti_values: usize,
    pub monotonic: bool,
}

pub fn scan_info(region: &[u8]) -> Result<MvvInfo> {
    let entries = parse(region)?;
    let mut info = MvvInfo {
        monotonic: true,
        ..MvvInfo::default()
    };
    let mut payload = 0usize;
    let mut prev = None;
    for e in &entries {
        info.versions += 1;
        payload += e.bytes.len();
        if is_anti_value(e.bytes) {
            info.anti_values += 1;
        }
        if let Some(p) = prev
            && e.version <= p
        {
            info.monotonic = false;
        }
        prev = Some(e.version);
    }
    info.overhead = region.len() - payload;
    Ok(info)
}

/// Appends a version to a value region, converting a primordial value into
/// an array on first use. The region may be empty (key had no value yet).
pub fn append_version(region: &[u8], version: u64, value: &[u8]) -> Result<Vec<u8>> {
    if version == PRIMORDIAL_VALUE_VERSION {
        return Err(Error::StateViolation(
            "cannot append at the primordial version",
        ));
    }
    let mut out;
    if is_array(region) {
        let entries = parse(region)?;
        if let Some(last) = entries.last()
            && version <= last.version
        {
            return Err(Error::StateViolation("version handles must increase"));
        }
        out = region.to_vec();
    } else {
        out = vec![TYPE_MVV];
        if !region.is_empty() {
            write_varlong(&mut out, PRIMORDIAL_VALUE_VERSION);
            write_varlong(&mut out, region.len() as u64);
            out.extend_from_slice(region);
        }
    }
    write_varlong(&mut out, version);
    write_varlong(&mut out, value.len() as u64);
    out.extend_from_slice(value);
    Ok(out)
}

#[derive(Debug, PartialEq, Eq)]
pub enum Visibility<'a> {
    Absent,
    Deleted,
    Value(&'a [u8]),
}

/// The value visible to a snapshot: the latest entry with a handle at or
/// below `snapshot`. Commit filtering happened when versions were written or
/// pruned; the codec-level fetch takes a plain upper bound.
pub fn fetch_visible(region: &[u8], snapshot: u64) -> Result<Visibility<'_>> {
    if !is_array(region) {
        return Ok(Visibility::Value(unwrap_literal(region)));
    }
    let entries = parse(region)?;
    let chosen = entries.iter().rev().find(|e| e.version <= snapshot);
    Ok(match chosen {
        None => Visibility::Absent,
        Some(e) if is_anti_value(e.bytes) => Visibility::Deleted,
        Some(e) => Visibility::Value(unwrap_literal(e.bytes)),
    })
}

#[derive(Debug, PartialEq, Eq)]
pub enum Pruned {
    Unchanged,
    /// The region shrank; the new bytes replace it under the same key.
    Rewritten(Vec<u8>),
    /// The value reduced to a primordial anti-value; the key goes away.
    RemoveKey,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PruneStats {
    pub rewritten: u64,
    pub removed_keys: u64,
}

/// Prunes obsolete versions. Aborted entries are dropped; committed entries
/// superseded by a later committed entry are dropped once they fall below
/// `floor`; entries with unknown status stay. When everything below the
/// oldest surviving committed entry has been pruned away it collapses into
/// the primordial position. The caller holds the exclusive claim on the
/// enclosing page.
pub fn prune(region: &[u8], oracle: &dyn CommitOracle, floor: u64) -> Result<Pruned> {
    if !is_array(region) {
        return Ok(Pruned::Unchanged);
    }
    let entries = parse(region)?;
    let statuses: Vec<CommitStatus> = entries
        .iter()
        .map(|e| {
            if e.version == PRIMORDIAL_VALUE_VERSION {
                CommitStatus::Committed
            } else {
                oracle.status(e.version)
            }
        })
        .collect();

    let latest_committed = entries
        .iter()
        .zip(&statuses)
        .rev()
        .find(|(_, s)| **s == CommitStatus::Committed)
        .map(|(e, _)| e.version);

    let mut dropped_below_floor = false;
    let mut survivors: Vec<Entry<'_>> = Vec::with_capacity(entries.len());
    for (e, status) in entries.iter().zip(&statuses) {
        match status {
            CommitStatus::Aborted => {}
            CommitStatus::Committed
                if Some(e.version) != latest_committed && e.version < floor =>
            {
                dropped_below_floor = true;
            }
            _ => survivors.push(Entry {
                version: e.version,
                bytes: e.bytes,
            }),
        }
    }

    if survivors.is_empty() {
        return Ok(Pruned::RemoveKey);
    }

    let first = &mut survivors[0];
    let first_committed = first.version == PRIMORDIAL_VALUE_VERSION
        || oracle.status(first.version) == CommitStatus::Committed;
    if first_committed && (first.version < floor || dropped_below_floor) {
        first.version = PRIMORDIAL_VALUE_VERSION;
    }

    if survivors.len() == 1 && survivors[0].version == PRIMORDIAL_VALUE_VERSION {
        return Ok(if is_anti_value(survivors[0].bytes) {
            Pruned::RemoveKey
        } else {
            Pruned::Rewritten(survivors[0].bytes.to_vec())
        });
    }

    let rewritten = encode(&survivors);
    if rewritten == region {
        Ok(Pruned::Unchanged)
    } else {
        Ok(Pruned::Rewritten(rewritten))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use std::collections::HashMap;

    struct MapOracle(HashMap<u64, CommitStatus>);

    impl CommitOracle for MapOracle {
        fn status(&self, version: u64) -> CommitStatus {
            self.0
                .get(&version)
                .copied()
                .unwrap_or(CommitStatus::Unknown)
        }
    }

    fn array(entries: &[(u64, &[u8])]) -> Vec<u8> {
        let mut region: Vec<u8> = Vec::new();
        for (i, (v, bytes)) in entries.iter().enumerate() {
            if i == 0 && *v == PRIMORDIAL_VALUE_VERSION {
                region = bytes.to_vec();
            } else {
                region = append_version(&region, *v, bytes).unwrap();
            }
        }
        region
    }

    #[test]
    fn primordial_stays_primordial() {
        assert!(!is_array(b"plain"));
        assert_eq!(
            fetch_visible(b"plain", 1).unwrap(),
            Visibility::Value(b"plain")
        );
    }

    #[test]
    fn append_then_fetch_by_snapshot() {
        let region = array(&[(0, b"base"), (5, b"five"), (9, b"nine")]);
        assert!(is_array(&region));
        assert_eq!(fetch_visible(&region, 4).unwrap(), Visibility::Value(b"base"));
        assert_eq!(fetch_visible(&region, 5).unwrap(), Visibility::Value(b"five"));
        assert_eq!(
            fetch_visible(&region, u64::MAX).unwrap(),
            Visibility::Value(b"nine")
        );
    }

    #[test]
    fn delete_is_an_anti_value() {
        let region = array(&[(0, b"base"), (5, &[TYPE_ANTIVALUE])]);
        assert_eq!(fetch_visible(&region, 4).unwrap(), Visibility::Value(b"base"));
        assert_eq!(fetch_visible(&region, 5).unwrap(), Visibility::Deleted);
    }

    #[test]
    fn fresh_key_has_no_primordial_entry() {
        let region = append_version(b"", 3, b"v").unwrap();
        assert_eq!(fetch_visible(&region, 2).unwrap(), Visibility::Absent);
        assert_eq!(fetch_visible(&region, 3).unwrap(), Visibility::Value(b"v"));
    }

    #[test]
    fn handles_must_increase() {
        let region = array(&[(0, b"base"), (5, b"five")]);
        assert!(append_version(&region, 5, b"again").is_err());
        assert!(append_version(&region, 4, b"back").is_err());
    }

    #[test]
    fn literal_escape_round_trip() {
        let nasty = [TYPE_MVV, 1, 2, 3];
        let stored = wrap_literal(&nasty);
        assert_eq!(stored[0], TYPE_LITERAL);
        assert_eq!(unwrap_literal(&stored), &nasty[..]);
        assert_eq!(wrap_literal(b"plain"), Cow::Borrowed(b"plain" as &[u8]));
    }

    #[test]
    fn scan_info_counts() {
        let region = array(&[(0, b"abc"), (4, b"defgh"), (7, &[TYPE_ANTIVALUE])]);
        let info = scan_info(&region).unwrap();
        assert_eq!(info.versions, 3);
        assert_eq!(info.anti_values, 1);
        assert!(info.monotonic);
        assert_eq!(info.overhead, region.len() - 3 - 5 - 1);
    }

    #[test]
    fn s5_prune_collapses_to_latest_committed() {
        let region = array(&[(5, b"A"), (10, b"B"), (15, &[TYPE_ANTIVALUE])]);
        let oracle = MapOracle(HashMap::from([
            (5, CommitStatus::Committed),
            (10, CommitStatus::Committed),
            (15, CommitStatus::Aborted),
        ]));
        assert_eq!(
            prune(&region, &oracle, 8).unwrap(),
            Pruned::Rewritten(b"B".to_vec())
        );
    }

    #[test]
    fn prune_keeps_unknown_entries() {
        let region = array(&[(0, b"base"), (6, b"six")]);
        let oracle = MapOracle(HashMap::new());
        // Version 6 is still unknown; only the primordial entry may move.
        match prune(&region, &oracle, 10).unwrap() {
            Pruned::Unchanged => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn prune_to_anti_value_removes_key() {
        let region = array(&[(3, b"x"), (9, &[TYPE_ANTIVALUE])]);
        let oracle = MapOracle(HashMap::from([
            (3, CommitStatus::Committed),
            (9, CommitStatus::Committed),
        ]));
        assert_eq!(prune(&region, &oracle, 20).unwrap(), Pruned::RemoveKey);
    }

    #[test]
    fn prune_drops_aborted_only_write() {
        let region = append_version(b"", 4, b"v").unwrap();
        let oracle = MapOracle(HashMap::from([(4, CommitStatus::Aborted)]));
        assert_eq!(prune(&region, &oracle, 1).unwrap(), Pruned::RemoveKey);
    }

    #[test]
    fn prune_is_stable_when_floor_is_low() {
        let region = array(&[(5, b"five"), (9, b"nine")]);
        let oracle = MapOracle(HashMap::from([
            (5, CommitStatus::Committed),
            (9, CommitStatus::Committed),
        ]));
        // Every committed version sits at or above the floor: nothing moves.
        assert_eq!(prune(&region, &oracle, 4).unwrap(), Pruned::Unchanged);
    }

    #[test]
    fn prune_preserves_visibility_at_and_above_floor() {
        let region = array(&[(0, b"old"), (4, b"mid"), (7, b"new")]);
        let oracle = MapOracle(HashMap::from([
            (4, CommitStatus::Committed),
            (7, CommitStatus::Committed),
        ]));
        let floor = 7;
        let before: Vec<_> = (floor..12)
            .map(|s| match fetch_visible(&region, s).unwrap() {
                Visibility::Value(v) => v.to_vec(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        let pruned = match prune(&region, &oracle, floor).unwrap() {
            Pruned::Rewritten(bytes) => bytes,
            other => panic!("unexpected {other:?}"),
        };
        let after: Vec<_> = (floor..12)
            .map(|s| match fetch_visible(&pruned, s).unwrap() {
                Visibility::Value(v) => v.to_vec(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(before, after);
    }

    #[test]
    fn visit_reports_offsets() {
        let region = array(&[(0, b"ab"), (2, b"cdef")]);
        let mut seen = Vec::new();
        visit(&region, |v, off, len| seen.push((v, off, len))).unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].0, 0);
        assert_eq!(&region[seen[1].1..seen[1].1 + seen[1].2], b"cdef");
    }
}
