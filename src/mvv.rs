//! Multi-version value (MVV) bytes.
//!
//! A data-page slot normally holds a primordial payload: one fully-committed
//! value with implicit version handle 0. Once a transaction writes over a
//! slot that other snapshots may still read, the payload is promoted to an
//! MVV: the `0xFE` tag followed by `(version_handle u64, len u16, bytes)`
//! entries in ascending version-handle order. The pruner later collapses an
//! MVV back to its minimum necessary form.

use smallvec::SmallVec;

use crate::error::{Error, Result};
use crate::value::{self, PageAddr, ValueBody, TAG_MVV};

/// Commit status of a version that has not committed yet.
pub const UNCOMMITTED: i64 = i64::MAX;
/// Commit status of a version whose transaction aborted.
pub const ABORTED: i64 = i64::MIN;
/// Commit status of a primordial (pre-MVCC) version.
pub const PRIMORDIAL: i64 = 0;

/// Steps per timestamp in a version handle.
pub const STEP_RADIX: u64 = 100;
/// Largest step a transaction may reach.
pub const MAX_STEP: u8 = 99;

const ENTRY_HDR_LEN: usize = 10;

pub fn version_handle(ts: i64, step: u8) -> u64 {
    debug_assert!(ts >= 0 && step <= MAX_STEP);
    ts as u64 * STEP_RADIX + step as u64
}

pub fn handle_ts(vh: u64) -> i64 {
    (vh / STEP_RADIX) as i64
}

pub fn handle_step(vh: u64) -> u8 {
    (vh % STEP_RADIX) as u8
}

/// Commit-status oracle the MVV layer reads through; implemented by the
/// transaction index, replaced by fixtures in unit tests.
pub trait StatusView {
    /// Resolves a version handle to `PRIMORDIAL`, a commit timestamp,
    /// `UNCOMMITTED`, or `ABORTED`, from the perspective of the reader.
    fn commit_status(&self, version_handle: u64, reader_ts: i64, reader_step: u8) -> Result<i64>;

    /// True when some transaction whose snapshot falls between the two
    /// commit timestamps may still be running.
    fn has_concurrent_transaction(&self, tc1: i64, tc2: i64) -> bool;
}

pub fn is_mvv(payload: &[u8]) -> bool {
    payload.first() == Some(&TAG_MVV)
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    handle: u64,
    start: usize,
    len: usize,
}

fn parse_entries(payload: &[u8]) -> Result<SmallVec<[Entry; 8]>> {
    debug_assert!(is_mvv(payload));
    let mut entries: SmallVec<[Entry; 8]> = SmallVec::new();
    let mut offset = 1;
    while offset < payload.len() {
        if offset + ENTRY_HDR_LEN > payload.len() {
            return Err(Error::Corruption("truncated mvv entry header".into()));
        }
        let handle = u64::from_be_bytes(payload[offset..offset + 8].try_into().expect("slice len"));
        let len =
            u16::from_be_bytes(payload[offset + 8..offset + 10].try_into().expect("slice len"))
                as usize;
        let start = offset + ENTRY_HDR_LEN;
        if start + len > payload.len() {
            return Err(Error::Corruption("mvv entry overruns payload".into()));
        }
        if let Some(prev) = entries.last() {
            if prev.handle >= handle {
                return Err(Error::Corruption(
                    "mvv entries not in ascending handle order".into(),
                ));
            }
        }
        entries.push(Entry { handle, start, len });
        offset = start + len;
    }
    Ok(entries)
}

fn push_entry(out: &mut Vec<u8>, handle: u64, bytes: &[u8]) {
    out.extend_from_slice(&handle.to_be_bytes());
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
}

/// Result of [`store_version`].
#[derive(Debug)]
pub struct Stored {
    pub payload: Vec<u8>,
    /// True when a version with the same handle was replaced in place.
    pub existed: bool,
}

/// Adds (or replaces) one version in a slot payload, promoting primordial
/// or undefined payloads to MVV form first.
///
/// Versions must arrive in non-decreasing timestamp order; equal timestamps
/// with differing steps are spliced into handle order. A smaller timestamp
/// arriving after a larger one is a contract violation and raises
/// `VersionsOutOfOrder`.
pub fn store_version(existing: &[u8], handle: u64, version_bytes: &[u8]) -> Result<Stored> {
    store_version_inner(existing, handle, version_bytes, true)
}

/// Recovery-redo variant: splices any handle into sorted position without
/// the timestamp-order check, so re-applied transactions can land below
/// versions that survived in durable pages.
pub fn store_version_unordered(
    existing: &[u8],
    handle: u64,
    version_bytes: &[u8],
) -> Result<Stored> {
    store_version_inner(existing, handle, version_bytes, false)
}

fn store_version_inner(
    existing: &[u8],
    handle: u64,
    version_bytes: &[u8],
    strict: bool,
) -> Result<Stored> {
    let mut out = Vec::with_capacity(existing.len() + version_bytes.len() + ENTRY_HDR_LEN + 1);
    out.push(TAG_MVV);

    let entries: SmallVec<[(u64, &[u8]); 8]> = if is_mvv(existing) {
        parse_entries(existing)?
            .iter()
            .map(|e| (e.handle, &existing[e.start..e.start + e.len]))
            .collect()
    } else if existing.is_empty() {
        // Undefined slot: the zero version records that the slot held
        // nothing, so older snapshots keep reading "absent".
        let mut v = SmallVec::new();
        v.push((0u64, &value::ANTIVALUE_BYTES[..]));
        v
    } else {
        let mut v = SmallVec::new();
        v.push((0u64, existing));
        v
    };

    let mut existed = false;
    let mut inserted = false;
    for &(eh, ebytes) in entries.iter() {
        if inserted {
            // Entries after the splice point must share the new timestamp.
            if strict && handle_ts(eh) != handle_ts(handle) {
                return Err(Error::VersionsOutOfOrder(format!(
                    "version ts {} stored below existing ts {}",
                    handle_ts(handle),
                    handle_ts(eh)
                )));
            }
            push_entry(&mut out, eh, ebytes);
            continue;
        }
        if eh == handle {
            push_entry(&mut out, handle, version_bytes);
            existed = true;
            inserted = true;
        } else if eh > handle {
            if strict && handle_ts(eh) != handle_ts(handle) {
                return Err(Error::VersionsOutOfOrder(format!(
                    "version ts {} stored below existing ts {}",
                    handle_ts(handle),
                    handle_ts(eh)
                )));
            }
            push_entry(&mut out, handle, version_bytes);
            push_entry(&mut out, eh, ebytes);
            inserted = true;
        } else {
            push_entry(&mut out, eh, ebytes);
        }
    }
    if !inserted {
        push_entry(&mut out, handle, version_bytes);
    }
    Ok(Stored {
        payload: out,
        existed,
    })
}

/// Exact-handle lookup. Primordial payloads answer handle 0.
pub fn fetch_version<'a>(payload: &'a [u8], handle: u64) -> Result<Option<&'a [u8]>> {
    if !is_mvv(payload) {
        if handle == 0 && !payload.is_empty() {
            return Ok(Some(payload));
        }
        return Ok(None);
    }
    for entry in parse_entries(payload)? {
        if entry.handle == handle {
            return Ok(Some(&payload[entry.start..entry.start + entry.len]));
        }
    }
    Ok(None)
}

/// Iterates `(version_handle, bytes)` over every version in the payload.
pub fn visit_all_versions<F>(payload: &[u8], mut visitor: F) -> Result<()>
where
    F: FnMut(u64, &[u8]) -> Result<()>,
{
    if !is_mvv(payload) {
        if !payload.is_empty() {
            visitor(0, payload)?;
        }
        return Ok(());
    }
    for entry in parse_entries(payload)? {
        visitor(entry.handle, &payload[entry.start..entry.start + entry.len])?;
    }
    Ok(())
}

/// The latest version bytes visible to a reader at `(ts, step)`, or `None`
/// when no version is visible. An AntiValue result means "visibly deleted".
pub fn read_visible<'a>(
    payload: &'a [u8],
    view: &dyn StatusView,
    reader_ts: i64,
    reader_step: u8,
) -> Result<Option<&'a [u8]>> {
    if !is_mvv(payload) {
        if payload.is_empty() {
            return Ok(None);
        }
        return Ok(Some(payload));
    }
    let mut best: Option<(i64, u64, &[u8])> = None;
    for entry in parse_entries(payload)? {
        let status = view.commit_status(entry.handle, reader_ts, reader_step)?;
        if status == UNCOMMITTED || status == ABORTED {
            continue;
        }
        if status > reader_ts {
            continue;
        }
        let bytes = &payload[entry.start..entry.start + entry.len];
        let candidate = (status, entry.handle, bytes);
        match best {
            None => best = Some(candidate),
            Some((bts, bvh, _)) if (status, entry.handle) > (bts, bvh) => best = Some(candidate),
            Some(_) => {}
        }
    }
    Ok(best.map(|(_, _, bytes)| bytes))
}

/// A version removed by [`prune`], reported so the caller can decrement the
/// owning transaction's MVV count and free spilled chains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrunedVersion {
    pub handle: u64,
    pub long_record_page: Option<PageAddr>,
}

fn long_record_page_of(bytes: &[u8]) -> Option<PageAddr> {
    match value::classify(bytes) {
        Ok(ValueBody::LongRecord(stub)) => Some(stub.head_page),
        _ => None,
    }
}

/// Reduces an MVV to its minimum necessary form.
///
/// Keeps every uncommitted version, the most recent committed version, and
/// any committed version some concurrent transaction may still read. When a
/// single committed version remains and `convert_to_primordial` is set, the
/// MVV collapses to primordial bytes; a lone committed AntiValue collapses
/// to the single-byte tombstone so the page-level cleanup can drop the slot.
pub fn prune(
    payload: &[u8],
    view: &dyn StatusView,
    convert_to_primordial: bool,
    out_pruned: &mut Vec<PrunedVersion>,
) -> Result<Vec<u8>> {
    if !is_mvv(payload) {
        return Ok(payload.to_vec());
    }
    let entries = parse_entries(payload)?;

    // Pass 1: mark versions to keep.
    let mut keep: SmallVec<[bool; 8]> = SmallVec::new();
    keep.resize(entries.len(), false);
    let mut statuses: SmallVec<[i64; 8]> = SmallVec::new();
    let mut any_uncommitted = false;
    for entry in &entries {
        // Resolve as an omniscient reader: nothing is "too new" here.
        let status = view.commit_status(entry.handle, i64::MAX - 1, MAX_STEP)?;
        statuses.push(status);
        if status == UNCOMMITTED {
            any_uncommitted = true;
        }
    }
    let mut last_committed: Option<usize> = None;
    for (i, &status) in statuses.iter().enumerate() {
        match status {
            UNCOMMITTED => keep[i] = true,
            ABORTED => {}
            _committed => last_committed = Some(i),
        }
    }
    if let Some(last) = last_committed {
        keep[last] = true;
        // Earlier committed versions stay while a concurrent reader between
        // this commit and the next committed one may still need them.
        let mut next_tc = statuses[last];
        for i in (0..last).rev() {
            let status = statuses[i];
            if status == UNCOMMITTED || status == ABORTED {
                continue;
            }
            if view.has_concurrent_transaction(status, next_tc) {
                keep[i] = true;
            }
            next_tc = status;
        }
    }

    // Pass 2: collect the pruned versions for the caller.
    for (i, entry) in entries.iter().enumerate() {
        if !keep[i] {
            out_pruned.push(PrunedVersion {
                handle: entry.handle,
                long_record_page: long_record_page_of(
                    &payload[entry.start..entry.start + entry.len],
                ),
            });
        }
    }

    // Pass 3: compact.
    let kept: SmallVec<[usize; 8]> = (0..entries.len()).filter(|&i| keep[i]).collect();
    if kept.is_empty() {
        return Ok(value::antivalue());
    }
    if kept.len() == 1 && !any_uncommitted && convert_to_primordial {
        let entry = entries[kept[0]];
        return Ok(payload[entry.start..entry.start + entry.len].to_vec());
    }
    let mut out = Vec::with_capacity(payload.len());
    out.push(TAG_MVV);
    for &i in &kept {
        let entry = entries[i];
        push_entry(&mut out, entry.handle, &payload[entry.start..entry.start + entry.len]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::antivalue;
    use std::collections::HashMap;

    /// Fixed commit-status table for exercising the codec without a live
    /// transaction index.
    #[derive(Default)]
    struct FixtureView {
        statuses: HashMap<i64, i64>,
        concurrent: bool,
    }

    impl FixtureView {
        fn with(mut self, ts: i64, status: i64) -> Self {
            self.statuses.insert(ts, status);
            self
        }
    }

    impl StatusView for FixtureView {
        fn commit_status(&self, vh: u64, reader_ts: i64, reader_step: u8) -> Result<i64> {
            let ts = handle_ts(vh);
            if ts == 0 {
                return Ok(PRIMORDIAL);
            }
            if ts == reader_ts {
                return Ok(if handle_step(vh) <= reader_step {
                    reader_ts
                } else {
                    UNCOMMITTED
                });
            }
            Ok(*self.statuses.get(&ts).unwrap_or(&ts))
        }

        fn has_concurrent_transaction(&self, _tc1: i64, _tc2: i64) -> bool {
            self.concurrent
        }
    }

    #[test]
    fn handle_arithmetic_roundtrips() {
        let vh = version_handle(12345, 67);
        assert_eq!(handle_ts(vh), 12345);
        assert_eq!(handle_step(vh), 67);
        assert_eq!(handle_ts(0), 0);
    }

    #[test]
    fn promote_primordial_then_append() {
        let stored = store_version(b"one", version_handle(10, 0), b"two").expect("store");
        assert!(!stored.existed);
        assert!(is_mvv(&stored.payload));
        assert_eq!(
            fetch_version(&stored.payload, 0).unwrap(),
            Some(&b"one"[..])
        );
        assert_eq!(
            fetch_version(&stored.payload, version_handle(10, 0)).unwrap(),
            Some(&b"two"[..])
        );
    }

    #[test]
    fn promote_undefined_records_absence() {
        let stored = store_version(b"", version_handle(5, 0), b"v").expect("store");
        assert_eq!(
            fetch_version(&stored.payload, 0).unwrap(),
            Some(&antivalue()[..])
        );
    }

    #[test]
    fn replace_same_handle_in_place() {
        let a = store_version(b"base", version_handle(7, 1), b"first").unwrap();
        let b = store_version(&a.payload, version_handle(7, 1), b"second").unwrap();
        assert!(b.existed);
        assert_eq!(
            fetch_version(&b.payload, version_handle(7, 1)).unwrap(),
            Some(&b"second"[..])
        );
        let mut count = 0;
        visit_all_versions(&b.payload, |_, _| {
            count += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn splice_steps_of_equal_timestamp() {
        let a = store_version(b"", version_handle(9, 0), b"s0").unwrap();
        let b = store_version(&a.payload, version_handle(9, 2), b"s2").unwrap();
        let c = store_version(&b.payload, version_handle(9, 1), b"s1").unwrap();
        let mut handles = Vec::new();
        visit_all_versions(&c.payload, |vh, _| {
            handles.push(vh);
            Ok(())
        })
        .unwrap();
        assert_eq!(
            handles,
            vec![
                0,
                version_handle(9, 0),
                version_handle(9, 1),
                version_handle(9, 2)
            ]
        );
    }

    #[test]
    fn lower_timestamp_after_higher_is_rejected() {
        let a = store_version(b"", version_handle(20, 0), b"x").unwrap();
        let err = store_version(&a.payload, version_handle(19, 5), b"y").unwrap_err();
        assert!(matches!(err, Error::VersionsOutOfOrder(_)));
    }

    #[test]
    fn monotonic_after_any_successful_sequence() {
        let mut payload = b"seed".to_vec();
        for (ts, step) in [(3, 0), (3, 1), (5, 0), (5, 0), (8, 4)] {
            payload = store_version(&payload, version_handle(ts, step), b"v")
                .expect("store")
                .payload;
            let mut last = None;
            visit_all_versions(&payload, |vh, _| {
                if let Some(prev) = last {
                    assert!(vh > prev, "handles must ascend");
                }
                last = Some(vh);
                Ok(())
            })
            .unwrap();
        }
    }

    #[test]
    fn read_visible_respects_snapshot() {
        // ts=10 committed at 11, ts=20 committed at 21.
        let view = FixtureView::default().with(10, 11).with(20, 21);
        let a = store_version(b"old", version_handle(10, 0), b"mid").unwrap();
        let b = store_version(&a.payload, version_handle(20, 0), b"new").unwrap();

        // Reader at ts 5 predates both commits: sees primordial.
        assert_eq!(
            read_visible(&b.payload, &view, 5, 0).unwrap(),
            Some(&b"old"[..])
        );
        // Reader at ts 15 sees the first commit only.
        assert_eq!(
            read_visible(&b.payload, &view, 15, 0).unwrap(),
            Some(&b"mid"[..])
        );
        // Reader at ts 30 sees the latest.
        assert_eq!(
            read_visible(&b.payload, &view, 30, 0).unwrap(),
            Some(&b"new"[..])
        );
    }

    #[test]
    fn read_visible_own_transaction_steps() {
        let view = FixtureView::default();
        let a = store_version(b"", version_handle(40, 0), b"v0").unwrap();
        let b = store_version(&a.payload, version_handle(40, 1), b"v1").unwrap();
        assert_eq!(
            read_visible(&b.payload, &view, 40, 0).unwrap(),
            Some(&b"v0"[..])
        );
        assert_eq!(
            read_visible(&b.payload, &view, 40, 1).unwrap(),
            Some(&b"v1"[..])
        );
    }

    #[test]
    fn prune_drops_aborted_and_superseded() {
        let view = FixtureView::default()
            .with(10, 11)
            .with(20, ABORTED)
            .with(30, 31);
        let a = store_version(b"base", version_handle(10, 0), b"ten").unwrap();
        let b = store_version(&a.payload, version_handle(20, 0), b"twenty").unwrap();
        let c = store_version(&b.payload, version_handle(30, 0), b"thirty").unwrap();

        let mut pruned = Vec::new();
        let out = prune(&c.payload, &view, true, &mut pruned).expect("prune");
        // Only the ts=30 version survives; with convert enabled the MVV
        // collapses to primordial bytes.
        assert_eq!(out, b"thirty".to_vec());
        let handles: Vec<u64> = pruned.iter().map(|p| p.handle).collect();
        assert_eq!(
            handles,
            vec![0, version_handle(10, 0), version_handle(20, 0)]
        );
    }

    #[test]
    fn prune_keeps_versions_with_concurrent_readers() {
        let mut view = FixtureView::default().with(10, 11).with(30, 31);
        view.concurrent = true;
        let a = store_version(b"base", version_handle(10, 0), b"ten").unwrap();
        let b = store_version(&a.payload, version_handle(30, 0), b"thirty").unwrap();
        let mut pruned = Vec::new();
        let out = prune(&b.payload, &view, true, &mut pruned).expect("prune");
        assert!(is_mvv(&out));
        assert!(pruned.is_empty());
    }

    #[test]
    fn prune_preserves_fetch_semantics() {
        let view = FixtureView::default().with(10, 11).with(30, 31);
        let a = store_version(b"base", version_handle(10, 0), b"ten").unwrap();
        let b = store_version(&a.payload, version_handle(30, 0), b"thirty").unwrap();
        let mut pruned = Vec::new();
        let out = prune(&b.payload, &view, true, &mut pruned).expect("prune");
        for reader_ts in [32, 40, 100] {
            assert_eq!(
                read_visible(&out, &view, reader_ts, 0).unwrap(),
                read_visible(&b.payload, &view, reader_ts, 0).unwrap(),
                "reader at {reader_ts}"
            );
        }
    }

    #[test]
    fn prune_of_all_aborted_leaves_tombstone() {
        let view = FixtureView::default().with(10, ABORTED);
        let a = store_version(b"", version_handle(10, 0), b"gone").unwrap();
        // The zero version is the undefined marker; dropping everything
        // leaves a bare tombstone for the page-level cleanup.
        let mut pruned = Vec::new();
        let out = prune(&a.payload, &view, true, &mut pruned).expect("prune");
        assert_eq!(out, antivalue());
    }

    #[test]
    fn prune_reports_long_record_pages() {
        let stub = crate::value::LongRecordStub {
            total_length: 5000,
            head_page: 321,
            prefix: vec![],
        };
        let view = FixtureView::default().with(10, 11).with(30, 31);
        let a = store_version(b"", version_handle(10, 0), &stub.encode()).unwrap();
        let b = store_version(&a.payload, version_handle(30, 0), b"small").unwrap();
        let mut pruned = Vec::new();
        prune(&b.payload, &view, true, &mut pruned).expect("prune");
        assert!(pruned
            .iter()
            .any(|p| p.long_record_page == Some(321)));
    }
}
