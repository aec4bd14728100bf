//! Registry of running, committed, and aborted transactions.
//!
//! Statuses hash into a fixed array of buckets by `ts % N`; each bucket is
//! its own critical section. Only the hand-off between "timestamp
//! allocated" and "status visible in its bucket" is serialized globally.
//! `commit_status` answers visibility queries, imputing "committed" for
//! timestamps old enough to have been retired; `ww_dependency` resolves
//! write-write conflicts, walking the `depends` chain to detect deadlocks.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::debug;

use crate::error::{Error, Result};
use crate::mvv::{self, handle_step, handle_ts, StatusView, ABORTED, PRIMORDIAL, UNCOMMITTED};
use crate::timestamp::TimestampAllocator;

/// `ww_dependency` result: no resolution within the caller's timeout.
pub const TIMED_OUT: i64 = i64::MIN + 1;

/// Longest `depends` chain walked before declaring a deadlock.
pub const CYCLE_LIMIT: usize = 10;

/// Polling slice while waiting on another transaction's ww-lock.
pub const SHORT_TIMEOUT: Duration = Duration::from_millis(10);

/// Hard upper bound on any ww-lock wait; exceeding it means a software bug.
pub const VERY_LONG_TIMEOUT: Duration = Duration::from_secs(60);

/// Exclusive lock held for a transaction's lifetime; ww-dependent writers
/// briefly acquire it to learn the holder finished.
struct WwLock {
    holder: Mutex<Option<i64>>,
    released: Condvar,
}

impl WwLock {
    fn new() -> Self {
        Self {
            holder: Mutex::new(None),
            released: Condvar::new(),
        }
    }

    fn acquire(&self, ts: i64, timeout: Duration) -> bool {
        let mut holder = self.holder.lock();
        let deadline = Instant::now() + timeout;
        while holder.is_some() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            if self.released.wait_for(&mut holder, remaining).timed_out() && holder.is_some() {
                return false;
            }
        }
        *holder = Some(ts);
        true
    }

    fn release(&self) {
        let mut holder = self.holder.lock();
        *holder = None;
        self.released.notify_all();
    }
}

pub struct TransactionStatus {
    ts: i64,
    tc: AtomicI64,
    /// Versions this transaction still has in pages; drives retirement of
    /// aborted statuses.
    mvv_count: AtomicI64,
    ww_lock: WwLock,
    depends: Mutex<Weak<TransactionStatus>>,
}

impl TransactionStatus {
    /// Detached status used when re-applying a recovered transaction; it
    /// never enters the index.
    pub(crate) fn recovered(ts: i64) -> Self {
        Self::new(ts)
    }

    fn new(ts: i64) -> Self {
        Self {
            ts,
            tc: AtomicI64::new(UNCOMMITTED),
            mvv_count: AtomicI64::new(0),
            ww_lock: WwLock::new(),
            depends: Mutex::new(Weak::new()),
        }
    }

    pub fn ts(&self) -> i64 {
        self.ts
    }

    pub fn tc(&self) -> i64 {
        self.tc.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.tc() == UNCOMMITTED
    }

    pub fn is_aborted(&self) -> bool {
        self.tc() == ABORTED
    }

    pub fn increment_mvv_count(&self) {
        self.mvv_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn mvv_count(&self) -> i64 {
        self.mvv_count.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionStatus")
            .field("ts", &self.ts)
            .field("tc", &self.tc())
            .field("mvv_count", &self.mvv_count())
            .finish()
    }
}

#[derive(Default)]
struct Bucket {
    current: Vec<Arc<TransactionStatus>>,
    long_running: Vec<Arc<TransactionStatus>>,
    aborted: Vec<Arc<TransactionStatus>>,
    free: Vec<Arc<TransactionStatus>>,
    floor: i64,
}

/// Double-buffered sorted array of active transaction timestamps.
///
/// A background poller recomputes it every few milliseconds; queries read
/// the current array without locking any bucket. The cache is conservative:
/// a transaction finishing mid-scan may linger one refresh, which only
/// delays pruning.
struct ActiveTransactionCache {
    current: RwLock<Arc<Vec<i64>>>,
}

impl ActiveTransactionCache {
    fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Vec::new())),
        }
    }

    fn snapshot(&self) -> Arc<Vec<i64>> {
        Arc::clone(&self.current.read())
    }

    fn swap(&self, fresh: Vec<i64>) {
        *self.current.write() = Arc::new(fresh);
    }
}

pub struct TransactionIndex {
    allocator: Arc<TimestampAllocator>,
    buckets: Vec<Mutex<Bucket>>,
    /// Serializes ts allocation with bucket publication, and cache refresh
    /// with registration.
    registration: Mutex<()>,
    cache: ActiveTransactionCache,
    deadlock_counter: AtomicU64,
    max_free_list_size: usize,
    long_running_threshold: usize,
}

impl TransactionIndex {
    pub fn new(
        allocator: Arc<TimestampAllocator>,
        bucket_count: usize,
        max_free_list_size: usize,
        long_running_threshold: usize,
    ) -> Self {
        let buckets = (0..bucket_count.max(1))
            .map(|_| Mutex::new(Bucket::default()))
            .collect();
        Self {
            allocator,
            buckets,
            registration: Mutex::new(()),
            cache: ActiveTransactionCache::new(),
            deadlock_counter: AtomicU64::new(0),
            max_free_list_size,
            long_running_threshold,
        }
    }

    fn bucket_of(&self, ts: i64) -> &Mutex<Bucket> {
        &self.buckets[(ts as u64 % self.buckets.len() as u64) as usize]
    }

    /// Registers a new transaction: allocates its start timestamp, takes
    /// its ww-lock, and publishes the status.
    pub fn register_transaction(&self) -> Result<Arc<TransactionStatus>> {
        let _hand_off = self.registration.lock();
        let ts = self.allocator.allocate();
        let mut bucket = self.bucket_of(ts).lock();
        let status = match bucket.free.pop().map(Arc::try_unwrap) {
            // Recycle only statuses nothing else still references; a stale
            // `depends` edge elsewhere holds just a dead Weak.
            Some(Ok(mut recycled)) => {
                recycled.ts = ts;
                recycled.tc = AtomicI64::new(UNCOMMITTED);
                recycled.mvv_count = AtomicI64::new(0);
                *recycled.depends.get_mut() = Weak::new();
                Arc::new(recycled)
            }
            _ => Arc::new(TransactionStatus::new(ts)),
        };
        if !status.ww_lock.acquire(ts, Duration::from_millis(1)) {
            return Err(Error::Corruption(
                "fresh transaction status with a held ww-lock".into(),
            ));
        }
        if bucket.current.is_empty() || ts < bucket.floor {
            bucket.floor = ts;
        }
        bucket.current.push(Arc::clone(&status));
        if bucket.current.len() > self.long_running_threshold {
            self.demote_long_running(&mut bucket);
        }
        Ok(status)
    }

    /// Moves the oldest still-running statuses out of `current` so the
    /// bucket floor can advance.
    fn demote_long_running(&self, bucket: &mut Bucket) {
        bucket.current.sort_by_key(|s| s.ts);
        let keep_from = bucket.current.len() / 2;
        let demoted: Vec<_> = bucket.current.drain(..keep_from).collect();
        for status in demoted {
            if status.is_running() {
                bucket.long_running.push(status);
            } else {
                bucket.current.push(status);
            }
        }
        bucket.current.sort_by_key(|s| s.ts);
        bucket.floor = bucket.current.first().map(|s| s.ts).unwrap_or(i64::MAX);
    }

    /// Ends a transaction: records `tc` (a commit timestamp or `ABORTED`)
    /// and releases the ww-lock, waking dependent writers.
    pub fn notify_completed(&self, status: &Arc<TransactionStatus>, tc: i64) {
        status.tc.store(tc, Ordering::SeqCst);
        if tc == ABORTED && status.mvv_count() > 0 {
            let mut bucket = self.bucket_of(status.ts).lock();
            if !bucket.aborted.iter().any(|s| s.ts == status.ts) {
                bucket.aborted.push(Arc::clone(status));
            }
        }
        status.ww_lock.release();
        *status.depends.lock() = Weak::new();
    }

    fn find_status(&self, ts: i64) -> Option<Arc<TransactionStatus>> {
        let bucket = self.bucket_of(ts).lock();
        bucket
            .current
            .iter()
            .chain(bucket.long_running.iter())
            .chain(bucket.aborted.iter())
            .find(|s| s.ts == ts)
            .cloned()
    }

    /// Re-creates an aborted status during recovery so readers and the
    /// pruner treat its leftover versions as rolled back.
    pub fn inject_aborted(&self, ts: i64, mvv_count: i64) {
        let status = Arc::new(TransactionStatus::new(ts));
        status.tc.store(ABORTED, Ordering::SeqCst);
        status.mvv_count.store(mvv_count.max(1), Ordering::SeqCst);
        status.ww_lock.release();
        let mut bucket = self.bucket_of(ts).lock();
        if !bucket.aborted.iter().any(|s| s.ts == ts) {
            bucket.aborted.push(status);
        }
    }

    /// Decrements the outstanding-version count of an aborted transaction
    /// after the pruner removed one of its versions.
    pub fn decrement_mvv_count(&self, ts: i64) {
        if let Some(status) = self.find_status(ts) {
            status.mvv_count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Start timestamps of aborted transactions still holding versions;
    /// carried in checkpoint `TM` records.
    pub fn aborted_with_versions(&self) -> Vec<i64> {
        let mut out = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.lock();
            out.extend(
                bucket
                    .aborted
                    .iter()
                    .filter(|s| s.mvv_count() > 0)
                    .map(|s| s.ts),
            );
        }
        out.sort_unstable();
        out
    }

    pub fn deadlock_count(&self) -> u64 {
        self.deadlock_counter.load(Ordering::Relaxed)
    }

    /// Resolves a write-write dependency of `source` on the transaction
    /// that wrote `target_vh`.
    ///
    /// Returns 0 when the other transaction committed before `source`
    /// started, aborted, or is `source` itself; its commit timestamp when
    /// it committed concurrently (the caller must roll back); `UNCOMMITTED`
    /// when waiting would deadlock (the caller must roll back); `TIMED_OUT`
    /// when nothing resolved within `timeout`.
    pub fn ww_dependency(
        &self,
        target_vh: u64,
        source: &Arc<TransactionStatus>,
        timeout: Duration,
    ) -> Result<i64> {
        let target_ts = handle_ts(target_vh);
        if target_ts == 0 || target_ts == source.ts {
            return Ok(0);
        }
        let deadline = Instant::now() + timeout.min(VERY_LONG_TIMEOUT);
        loop {
            let Some(target) = self.find_status(target_ts) else {
                // Retired: committed long ago or aborted and fully pruned.
                return Ok(0);
            };
            match target.tc() {
                ABORTED => {
                    *source.depends.lock() = Weak::new();
                    return Ok(0);
                }
                tc if tc != UNCOMMITTED => {
                    *source.depends.lock() = Weak::new();
                    if tc > source.ts {
                        return Ok(tc);
                    }
                    return Ok(0);
                }
                _ => {}
            }
            // Still running: record the edge, look for a cycle, then wait.
            *source.depends.lock() = Arc::downgrade(&target);
            if self.dependency_cycle(source, &target) {
                self.deadlock_counter.fetch_add(1, Ordering::Relaxed);
                *source.depends.lock() = Weak::new();
                debug!(
                    source_ts = source.ts,
                    target_ts = target.ts,
                    "write-write deadlock detected"
                );
                return Ok(UNCOMMITTED);
            }
            let slice = SHORT_TIMEOUT.min(deadline.saturating_duration_since(Instant::now()));
            if slice.is_zero() {
                *source.depends.lock() = Weak::new();
                return Ok(TIMED_OUT);
            }
            if target.ww_lock.acquire(source.ts, slice) {
                // The holder finished; hand the lock straight back and
                // re-read its outcome.
                target.ww_lock.release();
            }
        }
    }

    /// Walks the depends chain starting at `target`; a path back to
    /// `source` (or one longer than `CYCLE_LIMIT`) is a deadlock.
    fn dependency_cycle(
        &self,
        source: &Arc<TransactionStatus>,
        target: &Arc<TransactionStatus>,
    ) -> bool {
        let mut cursor = Arc::clone(target);
        for _ in 0..CYCLE_LIMIT {
            let next = cursor.depends.lock().upgrade();
            match next {
                Some(next) => {
                    if next.ts == source.ts {
                        return true;
                    }
                    if !next.is_running() {
                        return false;
                    }
                    cursor = next;
                }
                None => return false,
            }
        }
        true
    }

    /// Recomputes the active-transaction cache; the poller thread calls
    /// this on a short cadence.
    pub fn refresh_cache(&self) {
        let _hand_off = self.registration.lock();
        let ceiling = self.allocator.current();
        let mut active = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.lock();
            for status in bucket.current.iter().chain(bucket.long_running.iter()) {
                if status.is_running() && status.ts <= ceiling {
                    active.push(status.ts);
                }
            }
        }
        active.sort_unstable();
        self.cache.swap(active);
        self.retire_finished(ceiling);
    }

    /// Retires statuses no live reader can distinguish from primordial:
    /// committed ones whose `tc` precedes every active transaction, and
    /// aborted ones whose versions are all pruned.
    fn retire_finished(&self, ceiling: i64) {
        let oldest_active = {
            let snapshot = self.cache.snapshot();
            snapshot.first().copied().unwrap_or(ceiling + 1)
        };
        for bucket in &self.buckets {
            let mut bucket = bucket.lock();
            let bucket: &mut Bucket = &mut bucket;
            let max_free = self.max_free_list_size;
            let mut retired: Vec<Arc<TransactionStatus>> = Vec::new();
            for list in [&mut bucket.current, &mut bucket.long_running] {
                list.retain(|status| {
                    let tc = status.tc();
                    let keep = match tc {
                        UNCOMMITTED => true,
                        ABORTED => status.mvv_count() > 0,
                        tc => tc >= oldest_active,
                    };
                    if !keep {
                        retired.push(Arc::clone(status));
                    }
                    keep
                });
            }
            bucket
                .aborted
                .retain(|status| status.mvv_count() > 0);
            for status in retired {
                if bucket.free.len() < max_free {
                    bucket.free.push(status);
                }
            }
            bucket.floor = bucket.current.iter().map(|s| s.ts).min().unwrap_or(i64::MAX);
        }
    }

    pub fn active_count(&self) -> usize {
        self.cache.snapshot().len()
    }
}

impl StatusView for TransactionIndex {
    fn commit_status(&self, version_handle: u64, reader_ts: i64, reader_step: u8) -> Result<i64> {
        let tsv = handle_ts(version_handle);
        if tsv == 0 {
            return Ok(PRIMORDIAL);
        }
        if tsv == reader_ts {
            // Own transaction: visibility is governed by the step.
            return Ok(if handle_step(version_handle) <= reader_step {
                reader_ts
            } else {
                UNCOMMITTED
            });
        }
        if tsv > reader_ts {
            // Could not have committed before the reader started.
            return Ok(UNCOMMITTED);
        }
        match self.find_status(tsv) {
            // Retired statuses are committed: aborted ones are held until
            // their versions are pruned away.
            None => Ok(tsv),
            Some(status) => {
                let tc = status.tc();
                if tc != UNCOMMITTED {
                    return Ok(tc);
                }
                // Still running, but the commit may be mid-flight: wait
                // briefly on the ww-lock and re-read. A finished holder
                // stores its tc before releasing, so the retry observes
                // the outcome.
                if status.ww_lock.acquire(reader_ts, SHORT_TIMEOUT) {
                    status.ww_lock.release();
                }
                Ok(status.tc())
            }
        }
    }

    fn has_concurrent_transaction(&self, tc1: i64, tc2: i64) -> bool {
        let snapshot = self.cache.snapshot();
        let from = match snapshot.binary_search(&tc1) {
            Ok(idx) => idx + 1,
            Err(idx) => idx,
        };
        snapshot[from..].iter().any(|&ts| {
            ts > tc1 && (tc2 == UNCOMMITTED || ts < tc2)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn index() -> (Arc<TimestampAllocator>, TransactionIndex) {
        let allocator = Arc::new(TimestampAllocator::new());
        let ti = TransactionIndex::new(Arc::clone(&allocator), 8, 4, 16);
        (allocator, ti)
    }

    #[test]
    fn commit_status_follows_snapshot_rules() {
        let (allocator, ti) = index();
        let t1 = ti.register_transaction().expect("t1");
        let reader = ti.register_transaction().expect("reader");
        let vh = mvv::version_handle(t1.ts(), 0);

        // Still running: invisible.
        assert_eq!(ti.commit_status(vh, reader.ts(), 0).unwrap(), UNCOMMITTED);

        // Committed after the reader started: tc is returned and exceeds
        // the reader's snapshot.
        let tc = allocator.allocate();
        ti.notify_completed(&t1, tc);
        assert!(ti.commit_status(vh, reader.ts(), 0).unwrap() > reader.ts());

        // A fresh reader sees it.
        let late = ti.register_transaction().expect("late");
        let status = ti.commit_status(vh, late.ts(), 0).unwrap();
        assert!(status > 0 && status < late.ts());

        // Own versions obey steps.
        let own_vh = mvv::version_handle(late.ts(), 3);
        assert_eq!(ti.commit_status(own_vh, late.ts(), 2).unwrap(), UNCOMMITTED);
        assert_eq!(ti.commit_status(own_vh, late.ts(), 3).unwrap(), late.ts());
        ti.notify_completed(&late, allocator.allocate());
        ti.notify_completed(&reader, ABORTED);
    }

    #[test]
    fn retired_timestamps_impute_committed() {
        let (_allocator, ti) = index();
        // Nothing registered for ts=3: old enough to have been retired.
        assert_eq!(ti.commit_status(mvv::version_handle(3, 0), 100, 0).unwrap(), 3);
        assert_eq!(ti.commit_status(0, 100, 0).unwrap(), PRIMORDIAL);
    }

    #[test]
    fn ww_dependency_on_committed_concurrent_returns_tc() {
        let (allocator, ti) = index();
        let t1 = ti.register_transaction().expect("t1");
        let t2 = ti.register_transaction().expect("t2");
        let vh = mvv::version_handle(t1.ts(), 0);

        let tc = allocator.allocate();
        ti.notify_completed(&t1, tc);
        // t1 committed after t2 started: t2 must abort.
        let outcome = ti
            .ww_dependency(vh, &t2, Duration::from_millis(50))
            .expect("ww");
        assert_eq!(outcome, tc);
        ti.notify_completed(&t2, ABORTED);
    }

    #[test]
    fn ww_dependency_resolves_when_holder_finishes() {
        let (allocator, ti) = index();
        let ti = Arc::new(ti);
        let t1 = ti.register_transaction().expect("t1");
        let t2 = ti.register_transaction().expect("t2");
        let vh = mvv::version_handle(t1.ts(), 0);

        let ti_bg = Arc::clone(&ti);
        let t1_bg = Arc::clone(&t1);
        let alloc_bg = Arc::clone(&allocator);
        let waiter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            ti_bg.notify_completed(&t1_bg, alloc_bg.allocate());
        });
        let outcome = ti
            .ww_dependency(vh, &t2, Duration::from_secs(5))
            .expect("ww");
        waiter.join().unwrap();
        // t1 committed while t2 waited; the commit is concurrent.
        assert!(outcome > t2.ts());
        ti.notify_completed(&t2, ABORTED);
    }

    #[test]
    fn ww_dependency_detects_two_party_deadlock() {
        let (_allocator, ti) = index();
        let t1 = ti.register_transaction().expect("t1");
        let t2 = ti.register_transaction().expect("t2");

        // t1 already waits on t2.
        *t1.depends.lock() = Arc::downgrade(&t2);
        // t2 asking to wait on t1 closes the cycle.
        let outcome = ti
            .ww_dependency(
                mvv::version_handle(t1.ts(), 0),
                &t2,
                Duration::from_millis(200),
            )
            .expect("ww");
        assert_eq!(outcome, UNCOMMITTED);
        assert_eq!(ti.deadlock_count(), 1);
    }

    #[test]
    fn ww_dependency_times_out_on_stuck_holder() {
        let (_allocator, ti) = index();
        let t1 = ti.register_transaction().expect("t1");
        let t2 = ti.register_transaction().expect("t2");
        let outcome = ti
            .ww_dependency(
                mvv::version_handle(t1.ts(), 0),
                &t2,
                Duration::from_millis(40),
            )
            .expect("ww");
        assert_eq!(outcome, TIMED_OUT);
    }

    #[test]
    fn concurrent_cache_answers_range_queries() {
        let (allocator, ti) = index();
        let t1 = ti.register_transaction().expect("t1");
        ti.refresh_cache();
        assert_eq!(ti.active_count(), 1);

        // t1 is active between (t1.ts - 1) and anything later.
        assert!(ti.has_concurrent_transaction(t1.ts() - 1, t1.ts() + 10));
        assert!(!ti.has_concurrent_transaction(t1.ts(), t1.ts() + 10));
        assert!(ti.has_concurrent_transaction(0, UNCOMMITTED));

        ti.notify_completed(&t1, allocator.allocate());
        ti.refresh_cache();
        assert_eq!(ti.active_count(), 0);
        assert!(!ti.has_concurrent_transaction(0, UNCOMMITTED));
    }

    #[test]
    fn aborted_statuses_survive_until_pruned() {
        let (_allocator, ti) = index();
        let t1 = ti.register_transaction().expect("t1");
        t1.increment_mvv_count();
        t1.increment_mvv_count();
        let ts = t1.ts();
        ti.notify_completed(&t1, ABORTED);
        drop(t1);

        ti.refresh_cache();
        assert_eq!(ti.commit_status(mvv::version_handle(ts, 0), ts + 50, 0).unwrap(), ABORTED);
        assert_eq!(ti.aborted_with_versions(), vec![ts]);

        ti.decrement_mvv_count(ts);
        ti.decrement_mvv_count(ts);
        ti.refresh_cache();
        // Fully pruned: the status retires and the timestamp imputes
        // committed, which no reader can observe (no versions remain).
        assert_eq!(ti.aborted_with_versions(), Vec::<i64>::new());
    }

    #[test]
    fn recovery_injection_reads_as_aborted() {
        let (_allocator, ti) = index();
        ti.inject_aborted(42, 3);
        assert_eq!(ti.commit_status(mvv::version_handle(42, 1), 100, 0).unwrap(), ABORTED);
    }
}
