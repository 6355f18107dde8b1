//! Single forward pass that enriches every record of a trace
//!
//! For each record the pass computes:
//!
//! - **TCorrected**: `tstart - start_time - overhead so far`, a clock with the
//!   instrumentation hook's own cost removed
//! - **Density**: records within half the density width of this one
//! - **Locality** / **Variation**: address and size deltas to the previous
//!   allocation
//! - **Lifetime**: corrected time until the free that releases this block,
//!   matched FIFO per address, or -1
//!
//! Lifetimes are found by one lookahead cursor shared by all allocations.
//! Frees it walks past that belong to other addresses are parked in per-address
//! FIFO queues until their allocation comes up, so no part of the trace is
//! scanned twice.

use crate::error::Result;
use crate::queue_pool::{FreeEntry, FreeQueuePool, PoolConfig, PoolStats};
use crate::reader::TraceReader;
use crate::record::MemRecord;
use crate::sink::{EnrichedRecord, RecordSink};
use fnv::FnvHashMap;
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Lifetime reported for allocations without a matched free
pub const UNRESOLVED_LIFETIME: i64 = -1;

/// Analysis pass configuration
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// How far past an allocation (corrected ns) the free scan may look
    pub lookahead_ns: u64,
    /// Full width of the density window (ns)
    pub density_width_ns: u64,
    /// Queued free entries at which scanning outside the lookahead stops
    pub table_capacity: usize,
    /// Log progress every this many records; `None` logs every 1%
    pub progress_every: Option<usize>,
    pub pool: PoolConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            lookahead_ns: 200 * 1_000_000_000,
            density_width_ns: 1_000 * 1_000,
            table_capacity: 100_000_000,
            progress_every: None,
            pool: PoolConfig::default(),
        }
    }
}

/// Counters reported at the end of a pass
#[derive(Debug, Clone, Default)]
pub struct AnalysisSummary {
    pub records: usize,
    pub allocations: usize,
    pub frees: usize,
    /// Allocations matched to a free
    pub resolved: usize,
    /// Allocations given up on once the scan passed the lookahead horizon
    pub skipped: usize,
    /// Allocations whose scan reached the end of the trace inside the horizon
    pub unmatched: usize,
    /// Queued frees dropped because they preceded the allocation popping them
    pub stale_frees: usize,
    /// Largest number of queued frees at any time
    pub peak_entries: usize,
    /// Frees still queued when the pass ended
    pub pending_entries: usize,
    pub pool: PoolStats,
    pub elapsed: Duration,
}

impl fmt::Display for AnalysisSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Records          = {}", self.records)?;
        writeln!(f, "Allocations      = {}", self.allocations)?;
        writeln!(f, "Frees            = {}", self.frees)?;
        writeln!(f, "Resolved         = {}", self.resolved)?;
        writeln!(f, "Skipped          = {}", self.skipped)?;
        writeln!(f, "Unmatched        = {}", self.unmatched)?;
        writeln!(f, "Stale frees      = {}", self.stale_frees)?;
        writeln!(f, "Peak entries     = {}", self.peak_entries)?;
        writeln!(f, "Pending entries  = {}", self.pending_entries)?;
        writeln!(f, "Queue hit rate   = {:.1}%", self.pool.hit_rate())?;
        writeln!(f, "Elapsed          = {:.3}s", self.elapsed.as_secs_f64())
    }
}

/// Corrected time of a record entered at `tstart`
fn corrected(tstart: u64, t_start: u64, offset: u64) -> i64 {
    (tstart as i64).wrapping_sub(t_start as i64).wrapping_sub(offset as i64)
}

/// One edge of the density window
///
/// Carries the hook overhead of every record before `index`, so its corrected
/// times are computed independently of the main cursor.
#[derive(Debug, Clone, Copy, Default)]
struct WindowEdge {
    index: usize,
    offset: u64,
}

impl WindowEdge {
    /// Move forward while the edge record's corrected time is below `target`
    fn advance(&mut self, reader: &dyn TraceReader, t_start: u64, target: i64, limit: usize) -> Result<()> {
        while self.index < limit {
            let r = reader.at(self.index)?;
            if corrected(r.tstart(), t_start, self.offset) >= target {
                break;
            }
            self.offset += r.overhead();
            self.index += 1;
        }
        Ok(())
    }
}

/// Furthest point examined by the lifetime scan
#[derive(Debug, Clone, Copy)]
struct ScanCursor {
    /// Next unexamined record
    next: usize,
    /// Hook overhead of every record before `next`
    offset: u64,
    /// Corrected time of the last examined record
    tcorr: i64,
}

impl ScanCursor {
    fn new() -> Self {
        Self {
            next: 0,
            offset: 0,
            tcorr: i64::MIN,
        }
    }
}

/// Frees seen ahead of the main cursor, FIFO per address
#[derive(Debug)]
struct FreeTable {
    queues: FnvHashMap<u64, VecDeque<FreeEntry>>,
    pool: FreeQueuePool,
    entries: usize,
    peak: usize,
    stale: usize,
}

impl FreeTable {
    fn new(pool: PoolConfig) -> Self {
        Self {
            queues: FnvHashMap::default(),
            pool: FreeQueuePool::new(pool),
            entries: 0,
            peak: 0,
            stale: 0,
        }
    }

    fn push(&mut self, addr: u64, entry: FreeEntry) {
        let pool = &mut self.pool;
        self.queues
            .entry(addr)
            .or_insert_with(|| pool.acquire())
            .push_back(entry);
        self.entries += 1;
        self.peak = self.peak.max(self.entries);
    }

    /// Oldest queued free for `addr` recorded after `index`
    ///
    /// Queued frees at or before `index` belong to an earlier lifetime of the
    /// address and are dropped.
    fn pop_after(&mut self, addr: u64, index: usize) -> Option<FreeEntry> {
        let queue = self.queues.get_mut(&addr)?;
        let mut found = None;
        while let Some(entry) = queue.pop_front() {
            self.entries -= 1;
            if entry.source_index > index {
                found = Some(entry);
                break;
            }
            self.stale += 1;
        }
        if queue.is_empty() {
            if let Some(queue) = self.queues.remove(&addr) {
                self.pool.release(queue);
            }
        }
        found
    }
}

/// Everything carried from one record to the next
struct AnalysisState {
    t_start: u64,
    /// Hook overhead of every record before the current one
    t_offset: u64,
    window_min: WindowEdge,
    window_max: WindowEdge,
    addr_last: u64,
    size_last: u64,
    locality: i64,
    variation: i64,
    cursor: ScanCursor,
    table: FreeTable,
    summary: AnalysisSummary,
}

impl AnalysisState {
    fn new(t_start: u64, first: &dyn MemRecord, pool: PoolConfig) -> Self {
        Self {
            t_start,
            t_offset: 0,
            window_min: WindowEdge::default(),
            window_max: WindowEdge::default(),
            addr_last: first.addr(),
            size_last: first.size(),
            locality: 0,
            variation: 0,
            cursor: ScanCursor::new(),
            table: FreeTable::new(pool),
            summary: AnalysisSummary::default(),
        }
    }
}

/// Runs the enrichment pass
#[derive(Debug, Clone, Default)]
pub struct AnalysisEngine {
    config: AnalysisConfig,
}

impl AnalysisEngine {
    pub fn new(config: AnalysisConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Enrich every record of `reader` in order and hand it to `sink`
    ///
    /// # Errors
    /// Reader and sink errors abort the pass. An allocation without a free is
    /// not an error; it is reported with [`UNRESOLVED_LIFETIME`].
    pub fn run(&self, reader: &dyn TraceReader, sink: &mut dyn RecordSink) -> Result<AnalysisSummary> {
        let started = Instant::now();
        let n = reader.len();
        if n == 0 {
            info!("Trace holds no records");
            sink.finish()?;
            return Ok(AnalysisSummary::default());
        }

        let first = reader.at(0)?;
        let mut state = AnalysisState::new(reader.header().start_time, &first, self.config.pool.clone());
        drop(first);

        let progress_every = self.config.progress_every.unwrap_or(n / 100).max(1);
        info!(
            records = n,
            reader = reader.name(),
            lookahead_ns = self.config.lookahead_ns,
            density_width_ns = self.config.density_width_ns,
            "Starting analysis pass"
        );

        for i in 0..n {
            let record = self.step(&mut state, reader, i)?;
            sink.write(&record)?;

            if i % progress_every == 0 {
                info!(
                    percent = i * 100 / n,
                    records = i,
                    tcorr_ns = record.t_corrected,
                    entries = state.table.entries,
                    addresses = state.table.queues.len(),
                    skipped = state.summary.skipped,
                    elapsed_s = started.elapsed().as_secs(),
                    "Analysis progress"
                );
            }
        }
        sink.finish()?;

        let mut summary = state.summary;
        summary.records = n;
        summary.peak_entries = state.table.peak;
        summary.pending_entries = state.table.entries;
        summary.stale_frees = state.table.stale;
        summary.pool = state.table.pool.stats();
        summary.elapsed = started.elapsed();
        info!(
            records = summary.records,
            resolved = summary.resolved,
            skipped = summary.skipped,
            peak_entries = summary.peak_entries,
            "Analysis pass complete"
        );
        Ok(summary)
    }

    fn step(&self, state: &mut AnalysisState, reader: &dyn TraceReader, i: usize) -> Result<EnrichedRecord> {
        let r = reader.at(i)?;
        let tcorr = corrected(r.tstart(), state.t_start, state.t_offset);
        state.t_offset += r.overhead();

        let half = (self.config.density_width_ns / 2) as i64;
        state
            .window_min
            .advance(reader, state.t_start, tcorr.saturating_sub(half), i)?;
        state
            .window_max
            .advance(reader, state.t_start, tcorr.saturating_add(half), reader.len())?;
        let density = (state.window_max.index as u64)
            .saturating_sub(state.window_min.index as u64)
            .saturating_sub(1);

        let mut lifetime = UNRESOLVED_LIFETIME;
        if r.is_free() {
            state.summary.frees += 1;
        } else {
            state.summary.allocations += 1;
            state.locality = r.addr().wrapping_sub(state.addr_last) as i64;
            state.variation = r.size().wrapping_sub(state.size_last) as i64;
            state.addr_last = r.addr();
            state.size_last = r.size();
            lifetime = self.resolve_lifetime(state, reader, i, r.addr(), tcorr)?;
        }

        Ok(EnrichedRecord {
            t0: r.tstart(),
            t1: r.treturn(),
            t2: r.tend(),
            t_corrected: u64::try_from(tcorr).unwrap_or(0),
            address: r.addr(),
            a_type: r.alloc_type(),
            density,
            lifetime,
            locality: state.locality,
            size: r.size(),
            variation: state.variation,
            stacks: r.stacks(),
        })
    }

    /// Match the allocation at `i` to a free of `addr`
    fn resolve_lifetime(
        &self,
        state: &mut AnalysisState,
        reader: &dyn TraceReader,
        i: usize,
        addr: u64,
        tcorr: i64,
    ) -> Result<i64> {
        if let Some(entry) = state.table.pop_after(addr, i) {
            state.summary.resolved += 1;
            return Ok(entry.corrected_time - tcorr);
        }

        let lookahead = i64::try_from(self.config.lookahead_ns).unwrap_or(i64::MAX);
        let horizon = tcorr.saturating_add(lookahead);
        if state.cursor.tcorr >= horizon {
            state.summary.skipped += 1;
            return Ok(UNRESOLVED_LIFETIME);
        }

        // Frees before this allocation cannot release it
        if state.cursor.next <= i {
            state.cursor = ScanCursor {
                next: i + 1,
                offset: state.t_offset,
                tcorr,
            };
        }

        let capacity = self.config.table_capacity;
        let n = reader.len();
        let cursor = &mut state.cursor;
        let table = &mut state.table;
        while cursor.next < n && (cursor.tcorr < horizon || table.entries < capacity) {
            let index = cursor.next;
            let r = reader.at(index)?;
            let free_tcorr = corrected(r.tstart(), state.t_start, cursor.offset);
            cursor.offset += r.overhead();
            cursor.tcorr = free_tcorr;
            cursor.next += 1;

            if !r.is_free() || r.addr() == 0 {
                continue;
            }
            if r.addr() == addr {
                state.summary.resolved += 1;
                return Ok(free_tcorr - tcorr);
            }
            table.push(
                r.addr(),
                FreeEntry {
                    source_index: index,
                    corrected_time: free_tcorr,
                },
            );
        }

        if cursor.tcorr >= horizon {
            state.summary.skipped += 1;
            debug!(
                index = i,
                addr,
                entries = table.entries,
                "No free within the lookahead window"
            );
        } else {
            state.summary.unmatched += 1;
        }
        Ok(UNRESOLVED_LIFETIME)
    }
}
