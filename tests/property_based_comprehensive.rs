//! Comprehensive property-based tests for the analysis pass
//!
//! Core properties tested:
//! 1. Lifetimes on well-formed traces equal the true free-minus-alloc times
//! 2. Density equals a brute-force window count on overhead-free streams
//! 3. Past the lookahead horizon the free table stays within its capacity plus one
//! 4. Resolved, skipped and unmatched allocations account for every allocation
//! 5. No lifetime is negative, whatever order frees and allocations come in

mod utils;

use heaptrail::{
    open_reader, AnalysisConfig, AnalysisEngine, AnalysisSummary, EnrichedRecord, OwnedRecord,
    ReaderOptions, VecSink, UNRESOLVED_LIFETIME,
};
use proptest::prelude::*;
use utils::{alloc, free, tempdir, write_trace};

fn analyze(records: &[OwnedRecord], config: AnalysisConfig) -> (Vec<EnrichedRecord>, AnalysisSummary) {
    let dir = tempdir();
    let path = write_trace(dir.path(), "prop.bin", 0, records);
    let reader = open_reader(&path, &ReaderOptions { indexed: true, period: 7 }).unwrap();
    let mut sink = VecSink::new();
    let summary = AnalysisEngine::new(config)
        .run(reader.as_ref(), &mut sink)
        .unwrap();
    (sink.records, summary)
}

/// Build a well-formed trace from a list of (address slot, action) choices
///
/// Returns the records and the expected lifetime of each record.
fn simulate(steps: &[(u8, bool)], spacing: u64) -> (Vec<OwnedRecord>, Vec<i64>) {
    let mut live: [Option<usize>; 8] = [None; 8];
    let mut records = Vec::new();
    let mut expected = Vec::new();

    for (i, &(slot, prefer_free)) in steps.iter().enumerate() {
        let slot = usize::from(slot % 8);
        let t = i as u64 * spacing;
        let addr = 0x1000 + 0x100 * slot as u64;
        match live[slot] {
            Some(at) if prefer_free => {
                expected[at] = (t - at as u64 * spacing) as i64;
                records.push(free(t, addr));
                expected.push(UNRESOLVED_LIFETIME);
                live[slot] = None;
            }
            None => {
                live[slot] = Some(records.len());
                records.push(alloc(t, addr, 8 + slot as u64));
                expected.push(UNRESOLVED_LIFETIME);
            }
            Some(_) => {
                // already live; emit a free of an address nobody allocated
                records.push(free(t, 0xdead_0000 + i as u64));
                expected.push(UNRESOLVED_LIFETIME);
            }
        }
    }
    (records, expected)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_lifetimes_match_true_pairs(
        steps in prop::collection::vec((any::<u8>(), any::<bool>()), 1..150),
        spacing in 1u64..1_000,
    ) {
        let (records, expected) = simulate(&steps, spacing);
        let config = AnalysisConfig {
            lookahead_ns: u64::MAX,
            ..AnalysisConfig::default()
        };
        let (out, summary) = analyze(&records, config);

        let lifetimes: Vec<i64> = out.iter().map(|r| r.lifetime).collect();
        prop_assert_eq!(lifetimes, expected);
        prop_assert_eq!(
            summary.resolved + summary.skipped + summary.unmatched,
            summary.allocations
        );
    }

    #[test]
    fn prop_density_matches_brute_force(
        gaps in prop::collection::vec(0u64..50, 1..120),
        width in 0u64..200,
    ) {
        let mut t = 0;
        let records: Vec<OwnedRecord> = gaps
            .iter()
            .enumerate()
            .map(|(i, gap)| {
                t += gap;
                alloc(t, 0x10 * i as u64, 16)
            })
            .collect();
        let times: Vec<i64> = records.iter().map(|r| heaptrail::MemRecord::tstart(r) as i64).collect();
        let half = (width / 2) as i64;

        let config = AnalysisConfig {
            density_width_ns: width,
            ..AnalysisConfig::default()
        };
        let (out, _) = analyze(&records, config);

        for (i, r) in out.iter().enumerate() {
            let inside = times
                .iter()
                .filter(|&&tj| tj >= times[i] - half && tj < times[i] + half)
                .count() as u64;
            prop_assert_eq!(r.density, inside.saturating_sub(1), "record {}", i);
        }
    }

    #[test]
    fn prop_capacity_bound(
        frees in 1u64..300,
        capacity in 0usize..40,
    ) {
        let mut records = vec![alloc(0, 1, 8)];
        records.extend((0..frees).map(|k| free(1 + k, 0x10_000 + k)));
        let config = AnalysisConfig {
            lookahead_ns: 0,
            table_capacity: capacity,
            ..AnalysisConfig::default()
        };
        let (_, summary) = analyze(&records, config);
        prop_assert!(summary.peak_entries <= capacity + 1);
        prop_assert_eq!(summary.skipped, 1);
    }

    #[test]
    fn prop_lifetimes_never_negative(
        steps in prop::collection::vec((0u64..4, any::<bool>()), 1..120),
        lookahead in prop_oneof![Just(u64::MAX), 0u64..400],
        capacity in 0usize..8,
    ) {
        // arbitrary interleaving, including frees of blocks never seen allocated
        let records: Vec<OwnedRecord> = steps
            .iter()
            .enumerate()
            .map(|(i, &(slot, is_free))| {
                let t = 10 * i as u64;
                let addr = 0x40 * (1 + slot);
                if is_free { free(t, addr) } else { alloc(t, addr, 8) }
            })
            .collect();
        let config = AnalysisConfig {
            lookahead_ns: lookahead,
            table_capacity: capacity,
            ..AnalysisConfig::default()
        };
        let (out, summary) = analyze(&records, config);

        for r in &out {
            prop_assert!(r.lifetime == UNRESOLVED_LIFETIME || r.lifetime >= 0);
        }
        prop_assert_eq!(
            summary.resolved + summary.skipped + summary.unmatched,
            summary.allocations
        );
    }
}
