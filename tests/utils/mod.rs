// Integration test utilities
//
// Helpers for writing synthetic traces to temporary files

#![allow(dead_code)]

use heaptrail::{OwnedRecord, Writer};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Allocation with no hook overhead
pub fn alloc(t: u64, addr: u64, size: u64) -> OwnedRecord {
    OwnedRecord::alloc(1, addr, size).with_times(t, t, t)
}

/// Free with no hook overhead
pub fn free(t: u64, addr: u64) -> OwnedRecord {
    OwnedRecord::free(addr).with_times(t, t, t)
}

/// Mixed allocations and frees with varying overhead and stack depth
pub fn mixed(n: usize) -> Vec<OwnedRecord> {
    (0..n)
        .map(|i| {
            let t = 1_000 * i as u64;
            let addr = 0x10_000 + 0x40 * (i as u64 % 17);
            let r = if i % 4 == 3 {
                OwnedRecord::free(addr)
            } else {
                OwnedRecord::alloc(1 + (i % 3) as u8, addr, 16 * (i as u64 % 9))
            };
            r.with_times(t, t + 3, t + 5 + (i as u64 % 7))
                .with_stacks((0..(i % 6) as u32).map(|f| f * 11 + i as u32).collect())
        })
        .collect()
}

/// Write `records` to `dir/name` with the given compression kind
pub fn write_trace(dir: &Path, name: &str, compression: i32, records: &[OwnedRecord]) -> PathBuf {
    let path = dir.join(name);
    let mut writer = Writer::create(&path, compression, 100).unwrap();
    for r in records {
        writer.append(r).unwrap();
    }
    writer.close(true).unwrap();
    path
}

/// Fresh temporary directory
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}
