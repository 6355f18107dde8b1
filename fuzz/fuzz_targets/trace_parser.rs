#![no_main]

use heaptrail::header::FileHeader;
use heaptrail::record::{scan_records, MappedRecord, MemRecord};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Header and body parsing must reject malformed input, never panic
    let Ok((header, start)) = FileHeader::decode(data) else {
        return;
    };
    let _ = header.command_line();

    if let Ok(scan) = scan_records(data, start, 1) {
        for offset in scan.anchors {
            let record = MappedRecord::parse(data, offset).unwrap();
            let _ = record.stacks();
            let _ = record.last_page();
        }
    }
});
