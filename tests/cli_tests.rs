// Command-line driver: argument handling and output files

mod utils;

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use utils::{alloc, free, tempdir, write_trace};

fn five_record_trace(dir: &std::path::Path) -> std::path::PathBuf {
    write_trace(
        dir,
        "five.bin",
        0,
        &[
            alloc(0, 100, 8),
            alloc(10, 200, 16),
            free(20, 100),
            alloc(30, 100, 4),
            free(40, 200),
        ],
    )
}

#[test]
fn test_missing_input_is_usage_error() {
    let mut cmd = Command::cargo_bin("heaptrail").unwrap();
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn test_nonexistent_input_fails() {
    let dir = tempdir();
    let mut cmd = Command::cargo_bin("heaptrail").unwrap();
    cmd.arg("-i").arg(dir.path().join("nope.bin"));
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Failed to open trace"));
}

#[test]
fn test_default_output_is_csv_next_to_input() {
    let dir = tempdir();
    let input = five_record_trace(dir.path());

    let mut cmd = Command::cargo_bin("heaptrail").unwrap();
    cmd.arg("-i").arg(&input).arg("-l").arg("1000");
    cmd.assert()
        .success()
        .stderr(predicate::str::contains("Resolved         = 2"));

    let csv = fs::read_to_string(dir.path().join("five.bin.out")).unwrap();
    let lines: Vec<&str> = csv.lines().collect();
    assert_eq!(lines.len(), 6);
    assert!(lines[0].starts_with("T0,T1,T2,TCorrected,Address,AType"));
    let lifetimes: Vec<&str> = lines[1..]
        .iter()
        .map(|line| line.split(',').nth(7).unwrap())
        .collect();
    assert_eq!(lifetimes, vec!["20", "30", "-1", "-1", "-1"]);
}

#[test]
fn test_positional_input_json_output() {
    let dir = tempdir();
    let input = five_record_trace(dir.path());
    let output = dir.path().join("out.jsonl");

    let mut cmd = Command::cargo_bin("heaptrail").unwrap();
    cmd.arg(&input)
        .arg("-o")
        .arg(&output)
        .arg("--format")
        .arg("json")
        .arg("--direct");
    cmd.assert().success();

    let text = fs::read_to_string(&output).unwrap();
    assert_eq!(text.lines().count(), 5);
    let first: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
    assert_eq!(first["Address"], 100);
    assert_eq!(first["Lifetime"], 20);
}

#[test]
fn test_header_only() {
    let dir = tempdir();
    let input = five_record_trace(dir.path());

    let mut cmd = Command::cargo_bin("heaptrail").unwrap();
    cmd.arg("--header-only").arg(&input);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Key              = FOM"))
        .stdout(predicate::str::contains("Num Records      = 5"));
    assert!(!dir.path().join("five.bin.out").exists());
}

#[test]
fn test_invalid_format_rejected() {
    let mut cmd = Command::cargo_bin("heaptrail").unwrap();
    cmd.arg("t.bin").arg("--format").arg("parquet");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}
