//! Integration test: dumps written by the guarded heap are aggregated
//! offline, both through the library and through the `harness` binary.
//!
//! Run: cargo test -p guardalloc-harness --test dump_aggregation_test

use std::path::PathBuf;
use std::process::Command;

use guardalloc_core::{AllocOrigin, GuardedHeap, ReportFormat};
use guardalloc_harness::{HarnessError, SortKey, aggregate, diff_dumps, load_dump, load_merged};

fn scratch_dir(test: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("guardalloc-harness-{test}-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_dump(heap: &GuardedHeap, path: &PathBuf) {
    let json = heap.report_flat(ReportFormat::Structured).unwrap();
    std::fs::write(path, json).unwrap();
}

#[test]
fn library_aggregates_heap_dump() {
    let dir = scratch_dir("library");
    let heap = GuardedHeap::new();
    let ptrs: Vec<_> = [("A", 10), ("A", 20), ("A", 30), ("B", 5), ("C", 100)]
        .into_iter()
        .map(|(name, len)| heap.allocate(len, name).unwrap())
        .collect();
    let path = dir.join("dump.json");
    write_dump(&heap, &path);

    let dump = load_dump(&path).unwrap();
    assert_eq!(dump.block_count, 5);
    let by_size = aggregate(&dump, SortKey::Size);
    let summary: Vec<_> = by_size
        .iter()
        .map(|g| (g.name.as_str(), g.count, g.total_bytes))
        .collect();
    assert_eq!(summary, [("C", 1, 100), ("A", 3, 60), ("B", 1, 5)]);
    assert_eq!(aggregate(&dump, SortKey::Users)[0].name, "A");

    let merged = load_merged(&[path.clone(), path.clone()]).unwrap();
    assert_eq!(merged.blocks.len(), 10);
    assert_eq!(merged.bytes_in_use, 2 * 165);

    for ptr in ptrs {
        heap.deallocate(ptr.as_ptr(), AllocOrigin::Raw);
    }
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn diff_reports_growth_between_snapshots() {
    let dir = scratch_dir("diff");
    let heap = GuardedHeap::new();
    let keep = heap.allocate(64, "cache").unwrap();
    let before = dir.join("before.json");
    write_dump(&heap, &before);

    let extra = heap.allocate(256, "cache").unwrap();
    let undo = heap.allocate(32, "undo").unwrap();
    let after = dir.join("after.json");
    write_dump(&heap, &after);

    let deltas = diff_dumps(&load_dump(&before).unwrap(), &load_dump(&after).unwrap());
    let summary: Vec<_> = deltas
        .iter()
        .map(|d| (d.name.as_str(), d.count_delta(), d.byte_delta()))
        .collect();
    assert_eq!(summary, [("cache", 1, 256), ("undo", 1, 32)]);

    for ptr in [keep, extra, undo] {
        heap.deallocate(ptr.as_ptr(), AllocOrigin::Raw);
    }
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn malformed_and_missing_inputs_are_errors() {
    let dir = scratch_dir("errors");
    let bad = dir.join("bad.json");
    std::fs::write(&bad, "{ not json").unwrap();
    assert!(matches!(load_dump(&bad), Err(HarnessError::Malformed { .. })));
    assert!(matches!(
        load_dump(&dir.join("missing.json")),
        Err(HarnessError::Io(_))
    ));
    assert!(matches!(load_merged(&[]), Err(HarnessError::NoInput)));
    std::fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn cli_summarize_prints_sorted_table() {
    let dir = scratch_dir("cli");
    let heap = GuardedHeap::new();
    let a = heap.allocate(8, "alpha").unwrap();
    let b = heap.allocate(8, "beta").unwrap();
    let c = heap.allocate(8, "beta").unwrap();
    let path = dir.join("dump.json");
    write_dump(&heap, &path);

    let output = Command::new(env!("CARGO_BIN_EXE_harness"))
        .args(["summarize", "--sort", "users"])
        .arg(&path)
        .output()
        .expect("run harness");
    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8(output.stdout).unwrap();
    let beta = stdout.find("beta").expect("beta row");
    let alpha = stdout.find("alpha").expect("alpha row");
    assert!(beta < alpha, "{stdout}");
    assert!(stdout.contains("3 blocks, 24 bytes in 2 groups"), "{stdout}");

    let json = Command::new(env!("CARGO_BIN_EXE_harness"))
        .args(["summarize", "--format", "json", "--top", "1"])
        .arg(&path)
        .output()
        .expect("run harness");
    assert!(json.status.success(), "{json:?}");
    let groups: serde_json::Value = serde_json::from_slice(&json.stdout).unwrap();
    assert_eq!(groups.as_array().unwrap().len(), 1);
    assert_eq!(groups[0]["name"], "beta");

    for ptr in [a, b, c] {
        heap.deallocate(ptr.as_ptr(), AllocOrigin::Raw);
    }
    std::fs::remove_dir_all(&dir).unwrap();
}
