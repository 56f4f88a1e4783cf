//! Cross-module scenarios for the access journal: watcher notices flow
//! through the coalescer into `files`/`log` rows.

use std::path::Path;

use usaged::event::NoticeMask;
use usaged::journal::{SqlBuf, Store};
use usaged::watcher::Coalescer;

fn access_store(dir: &Path) -> SqlBuf {
    let store = Store::open(&dir.join("access.db")).unwrap();
    store.bootstrap("it-uuid").unwrap();
    SqlBuf::new(store.into_conn())
}

fn log_rows(buf: &SqlBuf) -> Vec<(i64, i64, i64)> {
    buf.conn()
        .prepare("SELECT uid, time, size_plus_one FROM log ORDER BY rowid")
        .unwrap()
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
}

#[test]
fn create_then_delete_across_epochs_yields_two_ordered_rows() {
    let dir = tempfile::tempdir().unwrap();
    let mut buf = access_store(dir.path());
    let coalescer = Coalescer::new();

    // Epoch one: the file exists with four bytes when the flush stats it.
    let target = dir.path().join("a.txt");
    std::fs::write(&target, b"1234").unwrap();
    coalescer.note(&target, NoticeMask::CREATE | NoticeMask::CLOSE_WRITE, 100);
    coalescer.swap_and_process(&mut buf).unwrap();

    // Epoch two: the file is gone by observation time.
    std::fs::remove_file(&target).unwrap();
    coalescer.note(&target, NoticeMask::DELETE, 101);
    coalescer.swap_and_process(&mut buf).unwrap();

    let rows = log_rows(&buf);
    assert_eq!(rows.len(), 2);
    // Same stable file id, size then deletion marker, in order.
    assert_eq!(rows[0].0, rows[1].0);
    assert_eq!(rows[0].2, 5);
    assert_eq!(rows[1].2, 0);
    assert!(rows[0].1 < rows[1].1);
}

#[test]
fn each_path_appears_exactly_once_per_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let mut buf = access_store(dir.path());
    let coalescer = Coalescer::new();

    let names = ["c.txt", "a.txt", "b.txt"];
    for name in names {
        let p = dir.path().join(name);
        std::fs::write(&p, b"x").unwrap();
        // Bursts of duplicate observations for every path.
        coalescer.note(&p, NoticeMask::OPEN, 10);
        coalescer.note(&p, NoticeMask::OPEN, 11);
        coalescer.note(&p, NoticeMask::CLOSE_WRITE, 12);
    }
    coalescer.swap_and_process(&mut buf).unwrap();

    let rows = log_rows(&buf);
    assert_eq!(rows.len(), names.len());
    // One files row per distinct path.
    let files: i64 = buf
        .conn()
        .query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))
        .unwrap();
    assert_eq!(files, names.len() as i64);
    // Earliest observation time survives the merge.
    assert!(rows.iter().all(|r| r.1 == 10));
}

#[test]
fn next_epoch_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let mut buf = access_store(dir.path());
    let coalescer = Coalescer::new();
    let p = dir.path().join("once.txt");
    std::fs::write(&p, b"x").unwrap();
    coalescer.note(&p, NoticeMask::OPEN, 5);
    coalescer.swap_and_process(&mut buf).unwrap();
    // Nothing new observed: the second swap journals nothing.
    coalescer.swap_and_process(&mut buf).unwrap();
    assert_eq!(log_rows(&buf).len(), 1);
}
