mod common;

use std::time::Duration;

use hopbridge_lib::session::store::{load_records, save_records};

#[tokio::test]
async fn records_round_trip_through_the_session_directory() {
    let dir = tempfile::tempdir().unwrap();

    let records = vec![
        common::test_record("s1", Duration::from_secs(120)),
        common::test_record("s2", Duration::from_secs(120)),
    ];
    save_records(dir.path(), &records).await.unwrap();

    let mut loaded = load_records(dir.path()).await.unwrap();
    loaded.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(loaded, records);
}

#[tokio::test]
async fn save_sweeps_stale_and_temporary_files() {
    let dir = tempfile::tempdir().unwrap();

    let first = vec![
        common::test_record("s1", Duration::from_secs(120)),
        common::test_record("gone", Duration::from_secs(120)),
    ];
    save_records(dir.path(), &first).await.unwrap();

    // leftovers from an interrupted earlier save
    std::fs::write(dir.path().join("crashed.tmp.json"), b"{}").unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"keep me").unwrap();

    let second = vec![common::test_record("s1", Duration::from_secs(120))];
    save_records(dir.path(), &second).await.unwrap();

    let mut names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["notes.txt".to_string(), "s1.json".to_string()]);
}

#[tokio::test]
async fn loading_a_missing_directory_yields_no_records() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("does-not-exist");

    let loaded = load_records(&missing).await.unwrap();
    assert!(loaded.is_empty());
}

#[tokio::test]
async fn temporary_files_are_not_loaded() {
    let dir = tempfile::tempdir().unwrap();

    let records = vec![common::test_record("s1", Duration::from_secs(120))];
    save_records(dir.path(), &records).await.unwrap();
    std::fs::write(dir.path().join("s2.tmp.json"), b"{}").unwrap();

    let loaded = load_records(dir.path()).await.unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].id, "s1");
}
