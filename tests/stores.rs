// tests/stores.rs

use dagsched::dag::{DependencyGraph, TaskStatus};
use dagsched::store::{InMemoryStore, JsonFileStore, PersistenceStore};
use dagsched_test_utils::builders::task;

#[test]
fn memory_store_tracks_latest_status_and_history() {
    let store = InMemoryStore::new();
    store.save_task(&task("A")).unwrap();

    store.save_status("A", TaskStatus::Ready).unwrap();
    store.save_status("A", TaskStatus::Running).unwrap();

    assert_eq!(store.status_of("A"), Some(TaskStatus::Running));
    assert_eq!(
        store.status_history(),
        vec![
            ("A".to_string(), TaskStatus::Ready),
            ("A".to_string(), TaskStatus::Running)
        ]
    );
    assert_eq!(store.load_tasks().unwrap().len(), 1);
}

#[test]
fn status_for_unsaved_task_is_an_error() {
    let memory = InMemoryStore::new();
    assert!(memory.save_status("ghost", TaskStatus::Ready).is_err());

    let dir = tempfile::tempdir().unwrap();
    let file = JsonFileStore::open(dir.path().join("tasks.json")).unwrap();
    assert!(file.save_status("ghost", TaskStatus::Ready).is_err());
}

#[test]
fn json_store_survives_reopen_and_feeds_bulk_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state").join("tasks.json");

    {
        let store = JsonFileStore::open(&path).unwrap();
        let mut b = task("B").with_payload("echo b");
        b.dependencies.insert("A".to_string());

        store.save_task(&task("A")).unwrap();
        store.save_task(&b).unwrap();
        store.save_status("A", TaskStatus::Completed).unwrap();
        store.save_status("B", TaskStatus::Running).unwrap();
    }

    assert!(path.exists());
    assert!(!path.with_extension("json.tmp").exists());

    let reopened = JsonFileStore::open(&path).unwrap();
    assert_eq!(reopened.path(), path.as_path());

    let records = reopened.load_tasks().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].payload.as_deref(), Some("echo b"));

    let mut graph = DependencyGraph::bulk_load(records).unwrap();
    assert_eq!(graph.status_of("A"), Some(TaskStatus::Completed));
    // An interrupted attempt is parked again.
    assert_eq!(graph.status_of("B"), Some(TaskStatus::Pending));
    assert_eq!(graph.promote_all_ready(), vec!["B".to_string()]);
}

#[test]
fn json_store_writes_settle_on_the_latest_status() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.json");

    {
        let store = JsonFileStore::open(&path).unwrap();
        for i in 0..50 {
            store.save_task(&task(&format!("t{i:02}"))).unwrap();
        }
        for i in 0..50 {
            let id = format!("t{i:02}");
            store.save_status(&id, TaskStatus::Ready).unwrap();
            store.save_status(&id, TaskStatus::Running).unwrap();
            store.save_status(&id, TaskStatus::Completed).unwrap();
        }

        store.flush().unwrap();
        let on_disk: Vec<dagsched::dag::Task> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk.len(), 50);
        assert!(on_disk.iter().all(|t| t.status == TaskStatus::Completed));

        store.save_status("t07", TaskStatus::Failed).unwrap();
    }

    // Dropping the store writes out the last change.
    let reopened = JsonFileStore::open(&path).unwrap();
    let records = reopened.load_tasks().unwrap();
    let t07 = records.iter().find(|t| t.id == "t07").unwrap();
    assert_eq!(t07.status, TaskStatus::Failed);
}

#[test]
fn corrupt_json_store_fails_to_open() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.json");
    std::fs::write(&path, "{ not json").unwrap();

    let err = JsonFileStore::open(&path).unwrap_err();
    assert!(format!("{err:#}").contains("parsing task store"));
}
