//! End-to-end project tests: full and incremental refreshes through the
//! scheduler, idempotence of a full reindex, configuration drift.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use symdex::project::Project;
use symdex::refresh::RefreshMode;
use symdex::status::{PartialResultDecision, StatusEvent, StatusReporter};
use symdex::task::TaskScheduler;

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("symdex_project_{}_{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[derive(Default)]
struct CollectingReporter {
    events: Mutex<Vec<StatusEvent>>,
}

impl CollectingReporter {
    fn finished_events(&self) -> Vec<StatusEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, StatusEvent::IndexingFinished { .. }))
            .cloned()
            .collect()
    }
}

impl StatusReporter for CollectingReporter {
    fn report(&self, event: StatusEvent) {
        self.events.lock().unwrap().push(event);
    }

    fn confirm_keep_partial(&self) -> PartialResultDecision {
        PartialResultDecision::Keep
    }
}

fn write_settings(dir: &Path) -> PathBuf {
    let path = dir.join("demo.toml");
    std::fs::write(
        &path,
        r#"
name = "demo"
worker_count = 2

[[source_groups]]
root = "src"
language = "rust"
extensions = ["rs"]
exclude = ["target"]
"#,
    )
    .unwrap();
    path
}

fn write_sources(dir: &Path) {
    let src = dir.join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("main.rs"), "fn alpha() { beta(); }\n").unwrap();
    std::fs::write(src.join("lib.rs"), "fn beta() { gamma(); }\nfn gamma() {}\n").unwrap();
}

fn run_index(project: &Project, mode: RefreshMode) {
    let mut scheduler = TaskScheduler::new();
    scheduler.start();
    let info = project.refresh_info(mode).unwrap();
    project.build_index(info, &scheduler).unwrap();
    scheduler.wait_idle();
    scheduler.stop();
}

#[test]
fn full_reindex_builds_the_store() {
    let dir = scratch_dir("full");
    write_sources(&dir);
    let settings = write_settings(&dir);

    let reporter = Arc::new(CollectingReporter::default());
    let project = Project::open(&settings, reporter.clone()).unwrap();
    run_index(&project, RefreshMode::AllFiles);

    assert!(project.store_paths().db.exists());
    assert!(!project.store_paths().temp.exists());

    let store = project.open_store().unwrap();
    assert_eq!(store.file_count().unwrap(), 2);
    assert!(store.symbol_count().unwrap() >= 3);
    assert!(store.reference_count().unwrap() >= 2);
    assert_eq!(store.error_count().unwrap(), 0);

    let finished = reporter.finished_events();
    assert_eq!(finished.len(), 1);
    match &finished[0] {
        StatusEvent::IndexingFinished {
            indexed,
            total,
            interrupted,
            ..
        } => {
            assert_eq!(*indexed, 2);
            assert_eq!(*total, 2);
            assert!(!interrupted);
        }
        _ => unreachable!(),
    }
}

#[test]
fn full_reindex_twice_is_idempotent() {
    let dir = scratch_dir("idempotent");
    write_sources(&dir);
    let settings = write_settings(&dir);

    let reporter = Arc::new(CollectingReporter::default());
    let project = Project::open(&settings, reporter).unwrap();

    run_index(&project, RefreshMode::AllFiles);
    let digest_first = project.open_store().unwrap().content_digest().unwrap();

    run_index(&project, RefreshMode::AllFiles);
    let digest_second = project.open_store().unwrap().content_digest().unwrap();

    assert_eq!(digest_first, digest_second);
}

#[test]
fn updated_mode_with_no_changes_is_a_noop() {
    let dir = scratch_dir("noop");
    write_sources(&dir);
    let settings = write_settings(&dir);

    let reporter = Arc::new(CollectingReporter::default());
    let project = Project::open(&settings, reporter.clone()).unwrap();
    run_index(&project, RefreshMode::AllFiles);
    let digest_before = project.open_store().unwrap().content_digest().unwrap();

    let info = project.refresh_info(RefreshMode::UpdatedFiles).unwrap();
    assert!(info.is_noop());

    run_index(&project, RefreshMode::UpdatedFiles);
    // The early-out still emits a finished event.
    assert_eq!(reporter.finished_events().len(), 2);
    let digest_after = project.open_store().unwrap().content_digest().unwrap();
    assert_eq!(digest_before, digest_after);
}

#[test]
fn updated_mode_reindexes_only_changed_files() {
    let dir = scratch_dir("incremental");
    write_sources(&dir);
    let settings = write_settings(&dir);

    let reporter = Arc::new(CollectingReporter::default());
    let project = Project::open(&settings, reporter).unwrap();
    run_index(&project, RefreshMode::AllFiles);

    // Grow one file so size-based fingerprinting sees it regardless of
    // filesystem timestamp granularity.
    std::fs::write(
        dir.join("src/main.rs"),
        "fn alpha() { beta(); }\nfn delta() {}\n",
    )
    .unwrap();

    let info = project.refresh_info(RefreshMode::UpdatedFiles).unwrap();
    assert_eq!(
        info.files_to_index,
        std::collections::BTreeSet::from([dir.join("src/main.rs")])
    );

    run_index(&project, RefreshMode::UpdatedFiles);
    let store = project.open_store().unwrap();
    assert_eq!(store.file_count().unwrap(), 2);

    // The new definition is present exactly once.
    let digest = store.content_digest().unwrap();
    run_index(&project, RefreshMode::UpdatedFiles);
    assert_eq!(project.open_store().unwrap().content_digest().unwrap(), digest);
}

#[test]
fn deleted_files_are_purged_by_updated_mode() {
    let dir = scratch_dir("deleted");
    write_sources(&dir);
    let settings = write_settings(&dir);

    let reporter = Arc::new(CollectingReporter::default());
    let project = Project::open(&settings, reporter).unwrap();
    run_index(&project, RefreshMode::AllFiles);
    assert_eq!(project.open_store().unwrap().file_count().unwrap(), 2);

    std::fs::remove_file(dir.join("src/lib.rs")).unwrap();
    run_index(&project, RefreshMode::UpdatedFiles);

    let store = project.open_store().unwrap();
    assert_eq!(store.file_count().unwrap(), 1);
    let records = store.file_records().unwrap();
    assert_eq!(records[0].path, dir.join("src/main.rs"));
}

#[test]
fn configuration_drift_forces_a_full_refresh() {
    let dir = scratch_dir("drift");
    write_sources(&dir);
    let settings = write_settings(&dir);

    let reporter = Arc::new(CollectingReporter::default());
    let project = Project::open(&settings, reporter.clone()).unwrap();
    run_index(&project, RefreshMode::AllFiles);

    // Same sources, changed configuration text.
    std::fs::write(
        &settings,
        r#"
name = "demo"
worker_count = 1

[[source_groups]]
root = "src"
language = "rust"
extensions = ["rs"]
exclude = ["target"]
"#,
    )
    .unwrap();
    let project = Project::open(&settings, reporter).unwrap();
    let info = project.refresh_info(RefreshMode::UpdatedFiles).unwrap();
    assert_eq!(info.mode, RefreshMode::AllFiles);
    assert_eq!(info.files_to_index.len(), 2);
}

#[test]
fn missing_store_forces_a_full_refresh() {
    let dir = scratch_dir("fresh");
    write_sources(&dir);
    let settings = write_settings(&dir);

    let reporter = Arc::new(CollectingReporter::default());
    let project = Project::open(&settings, reporter).unwrap();
    let info = project.refresh_info(RefreshMode::UpdatedFiles).unwrap();
    assert_eq!(info.mode, RefreshMode::AllFiles);
    assert_eq!(info.files_to_index.len(), 2);
}

#[test]
fn per_file_errors_flag_the_file_incomplete() {
    let dir = scratch_dir("incomplete");
    let src = dir.join("src");
    std::fs::create_dir_all(&src).unwrap();
    std::fs::write(src.join("good.rs"), "fn good() {}\n").unwrap();
    // Invalid UTF-8 makes the token frontend record a fatal per-file error.
    std::fs::write(src.join("bad.rs"), [0xffu8, 0xfe, 0x00, 0x80]).unwrap();
    let settings = write_settings(&dir);

    let reporter = Arc::new(CollectingReporter::default());
    let project = Project::open(&settings, reporter).unwrap();
    run_index(&project, RefreshMode::AllFiles);

    let store = project.open_store().unwrap();
    assert_eq!(store.file_count().unwrap(), 2);
    assert_eq!(store.error_count().unwrap(), 1);

    let records = store.file_records().unwrap();
    let bad = records
        .iter()
        .find(|r| r.path == src.join("bad.rs"))
        .unwrap();
    assert!(!bad.complete);

    // The incomplete file is re-selected by the retry mode even though its
    // fingerprint is unchanged.
    let info = project
        .refresh_info(RefreshMode::UpdatedAndIncompleteFiles)
        .unwrap();
    assert!(info.files_to_index.contains(&src.join("bad.rs")));
}
