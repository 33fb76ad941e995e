//! Work-channel tests for both transports: exactly-once command delivery,
//! heartbeat/crash accounting, interruption flags.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use symdex::channel::WorkChannel;
use symdex::channel::memory::MemoryChannel;
use symdex::channel::session::SessionDb;
use symdex::queue::IndexerCommand;
use symdex::storage::fragment::{FileRecord, GraphFragment};
use symdex::Fingerprint;

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("symdex_channel_{}_{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn command(path: &str) -> IndexerCommand {
    IndexerCommand {
        source_path: PathBuf::from(path),
        language: "rust".to_string(),
        indexed_paths: BTreeSet::new(),
        exclude_filters: BTreeSet::new(),
        include_filters: BTreeSet::new(),
        flags: Vec::new(),
        working_directory: PathBuf::from("."),
    }
}

fn fragment(path: &str) -> GraphFragment {
    let mut fragment = GraphFragment::new();
    fragment.record_file(FileRecord {
        path: PathBuf::from(path),
        fingerprint: Fingerprint::default(),
        language: "rust".to_string(),
        indexed: true,
        complete: true,
    });
    fragment
}

fn exactly_once_delivery(channel: Arc<dyn WorkChannel>) {
    let n = 100;
    let commands = (0..n).map(|i| command(&format!("f{i}.rs"))).collect();
    channel.load_commands(commands).unwrap();
    assert_eq!(channel.queue_len().unwrap(), n);

    let mut handles = Vec::new();
    for _ in 0..4 {
        let channel = Arc::clone(&channel);
        handles.push(std::thread::spawn(move || {
            let mut popped = Vec::new();
            while let Some(cmd) = channel.pop_command().unwrap() {
                popped.push(cmd.source_path);
            }
            popped
        }));
    }

    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }

    assert_eq!(all.len(), n);
    let distinct: BTreeSet<_> = all.into_iter().collect();
    assert_eq!(distinct.len(), n);
    assert_eq!(channel.queue_len().unwrap(), 0);
    assert!(channel.pop_command().unwrap().is_none());
}

#[test]
fn memory_channel_delivers_each_command_once() {
    exactly_once_delivery(Arc::new(MemoryChannel::new(4)));
}

#[test]
fn session_db_delivers_each_command_once() {
    let dir = scratch_dir("exactly_once");
    exactly_once_delivery(Arc::new(SessionDb::create(&dir, "run-1").unwrap()));
}

#[test]
fn session_db_workers_attach_to_the_same_queue() {
    let dir = scratch_dir("attach");
    let coordinator = SessionDb::create(&dir, "run-2").unwrap();
    coordinator
        .load_commands(vec![command("a.rs"), command("b.rs")])
        .unwrap();

    // Two workers with their own connections, as separate processes have.
    let worker1 = SessionDb::attach(&dir, "run-2").unwrap();
    let worker2 = SessionDb::attach(&dir, "run-2").unwrap();

    let first = worker1.pop_command().unwrap().unwrap();
    let second = worker2.pop_command().unwrap().unwrap();
    assert_ne!(first.source_path, second.source_path);
    assert!(worker1.pop_command().unwrap().is_none());
    assert_eq!(coordinator.queue_len().unwrap(), 0);
}

#[test]
fn session_db_attach_fails_without_a_session() {
    let dir = scratch_dir("no_session");
    assert!(SessionDb::attach(&dir, "missing").is_err());
}

#[test]
fn session_file_is_removed_when_the_coordinator_drops() {
    let dir = scratch_dir("cleanup");
    let coordinator = SessionDb::create(&dir, "run-3").unwrap();
    let path = coordinator.path().to_path_buf();
    assert!(path.exists());
    drop(coordinator);
    assert!(!path.exists());
}

fn heartbeat_crash_accounting(channel: &dyn WorkChannel) {
    channel.start_indexing_file(1, Path::new("first.rs")).unwrap();
    channel.finish_indexing_file(1).unwrap();

    // The slot dies mid-file, reattaches, and starts the next file: the
    // stale heartbeat is promoted to the crashed list.
    channel.start_indexing_file(1, Path::new("dies.rs")).unwrap();
    channel.start_indexing_file(1, Path::new("next.rs")).unwrap();
    channel.finish_indexing_file(1).unwrap();

    // Another slot dies and never comes back; its heartbeat is swept at the
    // end of the run.
    channel.start_indexing_file(2, Path::new("stuck.rs")).unwrap();

    let crashed: BTreeSet<PathBuf> = channel.take_crashed_files().unwrap().into_iter().collect();
    assert_eq!(
        crashed,
        BTreeSet::from([PathBuf::from("dies.rs"), PathBuf::from("stuck.rs")])
    );
    // Accounted exactly once.
    assert!(channel.take_crashed_files().unwrap().is_empty());
}

#[test]
fn memory_channel_accounts_for_crashes() {
    heartbeat_crash_accounting(&MemoryChannel::new(4));
}

#[test]
fn session_db_accounts_for_crashes() {
    let dir = scratch_dir("crashes");
    heartbeat_crash_accounting(&SessionDb::create(&dir, "run-4").unwrap());
}

fn record_crashed_on_dead_slot(channel: &dyn WorkChannel) {
    channel.start_indexing_file(1, Path::new("mid.rs")).unwrap();
    channel.record_crashed(1).unwrap();
    // Idempotent: the heartbeat is gone after the first accounting.
    channel.record_crashed(1).unwrap();

    let crashed = channel.take_crashed_files().unwrap();
    assert_eq!(crashed, vec![PathBuf::from("mid.rs")]);
}

#[test]
fn memory_channel_records_dead_slot_heartbeats() {
    record_crashed_on_dead_slot(&MemoryChannel::new(4));
}

#[test]
fn session_db_records_dead_slot_heartbeats() {
    let dir = scratch_dir("dead_slot");
    record_crashed_on_dead_slot(&SessionDb::create(&dir, "run-5").unwrap());
}

fn fragments_and_finish_signals(channel: &dyn WorkChannel) {
    channel.start_indexing_file(1, Path::new("a.rs")).unwrap();
    channel.push_fragment(1, &fragment("a.rs")).unwrap();
    channel.finish_indexing_file(1).unwrap();

    channel.start_indexing_file(2, Path::new("b.rs")).unwrap();
    channel.push_fragment(2, &fragment("b.rs")).unwrap();
    channel.finish_indexing_file(2).unwrap();

    let announced = channel.take_announced_files().unwrap();
    assert_eq!(announced, vec![PathBuf::from("a.rs"), PathBuf::from("b.rs")]);

    // Finish signals arrive in completion order and lead to the fragments.
    let slot = channel.next_finished_slot().unwrap().unwrap();
    assert_eq!(slot, 1);
    let fragment1 = channel.pop_fragment(slot).unwrap().unwrap();
    assert_eq!(fragment1.files[0].path, Path::new("a.rs"));

    let slot = channel.next_finished_slot().unwrap().unwrap();
    assert_eq!(slot, 2);
    let fragment2 = channel.pop_fragment(slot).unwrap().unwrap();
    assert_eq!(fragment2.files[0].path, Path::new("b.rs"));

    assert!(channel.next_finished_slot().unwrap().is_none());
    assert!(channel.pop_fragment(1).unwrap().is_none());
}

#[test]
fn memory_channel_routes_fragments_per_slot() {
    fragments_and_finish_signals(&MemoryChannel::new(4));
}

#[test]
fn session_db_routes_fragments_per_slot() {
    let dir = scratch_dir("fragments");
    fragments_and_finish_signals(&SessionDb::create(&dir, "run-6").unwrap());
}

fn interrupt_flag_round_trips(channel: &dyn WorkChannel) {
    assert!(!channel.interrupted().unwrap());
    channel.set_interrupted(true).unwrap();
    assert!(channel.interrupted().unwrap());
    channel.set_interrupted(false).unwrap();
    assert!(!channel.interrupted().unwrap());
}

#[test]
fn memory_channel_interrupt_flag() {
    interrupt_flag_round_trips(&MemoryChannel::new(4));
}

#[test]
fn session_db_interrupt_flag() {
    let dir = scratch_dir("interrupt");
    interrupt_flag_round_trips(&SessionDb::create(&dir, "run-7").unwrap());
}

#[test]
fn clear_queue_empties_remaining_work() {
    let channel = MemoryChannel::new(2);
    channel
        .load_commands(vec![command("a.rs"), command("b.rs")])
        .unwrap();
    channel.clear_queue().unwrap();
    assert_eq!(channel.queue_len().unwrap(), 0);
    assert!(channel.pop_command().unwrap().is_none());
}
