//! Command provider tests: at-most-once consumption, interning round-trips,
//! provider combinators.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use symdex::queue::{
    CombinedCommandProvider, CommandProvider, FifoCommandProvider, IndexerCommand,
    InternedCommandProvider, MapCommandProvider,
};

fn command(path: &str) -> IndexerCommand {
    IndexerCommand {
        source_path: PathBuf::from(path),
        language: "rust".to_string(),
        indexed_paths: BTreeSet::from([PathBuf::from("/project/src")]),
        exclude_filters: BTreeSet::from(["target".to_string(), "*.gen.rs".to_string()]),
        include_filters: BTreeSet::new(),
        flags: vec!["--edition".to_string(), "2024".to_string()],
        working_directory: PathBuf::from("/project"),
    }
}

#[test]
fn map_provider_consumes_each_command_once() {
    let provider = MapCommandProvider::new();
    provider.add_command(command("a.rs"));
    provider.add_command(command("b.rs"));
    provider.add_command(command("c.rs"));
    assert_eq!(provider.size(), 3);

    let mut seen = BTreeSet::new();
    while let Some(cmd) = provider.consume_command() {
        assert!(seen.insert(cmd.source_path.clone()), "duplicate consumption");
    }
    assert_eq!(seen.len(), 3);
    assert_eq!(provider.size(), 0);
    assert!(provider.consume_command().is_none());
}

#[test]
fn consume_for_path_pops_exactly_that_command() {
    let provider = MapCommandProvider::new();
    provider.add_command(command("a.rs"));
    provider.add_command(command("b.rs"));

    let cmd = provider.consume_command_for_path(Path::new("b.rs"));
    assert_eq!(cmd.map(|c| c.source_path), Some(PathBuf::from("b.rs")));
    assert!(provider.consume_command_for_path(Path::new("b.rs")).is_none());
    assert_eq!(provider.size(), 1);
}

#[test]
fn interned_provider_round_trips_full_commands() {
    let provider = InternedCommandProvider::new();
    let original = command("src/lib.rs");
    provider.add_command(&original);

    let restored = provider
        .consume_command_for_path(Path::new("src/lib.rs"))
        .expect("command present");
    assert_eq!(restored, original);
    assert_eq!(provider.size(), 0);
}

#[test]
fn interned_provider_at_most_once_under_concurrency() {
    let provider = Arc::new(InternedCommandProvider::new());
    let n = 200;
    for i in 0..n {
        provider.add_command(&command(&format!("src/file_{i}.rs")));
    }

    let mut handles = Vec::new();
    for _ in 0..8 {
        let provider = Arc::clone(&provider);
        handles.push(std::thread::spawn(move || {
            let mut consumed = Vec::new();
            while let Some(cmd) = provider.consume_command() {
                consumed.push(cmd.source_path);
            }
            consumed
        }));
    }

    let mut all: Vec<PathBuf> = Vec::new();
    for handle in handles {
        all.extend(handle.join().unwrap());
    }

    // Exactly n distinct commands across all consumers; the (n+1)-th pop is
    // empty.
    assert_eq!(all.len(), n);
    let distinct: BTreeSet<_> = all.iter().collect();
    assert_eq!(distinct.len(), n);
    assert!(provider.consume_command().is_none());
}

#[test]
fn interned_provider_clear_drops_everything() {
    let provider = InternedCommandProvider::new();
    provider.add_command(&command("a.rs"));
    provider.add_command(&command("b.rs"));
    provider.clear();
    assert_eq!(provider.size(), 0);
    assert!(provider.consume_command().is_none());
}

#[test]
fn fifo_shuffle_preserves_the_command_set() {
    let provider = FifoCommandProvider::new();
    for i in 0..20 {
        provider.add_command(command(&format!("dir/file_{i:02}.rs")));
    }
    let before: BTreeSet<_> = provider.all_source_paths().into_iter().collect();
    provider.shuffle();
    let after: BTreeSet<_> = provider.all_source_paths().into_iter().collect();
    assert_eq!(before, after);
    assert_eq!(provider.size(), 20);
}

#[test]
fn combined_provider_scans_children_in_priority_order() {
    let first = MapCommandProvider::new();
    first.add_command(command("high.rs"));
    let second = MapCommandProvider::new();
    second.add_command(command("low.rs"));

    let mut combined = CombinedCommandProvider::new();
    combined.add_provider(Box::new(first));
    combined.add_provider(Box::new(second));

    assert_eq!(combined.size(), 2);
    let first_out = combined.consume_command().expect("first command");
    assert_eq!(first_out.source_path, PathBuf::from("high.rs"));
    let second_out = combined.consume_command().expect("second command");
    assert_eq!(second_out.source_path, PathBuf::from("low.rs"));
    assert!(combined.consume_command().is_none());
}

#[test]
fn config_fingerprint_ignores_source_path_but_not_flags() {
    let a = command("a.rs");
    let b = command("b.rs");
    assert_eq!(
        a.config_fingerprint().unwrap(),
        b.config_fingerprint().unwrap()
    );

    let mut c = command("a.rs");
    c.flags.push("--cfg=test".to_string());
    assert_ne!(
        a.config_fingerprint().unwrap(),
        c.config_fingerprint().unwrap()
    );
}

#[test]
fn commands_survive_serialization() {
    let original = command("src/main.rs");
    let json = serde_json::to_string(&original).unwrap();
    let restored: IndexerCommand = serde_json::from_str(&json).unwrap();
    assert_eq!(restored, original);
}
