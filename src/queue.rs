//! Indexer commands and consumable command providers.
//!
//! A command identifies one source file plus its indexing configuration and
//! must be cheap to ship across a process boundary. Providers are thread-safe
//! collections that hand each command to exactly one consumer per run.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// One unit of indexing work: a source file and the configuration its
/// frontend needs. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexerCommand {
    pub source_path: PathBuf,
    pub language: String,
    pub indexed_paths: BTreeSet<PathBuf>,
    pub exclude_filters: BTreeSet<String>,
    pub include_filters: BTreeSet<String>,
    pub flags: Vec<String>,
    pub working_directory: PathBuf,
}

impl IndexerCommand {
    /// Stable fingerprint of the configuration (everything but the source
    /// path). Two commands with equal fingerprints would index a file
    /// identically; a changed fingerprint invalidates prior results.
    pub fn config_fingerprint(&self) -> Result<String> {
        #[derive(Serialize)]
        struct Config<'a> {
            language: &'a str,
            indexed_paths: &'a BTreeSet<PathBuf>,
            exclude_filters: &'a BTreeSet<String>,
            include_filters: &'a BTreeSet<String>,
            flags: &'a [String],
            working_directory: &'a Path,
        }
        let canonical = serde_json::to_vec(&Config {
            language: &self.language,
            indexed_paths: &self.indexed_paths,
            exclude_filters: &self.exclude_filters,
            include_filters: &self.include_filters,
            flags: &self.flags,
            working_directory: &self.working_directory,
        })
        .context("serialize command configuration")?;
        Ok(blake3::hash(&canonical).to_hex().to_string())
    }
}

/// Consumable, thread-safe collection of commands. Each command is delivered
/// to at most one consumer per run; consumption order is unspecified beyond
/// "not yet consumed".
pub trait CommandProvider: Send + Sync {
    /// Pop and remove an arbitrary command.
    fn consume_command(&self) -> Option<IndexerCommand>;
    /// Pop and remove the command for an exact source path, if present.
    /// Used for single-file rebuilds.
    fn consume_command_for_path(&self, path: &Path) -> Option<IndexerCommand>;
    /// Drain everything.
    fn consume_all(&self) -> Vec<IndexerCommand>;
    fn size(&self) -> usize;
    fn clear(&self);
    /// Source paths of all not-yet-consumed commands.
    fn all_source_paths(&self) -> Vec<PathBuf>;

    fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

/// Provider backed by a map keyed by source path.
#[derive(Default)]
pub struct MapCommandProvider {
    commands: Mutex<BTreeMap<PathBuf, IndexerCommand>>,
}

impl MapCommandProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_command(&self, command: IndexerCommand) {
        let mut commands = self.commands.lock().expect("command map lock poisoned");
        commands.insert(command.source_path.clone(), command);
    }
}

impl CommandProvider for MapCommandProvider {
    fn consume_command(&self) -> Option<IndexerCommand> {
        let mut commands = self.commands.lock().expect("command map lock poisoned");
        let path = commands.keys().next().cloned()?;
        commands.remove(&path)
    }

    fn consume_command_for_path(&self, path: &Path) -> Option<IndexerCommand> {
        let mut commands = self.commands.lock().expect("command map lock poisoned");
        commands.remove(path)
    }

    fn consume_all(&self) -> Vec<IndexerCommand> {
        let mut commands = self.commands.lock().expect("command map lock poisoned");
        std::mem::take(&mut *commands).into_values().collect()
    }

    fn size(&self) -> usize {
        self.commands.lock().expect("command map lock poisoned").len()
    }

    fn clear(&self) {
        self.commands.lock().expect("command map lock poisoned").clear();
    }

    fn all_source_paths(&self) -> Vec<PathBuf> {
        self.commands
            .lock()
            .expect("command map lock poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

/// FIFO provider with a deterministic shuffle so adjacent heavy files from
/// one directory spread across workers.
#[derive(Default)]
pub struct FifoCommandProvider {
    commands: Mutex<VecDeque<IndexerCommand>>,
}

impl FifoCommandProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_command(&self, command: IndexerCommand) {
        self.commands
            .lock()
            .expect("command fifo lock poisoned")
            .push_back(command);
    }

    /// Reorder by path hash. Deterministic for a given file set, but
    /// uncorrelated with directory order, which is what load balancing needs.
    pub fn shuffle(&self) {
        let mut commands = self.commands.lock().expect("command fifo lock poisoned");
        let mut v: Vec<IndexerCommand> = std::mem::take(&mut *commands).into();
        v.sort_by_key(|c| {
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            c.source_path.hash(&mut hasher);
            hasher.finish()
        });
        *commands = v.into();
    }
}

impl CommandProvider for FifoCommandProvider {
    fn consume_command(&self) -> Option<IndexerCommand> {
        self.commands
            .lock()
            .expect("command fifo lock poisoned")
            .pop_front()
    }

    fn consume_command_for_path(&self, path: &Path) -> Option<IndexerCommand> {
        let mut commands = self.commands.lock().expect("command fifo lock poisoned");
        let pos = commands.iter().position(|c| c.source_path == path)?;
        commands.remove(pos)
    }

    fn consume_all(&self) -> Vec<IndexerCommand> {
        let mut commands = self.commands.lock().expect("command fifo lock poisoned");
        std::mem::take(&mut *commands).into()
    }

    fn size(&self) -> usize {
        self.commands.lock().expect("command fifo lock poisoned").len()
    }

    fn clear(&self) {
        self.commands
            .lock()
            .expect("command fifo lock poisoned")
            .clear();
    }

    fn all_source_paths(&self) -> Vec<PathBuf> {
        self.commands
            .lock()
            .expect("command fifo lock poisoned")
            .iter()
            .map(|c| c.source_path.clone())
            .collect()
    }
}

/// Combinator scanning child providers in priority order.
#[derive(Default)]
pub struct CombinedCommandProvider {
    providers: Vec<Box<dyn CommandProvider>>,
}

impl CombinedCommandProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_provider(&mut self, provider: Box<dyn CommandProvider>) {
        self.providers.push(provider);
    }
}

impl CommandProvider for CombinedCommandProvider {
    fn consume_command(&self) -> Option<IndexerCommand> {
        self.providers.iter().find_map(|p| p.consume_command())
    }

    fn consume_command_for_path(&self, path: &Path) -> Option<IndexerCommand> {
        self.providers
            .iter()
            .find_map(|p| p.consume_command_for_path(path))
    }

    fn consume_all(&self) -> Vec<IndexerCommand> {
        self.providers.iter().flat_map(|p| p.consume_all()).collect()
    }

    fn size(&self) -> usize {
        self.providers.iter().map(|p| p.size()).sum()
    }

    fn clear(&self) {
        for p in &self.providers {
            p.clear();
        }
    }

    fn all_source_paths(&self) -> Vec<PathBuf> {
        self.providers
            .iter()
            .flat_map(|p| p.all_source_paths())
            .collect()
    }
}

/// String interner: values become small ids, ids resolve back to values.
#[derive(Default)]
struct Interner {
    to_id: HashMap<String, u32>,
    values: Vec<String>,
}

impl Interner {
    fn intern(&mut self, value: &str) -> u32 {
        if let Some(&id) = self.to_id.get(value) {
            return id;
        }
        let id = self.values.len() as u32;
        self.values.push(value.to_string());
        self.to_id.insert(value.to_string(), id);
        id
    }

    fn resolve(&self, id: u32) -> &str {
        &self.values[id as usize]
    }

    fn len(&self) -> usize {
        self.values.len()
    }
}

/// Compressed form of one command: id-sets into the shared interners.
struct CommandShape {
    language_id: u32,
    indexed_path_ids: Vec<u32>,
    exclude_filter_ids: Vec<u32>,
    include_filter_ids: Vec<u32>,
    flag_ids: Vec<u32>,
    working_directory_id: u32,
}

#[derive(Default)]
struct InternedInner {
    paths: Interner,
    filters: Interner,
    flags: Interner,
    directories: Interner,
    languages: Interner,
    commands: BTreeMap<PathBuf, CommandShape>,
}

/// Provider for large fleets of commands sharing identical search-path and
/// flag lists. Repeated substructure is interned once; per-command storage is
/// id-sets, and the full command is reconstructed lazily on consumption.
/// Memory is O(unique configuration) + O(files) instead of
/// O(files x configuration size).
#[derive(Default)]
pub struct InternedCommandProvider {
    inner: Mutex<InternedInner>,
}

impl InternedCommandProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_command(&self, command: &IndexerCommand) {
        let mut inner = self.inner.lock().expect("interned provider lock poisoned");
        let shape = CommandShape {
            language_id: inner.languages.intern(&command.language),
            indexed_path_ids: command
                .indexed_paths
                .iter()
                .map(|p| inner.paths.intern(&p.to_string_lossy()))
                .collect(),
            exclude_filter_ids: command
                .exclude_filters
                .iter()
                .map(|f| inner.filters.intern(f))
                .collect(),
            include_filter_ids: command
                .include_filters
                .iter()
                .map(|f| inner.filters.intern(f))
                .collect(),
            flag_ids: command
                .flags
                .iter()
                .map(|f| inner.flags.intern(f))
                .collect(),
            working_directory_id: inner
                .directories
                .intern(&command.working_directory.to_string_lossy()),
        };
        inner.commands.insert(command.source_path.clone(), shape);
    }

    pub fn log_stats(&self) {
        let inner = self.inner.lock().expect("interned provider lock poisoned");
        log::debug!(
            "interned provider: {} commands, {} paths, {} filters, {} flags, {} working dirs, {} languages",
            inner.commands.len(),
            inner.paths.len(),
            inner.filters.len(),
            inner.flags.len(),
            inner.directories.len(),
            inner.languages.len()
        );
    }

    fn shape_to_command(inner: &InternedInner, path: &Path, shape: &CommandShape) -> IndexerCommand {
        IndexerCommand {
            source_path: path.to_path_buf(),
            language: inner.languages.resolve(shape.language_id).to_string(),
            indexed_paths: shape
                .indexed_path_ids
                .iter()
                .map(|&id| PathBuf::from(inner.paths.resolve(id)))
                .collect(),
            exclude_filters: shape
                .exclude_filter_ids
                .iter()
                .map(|&id| inner.filters.resolve(id).to_string())
                .collect(),
            include_filters: shape
                .include_filter_ids
                .iter()
                .map(|&id| inner.filters.resolve(id).to_string())
                .collect(),
            flags: shape
                .flag_ids
                .iter()
                .map(|&id| inner.flags.resolve(id).to_string())
                .collect(),
            working_directory: PathBuf::from(inner.directories.resolve(shape.working_directory_id)),
        }
    }
}

impl CommandProvider for InternedCommandProvider {
    fn consume_command(&self) -> Option<IndexerCommand> {
        let mut inner = self.inner.lock().expect("interned provider lock poisoned");
        let path = inner.commands.keys().next().cloned()?;
        let shape = inner.commands.remove(&path)?;
        Some(Self::shape_to_command(&inner, &path, &shape))
    }

    fn consume_command_for_path(&self, path: &Path) -> Option<IndexerCommand> {
        let mut inner = self.inner.lock().expect("interned provider lock poisoned");
        let shape = inner.commands.remove(path)?;
        Some(Self::shape_to_command(&inner, path, &shape))
    }

    fn consume_all(&self) -> Vec<IndexerCommand> {
        let mut inner = self.inner.lock().expect("interned provider lock poisoned");
        let commands = std::mem::take(&mut inner.commands);
        commands
            .iter()
            .map(|(path, shape)| Self::shape_to_command(&inner, path, shape))
            .collect()
    }

    fn size(&self) -> usize {
        self.inner
            .lock()
            .expect("interned provider lock poisoned")
            .commands
            .len()
    }

    fn clear(&self) {
        self.inner
            .lock()
            .expect("interned provider lock poisoned")
            .commands
            .clear();
    }

    fn all_source_paths(&self) -> Vec<PathBuf> {
        self.inner
            .lock()
            .expect("interned provider lock poisoned")
            .commands
            .keys()
            .cloned()
            .collect()
    }
}
