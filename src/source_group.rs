//! Source groups: the language/build-system integrations that know which
//! files exist and how to index them.
//!
//! The engine calls into a group for exactly two things: the current source
//! file set, and indexer commands for a chosen work set. Everything else
//! (scheduling, distribution, persistence) is language-agnostic.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::queue::IndexerCommand;
use crate::utils::fs::should_include_source_file;

pub trait SourceGroup: Send + Sync {
    /// Disabled groups contribute no files and no commands.
    fn enabled(&self) -> bool {
        true
    }
    /// Every source file this group selects right now, absolute paths.
    fn all_source_file_paths(&self) -> Vec<PathBuf>;
    /// Commands for the files of this group inside `files_to_index`.
    fn indexer_commands(&self, files_to_index: &BTreeSet<PathBuf>) -> Vec<IndexerCommand>;
}

/// A directory tree of source files filtered by extension and exclude globs,
/// all indexed with one shared configuration. The common case, and the case
/// the interned command provider exists for: thousands of files, one
/// configuration.
pub struct FileSetSourceGroup {
    root: PathBuf,
    language: String,
    extensions: Vec<String>,
    exclude: Vec<String>,
    flags: Vec<String>,
    enabled: bool,
}

impl FileSetSourceGroup {
    pub fn new(
        root: impl Into<PathBuf>,
        language: impl Into<String>,
        extensions: Vec<String>,
        exclude: Vec<String>,
        flags: Vec<String>,
    ) -> Self {
        Self {
            root: root.into(),
            language: language.into(),
            extensions,
            exclude,
            flags,
            enabled: true,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn command_for(&self, path: &Path) -> IndexerCommand {
        IndexerCommand {
            source_path: path.to_path_buf(),
            language: self.language.clone(),
            indexed_paths: BTreeSet::from([self.root.clone()]),
            exclude_filters: self.exclude.iter().cloned().collect(),
            include_filters: BTreeSet::new(),
            flags: self.flags.clone(),
            working_directory: self.root.clone(),
        }
    }
}

impl SourceGroup for FileSetSourceGroup {
    fn enabled(&self) -> bool {
        self.enabled
    }

    fn all_source_file_paths(&self) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for entry in WalkDir::new(&self.root).into_iter() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("cannot access path during scan: {err}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.into_path();
            if should_include_source_file(&path, &self.extensions, &self.exclude) {
                paths.push(path);
            }
        }
        paths.sort();
        paths
    }

    fn indexer_commands(&self, files_to_index: &BTreeSet<PathBuf>) -> Vec<IndexerCommand> {
        self.all_source_file_paths()
            .into_iter()
            .filter(|p| files_to_index.contains(p))
            .map(|p| self.command_for(&p))
            .collect()
    }
}
