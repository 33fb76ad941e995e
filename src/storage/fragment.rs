//! Graph fragments: the intermediate result of indexing one source file.
//!
//! A fragment is append-only while the worker owns it, travels the result
//! channel as serialized JSON, and is merged into the durable store by the
//! coordinator. Merging is order-independent: fragments from different files
//! touch disjoint rows, and each file appears in exactly one fragment per run.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Change-detection summary for one file: mtime (ns since epoch) + size, with
/// an optional blake3 content hash for content-aware comparison.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub mtime_ns: i64,
    pub size: u64,
    pub content_hash: Option<[u8; 32]>,
}

impl Fingerprint {
    /// True if `self` (current disk state) differs from `old` (stored state).
    /// When both sides carry a content hash, content wins: a touched file
    /// with identical bytes counts as unchanged.
    pub fn differs_from(&self, old: &Fingerprint) -> bool {
        if let (Some(new_hash), Some(old_hash)) = (&self.content_hash, &old.content_hash) {
            return new_hash != old_hash || self.size != old.size;
        }
        self.mtime_ns != old.mtime_ns || self.size != old.size
    }
}

/// Per-file record carried by a fragment. `complete` is false when indexing
/// hit a fatal per-file error; such files are re-selected by the
/// updated-and-incomplete refresh mode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    pub language: String,
    pub indexed: bool,
    pub complete: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolKind {
    Module,
    Function,
    Type,
    Variable,
    Unknown,
}

impl SymbolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SymbolKind::Module => "module",
            SymbolKind::Function => "function",
            SymbolKind::Type => "type",
            SymbolKind::Variable => "variable",
            SymbolKind::Unknown => "unknown",
        }
    }

    pub fn from_str(s: &str) -> SymbolKind {
        match s {
            "module" => SymbolKind::Module,
            "function" => SymbolKind::Function,
            "type" => SymbolKind::Type,
            "variable" => SymbolKind::Variable,
            _ => SymbolKind::Unknown,
        }
    }
}

/// A symbol definition found in one file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolRecord {
    pub name: String,
    pub kind: SymbolKind,
    pub file: PathBuf,
    pub line: u32,
    pub column: u32,
}

/// A reference to a named symbol at a location.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRecord {
    pub symbol: String,
    pub file: PathBuf,
    pub line: u32,
    pub column: u32,
}

/// A structured indexing error attached to a file. Fatal errors flag the file
/// incomplete; non-fatal ones are informational.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexError {
    pub file: PathBuf,
    pub message: String,
    pub fatal: bool,
    pub line: u32,
    pub column: u32,
}

/// Output of indexing exactly one command.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphFragment {
    pub files: Vec<FileRecord>,
    pub symbols: Vec<SymbolRecord>,
    pub references: Vec<ReferenceRecord>,
    pub errors: Vec<IndexError>,
}

impl GraphFragment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_file(&mut self, record: FileRecord) {
        self.files.push(record);
    }

    pub fn record_symbol(&mut self, symbol: SymbolRecord) {
        self.symbols.push(symbol);
    }

    pub fn record_reference(&mut self, reference: ReferenceRecord) {
        self.references.push(reference);
    }

    pub fn record_error(&mut self, error: IndexError) {
        self.errors.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
            && self.symbols.is_empty()
            && self.references.is_empty()
            && self.errors.is_empty()
    }

    /// Count of fatal errors in this fragment.
    pub fn fatal_error_count(&self) -> usize {
        self.errors.iter().filter(|e| e.fatal).count()
    }
}
