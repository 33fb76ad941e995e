//! The parsing-frontend seam.
//!
//! Real language frontends live outside this engine; the contract is one
//! call: turn a command into a graph fragment. [`TokenIndexer`] is the
//! built-in frontend, a naive identifier scanner with no name resolution,
//! so the engine runs end-to-end and tests have something deterministic to
//! index.

use std::path::Path;

use crate::Result;
use crate::queue::IndexerCommand;
use crate::storage::fragment::{
    FileRecord, GraphFragment, IndexError, ReferenceRecord, SymbolKind, SymbolRecord,
};
use crate::utils::fs::fingerprint_file;

/// Turns one command into one fragment.
///
/// A per-file problem (unreadable file, malformed content) is NOT an `Err`:
/// it is recorded in the fragment as a structured error and the file is
/// flagged incomplete, so the updated-and-incomplete refresh mode retries it.
/// `Err` is reserved for infrastructure failures that should take the worker
/// down.
pub trait FileIndexer: Send + Sync {
    fn index_file(&self, command: &IndexerCommand) -> Result<GraphFragment>;
}

/// Keywords that mark the next identifier as a definition. Deliberately
/// coarse and language-agnostic.
const DEFINITION_KEYWORDS: &[(&str, SymbolKind)] = &[
    ("fn", SymbolKind::Function),
    ("func", SymbolKind::Function),
    ("def", SymbolKind::Function),
    ("function", SymbolKind::Function),
    ("struct", SymbolKind::Type),
    ("enum", SymbolKind::Type),
    ("trait", SymbolKind::Type),
    ("class", SymbolKind::Type),
    ("interface", SymbolKind::Type),
    ("type", SymbolKind::Type),
    ("mod", SymbolKind::Module),
    ("module", SymbolKind::Module),
    ("let", SymbolKind::Variable),
    ("const", SymbolKind::Variable),
    ("static", SymbolKind::Variable),
    ("var", SymbolKind::Variable),
];

#[derive(Default)]
pub struct TokenIndexer;

impl TokenIndexer {
    pub fn new() -> Self {
        Self
    }

    fn excluded(command: &IndexerCommand, path: &Path) -> bool {
        let path_str = path.to_string_lossy();
        command
            .exclude_filters
            .iter()
            .any(|f| crate::utils::fs::glob_match(f, &path_str))
    }
}

impl FileIndexer for TokenIndexer {
    fn index_file(&self, command: &IndexerCommand) -> Result<GraphFragment> {
        let path = &command.source_path;
        let mut fragment = GraphFragment::new();

        let fingerprint = fingerprint_file(path).unwrap_or_default();

        if Self::excluded(command, path) {
            fragment.record_file(FileRecord {
                path: path.clone(),
                fingerprint,
                language: command.language.clone(),
                indexed: false,
                complete: true,
            });
            return Ok(fragment);
        }

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                fragment.record_file(FileRecord {
                    path: path.clone(),
                    fingerprint,
                    language: command.language.clone(),
                    indexed: true,
                    complete: false,
                });
                fragment.record_error(IndexError {
                    file: path.clone(),
                    message: format!("could not read source file: {err}"),
                    fatal: true,
                    line: 1,
                    column: 1,
                });
                return Ok(fragment);
            }
        };

        for (line_idx, line) in content.lines().enumerate() {
            let line_no = line_idx as u32 + 1;
            let mut pending_kind: Option<SymbolKind> = None;
            for (token, column) in tokenize(line) {
                if let Some(&(_, kind)) = DEFINITION_KEYWORDS.iter().find(|(kw, _)| *kw == token) {
                    pending_kind = Some(kind);
                    continue;
                }
                if let Some(kind) = pending_kind.take() {
                    fragment.record_symbol(SymbolRecord {
                        name: token.to_string(),
                        kind,
                        file: path.clone(),
                        line: line_no,
                        column,
                    });
                } else {
                    fragment.record_reference(ReferenceRecord {
                        symbol: token.to_string(),
                        file: path.clone(),
                        line: line_no,
                        column,
                    });
                }
            }
        }

        fragment.record_file(FileRecord {
            path: path.clone(),
            fingerprint,
            language: command.language.clone(),
            indexed: true,
            complete: true,
        });
        Ok(fragment)
    }
}

/// Identifier tokens in a line with their 1-based column.
fn tokenize(line: &str) -> impl Iterator<Item = (&str, u32)> {
    let mut tokens = Vec::new();
    let mut start: Option<usize> = None;
    for (i, c) in line.char_indices() {
        if c.is_alphanumeric() || c == '_' {
            if start.is_none() {
                start = Some(i);
            }
        } else if let Some(s) = start.take() {
            push_token(&mut tokens, line, s, i);
        }
    }
    if let Some(s) = start {
        push_token(&mut tokens, line, s, line.len());
    }
    tokens.into_iter()
}

fn push_token<'a>(tokens: &mut Vec<(&'a str, u32)>, line: &'a str, start: usize, end: usize) {
    let token = &line[start..end];
    // Identifiers only: skip bare numbers.
    if token.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        return;
    }
    tokens.push((token, start as u32 + 1));
}
