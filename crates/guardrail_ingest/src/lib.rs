//! Ingestion pipeline.
//!
//! Walks configured source directories for `.md` and `.json` rule
//! documents, parses them into canonical rule records, and syncs the
//! active rule set: upsert by `code` inside one transaction per run,
//! version bump on material change, soft-disable for codes that vanished
//! from their source.

pub mod json;
pub mod markdown;
pub mod sync;

pub use json::parse_json_rules;
pub use markdown::{parse_markdown_rules, slug_for_path, title_for_document};
pub use sync::{run_sync, SyncOptions, SyncReport};

use thiserror::Error;

/// Parse errors for a rule document.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{file}:{line}: {message}")]
    Section {
        file: String,
        line: usize,
        message: String,
    },

    #[error("{file}: {message}")]
    Document { file: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ParseError {
    pub fn section(file: &str, line: usize, message: impl Into<String>) -> Self {
        Self::Section {
            file: file.to_string(),
            line,
            message: message.into(),
        }
    }

    pub fn document(file: &str, message: impl Into<String>) -> Self {
        Self::Document {
            file: file.to_string(),
            message: message.into(),
        }
    }
}
