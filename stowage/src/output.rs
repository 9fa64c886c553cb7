//! Output formatting for CLI commands.
//!
//! Provides abstraction layer for outputting results in text or JSON format.

use anyhow::Result;
use serde::Serialize;
use std::io::{self, Write};
use stowage_core::Entry;

/// Output format selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

/// Writer for command output with format abstraction.
pub struct OutputWriter {
    format: OutputFormat,
    stdout: io::Stdout,
}

impl OutputWriter {
    /// Create a new OutputWriter.
    pub fn new(json: bool) -> Self {
        Self {
            format: if json {
                OutputFormat::Json
            } else {
                OutputFormat::Text
            },
            stdout: io::stdout(),
        }
    }

    /// Check if JSON mode is enabled.
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    /// Write output using the configured format.
    ///
    /// The `data` parameter must be a serializable struct that includes
    /// `success: bool` and `result_code: u8` fields.
    ///
    /// The `text_fn` closure is called only in text mode to generate the
    /// human-readable output.
    pub fn write<T: Serialize>(&self, data: &T, text_fn: impl FnOnce() -> String) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(data)?;
                writeln!(&self.stdout, "{}", json)?;
            }
            OutputFormat::Text => {
                let text = text_fn();
                if !text.is_empty() {
                    write!(&self.stdout, "{}", text)?;
                }
            }
        }
        Ok(())
    }

    /// Write an error message to stderr.
    ///
    /// In JSON mode, writes a JSON error object with success=false.
    /// In text mode, writes the error message directly.
    pub fn write_error(&self, error: &anyhow::Error, result_code: u8) {
        match self.format {
            OutputFormat::Json => {
                let error_output = ErrorOutput {
                    success: false,
                    result_code,
                    error: error.to_string(),
                };
                if let Ok(json) = serde_json::to_string_pretty(&error_output) {
                    let _ = writeln!(io::stderr(), "{}", json);
                }
            }
            OutputFormat::Text => {
                let _ = writeln!(io::stderr(), "Error: {}", error);
            }
        }
    }
}

// ============================================================================
// Data Transfer Objects (DTOs) for JSON output
// ============================================================================

/// Error output structure.
#[derive(Debug, Serialize)]
pub struct ErrorOutput {
    pub success: bool,
    pub result_code: u8,
    pub error: String,
}

/// Output for `index` command.
#[derive(Debug, Serialize)]
pub struct IndexOutput {
    pub success: bool,
    pub result_code: u8,
    pub path: String,
    pub files: u64,
    pub directories: u64,
    pub total_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
    pub per_file_records: u64,
}

/// Output for `dedup` command.
#[derive(Debug, Serialize)]
pub struct DedupOutput {
    pub success: bool,
    pub result_code: u8,
    pub dry_run: bool,
    pub files_scanned: u64,
    pub unique_files: u64,
    pub duplicates_found: u64,
    pub duplicates_merged: u64,
    pub bytes_reclaimed: u64,
    pub deleted: u64,
    pub sidecars_deleted: u64,
    pub delete_failures: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<String>,
}

/// One rename performed by the `rename` command.
#[derive(Debug, Clone, Serialize)]
pub struct RenamedItem {
    pub from: String,
    pub to: String,
}

/// Output for `rename` command.
#[derive(Debug, Serialize)]
pub struct RenameOutput {
    pub success: bool,
    pub result_code: u8,
    pub dry_run: bool,
    pub renamed: u64,
    pub collisions: u64,
    pub sidecars_renamed: u64,
    pub items: Vec<RenamedItem>,
}

/// Output for `rollback` command.
#[derive(Debug, Serialize)]
pub struct RollbackOutput {
    pub success: bool,
    pub result_code: u8,
    pub dry_run: bool,
    pub restored: u64,
    pub duplicates_restored: u64,
    pub sidecars_restored: u64,
    pub dirs_created: u64,
    pub skipped: u64,
    pub failed: u64,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Entry summary for `inspect`.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySummary {
    pub kind: String,
    pub relative: String,
    pub storage_name: String,
    pub size_bytes: u64,
    pub duplicate_of: Option<String>,
}

impl EntrySummary {
    pub fn from_entry(entry: &Entry, duplicate_of: Option<&str>) -> Self {
        Self {
            kind: if entry.is_file() { "file" } else { "directory" }.to_string(),
            relative: entry.location.relative.clone(),
            storage_name: entry.storage_name().to_string(),
            size_bytes: entry.size.bytes,
            duplicate_of: duplicate_of.map(|s| s.to_string()),
        }
    }
}

/// Output for `inspect` command.
#[derive(Debug, Serialize)]
pub struct InspectOutput {
    pub success: bool,
    pub result_code: u8,
    pub path: String,
    pub schema_version: u32,
    pub sessions: usize,
    pub entries: Vec<EntrySummary>,
}
