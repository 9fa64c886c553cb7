mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use output::{
    DedupOutput, EntrySummary, IndexOutput, InspectOutput, OutputWriter, RenameOutput,
    RenamedItem, RollbackOutput,
};
use std::path::{Path, PathBuf};
use stowage_core::rollback::{self, LocalResolver, PlanOptions, TargetMode};
use stowage_core::{
    Algorithm, BuildOptions, CancelFlag, DedupRegistry, Entry, SCHEMA_VERSION, build_path, dedup,
    rename, write_sidecar_records,
};

/// Stowage - content-addressed file indexing with dedup and rollback
#[derive(Parser)]
#[command(name = "stowage")]
#[command(about = "Index, deduplicate, rename and roll back content-addressed files", long_about = None)]
#[command(version)]
struct Cli {
    /// Emit machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a file or directory into entry records
    Index {
        /// Path to index
        path: PathBuf,

        /// Write the aggregate tree record to this file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also write one record per file, beside the file it describes
        #[arg(long)]
        per_file: bool,

        /// Extra digest algorithm beyond the mandatory set
        #[arg(long, default_value = "none")]
        extra_algo: String,

        /// Algorithm identities derive from
        #[arg(long, default_value = "md5")]
        identity: String,
    },

    /// Fold byte-identical files into canonical entries
    Dedup {
        /// Path to scan
        path: PathBuf,

        /// Delete the folded duplicate files from disk
        #[arg(long)]
        delete: bool,

        /// Plan and report without touching the filesystem
        #[arg(long)]
        dry_run: bool,

        /// Write the merged tree record to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Rename indexed files to their storage names
    Rename {
        /// Path holding the files to rename
        path: PathBuf,

        /// Report the renames without performing them
        #[arg(long)]
        dry_run: bool,
    },

    /// Restore original names, layout and timestamps from records
    Rollback {
        /// A record file or a directory of record files
        records: PathBuf,

        /// Directory holding the stored content files
        #[arg(short, long)]
        search_dir: PathBuf,

        /// Directory the restored layout is created under
        #[arg(short, long)]
        target: PathBuf,

        /// Restore everything directly under the target, skipping name
        /// collisions
        #[arg(long)]
        flat: bool,

        /// Overwrite conflicting targets instead of skipping them
        #[arg(long)]
        overwrite: bool,

        /// Skip hash verification of existing targets
        #[arg(long)]
        no_verify: bool,

        /// Do not restore entries folded as duplicates
        #[arg(long)]
        skip_duplicates: bool,

        /// Descend into subdirectories when loading a record directory
        #[arg(short, long)]
        recursive: bool,

        /// Plan and report without touching the filesystem
        #[arg(long)]
        dry_run: bool,
    },

    /// Show what a record file contains
    Inspect {
        /// A record file or a directory of record files
        records: PathBuf,

        /// Descend into subdirectories
        #[arg(short, long)]
        recursive: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    let writer = OutputWriter::new(cli.json);
    let cancel = CancelFlag::new();

    let result = match cli.command {
        Commands::Index {
            path,
            output,
            per_file,
            extra_algo,
            identity,
        } => cmd_index(&writer, &cancel, &path, output, per_file, &extra_algo, &identity),
        Commands::Dedup {
            path,
            delete,
            dry_run,
            output,
        } => cmd_dedup(&writer, &cancel, &path, delete, dry_run, output),
        Commands::Rename { path, dry_run } => cmd_rename(&writer, &cancel, &path, dry_run),
        Commands::Rollback {
            records,
            search_dir,
            target,
            flat,
            overwrite,
            no_verify,
            skip_duplicates,
            recursive,
            dry_run,
        } => cmd_rollback(
            &writer,
            &cancel,
            &records,
            &search_dir,
            &target,
            PlanOptions {
                mode: if flat {
                    TargetMode::Flat
                } else {
                    TargetMode::Structured
                },
                verify: !no_verify,
                overwrite,
                include_duplicates: !skip_duplicates,
            },
            recursive,
            dry_run,
        ),
        Commands::Inspect { records, recursive } => cmd_inspect(&writer, &records, recursive),
    };

    if let Err(e) = result {
        writer.write_error(&e, 1);
        std::process::exit(1);
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
}

/// Build options from the CLI algorithm flags. The mandatory algorithms are
/// always restored by normalization.
fn build_options(extra_algo: &str, identity: &str) -> Result<BuildOptions> {
    let identity = Algorithm::parse(identity)
        .with_context(|| format!("Invalid identity algorithm: {}", identity))?;

    let mut algorithms = Vec::new();
    if extra_algo != "none" {
        algorithms.push(
            Algorithm::parse(extra_algo)
                .with_context(|| format!("Invalid algorithm: {}", extra_algo))?,
        );
    }

    Ok(BuildOptions {
        algorithms,
        identity,
        absorb_sidecars: true,
    }
    .normalized())
}

/// The directory file entries' relative paths resolve against.
fn base_dir(path: &Path) -> PathBuf {
    if path.is_dir() {
        path.to_path_buf()
    } else {
        path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf()
    }
}

fn count_entries(node: &Entry, files: &mut u64, directories: &mut u64) {
    if node.is_file() {
        *files += 1;
    } else {
        *directories += 1;
    }
    if let Some(children) = &node.children {
        for child in children {
            count_entries(child, files, directories);
        }
    }
}

fn write_record_file(tree: &Entry, path: &Path) -> Result<()> {
    let json = serde_json::to_string_pretty(tree)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write record to {}", path.display()))?;
    Ok(())
}

fn cmd_index(
    writer: &OutputWriter,
    cancel: &CancelFlag,
    path: &Path,
    output: Option<PathBuf>,
    per_file: bool,
    extra_algo: &str,
    identity: &str,
) -> Result<()> {
    let options = build_options(extra_algo, identity)?;
    let tree = build_path(path, &options, cancel, None)
        .with_context(|| format!("Failed to index {}", path.display()))?;

    if let Some(record_path) = &output {
        write_record_file(&tree, record_path)?;
    }

    let per_file_records = if per_file {
        write_sidecar_records(&tree, &base_dir(path), false)
            .with_context(|| "Failed to write per-file records")?
    } else {
        0
    };

    let mut files = 0;
    let mut directories = 0;
    count_entries(&tree, &mut files, &mut directories);
    tracing::debug!(files, directories, "index pass complete");

    let data = IndexOutput {
        success: true,
        result_code: 0,
        path: path.display().to_string(),
        files,
        directories,
        total_bytes: tree.size.bytes,
        record: output.as_ref().map(|p| p.display().to_string()),
        per_file_records,
    };

    writer.write(&data, || {
        let mut text = format!(
            "Indexed {}: {} files, {} directories, {}\n",
            path.display(),
            files,
            directories,
            tree.size.display
        );
        if let Some(record) = &output {
            text.push_str(&format!("Record written to {}\n", record.display()));
        }
        if per_file {
            text.push_str(&format!("{} per-file records written\n", per_file_records));
        }
        text
    })
}

fn cmd_dedup(
    writer: &OutputWriter,
    cancel: &CancelFlag,
    path: &Path,
    delete: bool,
    dry_run: bool,
    output: Option<PathBuf>,
) -> Result<()> {
    let options = BuildOptions::default();
    let mut tree = build_path(path, &options, cancel, None)
        .with_context(|| format!("Failed to index {}", path.display()))?;

    let mut registry = DedupRegistry::new();
    let (actions, stats) = dedup::scan(&tree, &mut registry, cancel, None)
        .with_context(|| "Duplicate scan failed")?;

    let merged = if dry_run {
        0
    } else {
        let merged = dedup::apply(&mut tree, &actions);
        tree.recompute_size();
        merged
    };

    let delete_stats = if delete {
        dedup::delete_duplicate_files(&actions, &base_dir(path), dry_run)
    } else {
        Default::default()
    };

    if let Some(record_path) = &output {
        if !dry_run {
            write_record_file(&tree, record_path)?;
        }
    }

    let data = DedupOutput {
        success: true,
        result_code: 0,
        dry_run,
        files_scanned: stats.files_scanned,
        unique_files: stats.unique_files,
        duplicates_found: stats.duplicates_found,
        duplicates_merged: merged as u64,
        bytes_reclaimed: stats.bytes_reclaimed,
        deleted: delete_stats.deleted,
        sidecars_deleted: delete_stats.sidecars_deleted,
        delete_failures: delete_stats.failed,
        record: output
            .as_ref()
            .filter(|_| !dry_run)
            .map(|p| p.display().to_string()),
    };

    writer.write(&data, || {
        let mut text = format!(
            "Scanned {} files: {} unique, {} duplicates ({} bytes reclaimable)\n",
            stats.files_scanned, stats.unique_files, stats.duplicates_found, stats.bytes_reclaimed
        );
        if dry_run {
            text.push_str("Dry run - nothing merged or deleted\n");
        } else {
            text.push_str(&format!("Merged {} duplicates\n", merged));
        }
        if delete {
            text.push_str(&format!(
                "Deleted {} files, {} sidecars ({} failures)\n",
                delete_stats.deleted, delete_stats.sidecars_deleted, delete_stats.failed
            ));
        }
        text
    })
}

fn cmd_rename(
    writer: &OutputWriter,
    cancel: &CancelFlag,
    path: &Path,
    dry_run: bool,
) -> Result<()> {
    let options = BuildOptions::default();
    let tree = build_path(path, &options, cancel, None)
        .with_context(|| format!("Failed to index {}", path.display()))?;

    let base = base_dir(path);
    let mut renamed = 0u64;
    let mut collisions = 0u64;
    let mut sidecars_renamed = 0u64;
    let mut items = Vec::new();
    rename_files(
        &tree,
        &base,
        dry_run,
        cancel,
        &mut renamed,
        &mut collisions,
        &mut sidecars_renamed,
        &mut items,
    )?;

    let data = RenameOutput {
        success: true,
        result_code: 0,
        dry_run,
        renamed,
        collisions,
        sidecars_renamed,
        items: items.clone(),
    };

    writer.write(&data, || {
        let mut text = String::new();
        for item in &items {
            text.push_str(&format!("{} -> {}\n", item.from, item.to));
        }
        text.push_str(&format!(
            "{}{} renamed, {} collisions, {} sidecars\n",
            if dry_run { "Dry run - would be " } else { "" },
            renamed,
            collisions,
            sidecars_renamed
        ));
        text
    })
}

#[allow(clippy::too_many_arguments)]
fn rename_files(
    node: &Entry,
    base: &Path,
    dry_run: bool,
    cancel: &CancelFlag,
    renamed: &mut u64,
    collisions: &mut u64,
    sidecars_renamed: &mut u64,
    items: &mut Vec<RenamedItem>,
) -> Result<()> {
    cancel.check()?;

    if node.is_file() {
        let original = base.join(&node.location.relative);
        let target = rename::rename_to_storage(&original, node, dry_run)
            .with_context(|| format!("Failed to rename {}", original.display()))?;

        if target == original {
            *collisions += 1;
        } else {
            *renamed += 1;
            items.push(RenamedItem {
                from: node.location.relative.clone(),
                to: target
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            });
            if !dry_run && rename::rename_sidecar(&original, node).is_some() {
                *sidecars_renamed += 1;
            }
        }
        return Ok(());
    }

    if let Some(children) = &node.children {
        for child in children {
            rename_files(
                child,
                base,
                dry_run,
                cancel,
                renamed,
                collisions,
                sidecars_renamed,
                items,
            )?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cmd_rollback(
    writer: &OutputWriter,
    cancel: &CancelFlag,
    records: &Path,
    search_dir: &Path,
    target: &Path,
    options: PlanOptions,
    recursive: bool,
    dry_run: bool,
) -> Result<()> {
    let index = rollback::load_path(records, recursive)
        .with_context(|| format!("Failed to load records from {}", records.display()))?;

    let plan = rollback::plan(&index, search_dir, target, &LocalResolver, &options, cancel)
        .with_context(|| "Rollback planning failed")?;

    let result = rollback::execute(&plan, dry_run, cancel, None);

    let data = RollbackOutput {
        success: result.failed == 0 && !result.cancelled,
        result_code: if result.failed == 0 { 0 } else { 1 },
        dry_run,
        restored: result.restored,
        duplicates_restored: result.duplicates_restored,
        sidecars_restored: result.sidecars_restored,
        dirs_created: result.dirs_created,
        skipped: result.skipped,
        failed: result.failed,
        cancelled: result.cancelled,
        warnings: plan.warnings.clone(),
        errors: result.errors.clone(),
    };

    writer.write(&data, || {
        let mut text = String::new();
        for warning in &plan.warnings {
            text.push_str(&format!("Warning: {}\n", warning));
        }
        if dry_run {
            text.push_str("Dry run - no filesystem changes\n");
        }
        text.push_str(&format!(
            "Restored {} files, {} duplicates, {} sidecars; {} directories created; {} skipped, {} failed\n",
            result.restored,
            result.duplicates_restored,
            result.sidecars_restored,
            result.dirs_created,
            result.skipped,
            result.failed
        ));
        for error in &result.errors {
            text.push_str(&format!("Failed: {}\n", error));
        }
        if result.cancelled {
            text.push_str("Cancelled - counts cover completed work only\n");
        }
        text
    })?;

    if result.failed > 0 {
        anyhow::bail!("{} rollback actions failed", result.failed);
    }
    Ok(())
}

fn cmd_inspect(writer: &OutputWriter, records: &Path, recursive: bool) -> Result<()> {
    let index = rollback::load_path(records, recursive)
        .with_context(|| format!("Failed to load records from {}", records.display()))?;

    let entries: Vec<EntrySummary> = index
        .entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            EntrySummary::from_entry(entry, index.duplicate_of.get(&i).map(String::as_str))
        })
        .collect();

    let data = InspectOutput {
        success: true,
        result_code: 0,
        path: records.display().to_string(),
        schema_version: SCHEMA_VERSION,
        sessions: index.sessions,
        entries: entries.clone(),
    };

    writer.write(&data, || {
        let mut text = format!(
            "{}: {} entries, {} sessions (schema {})\n",
            records.display(),
            entries.len(),
            index.sessions,
            SCHEMA_VERSION
        );
        for summary in &entries {
            let marker = match &summary.duplicate_of {
                Some(owner) => format!(" (duplicate of {})", owner),
                None => String::new(),
            };
            text.push_str(&format!(
                "  {} {} -> {} [{} bytes]{}\n",
                summary.kind, summary.relative, summary.storage_name, summary.size_bytes, marker
            ));
        }
        text
    })
}
