use std::{collections::HashSet, fs, path::Path, process::ExitCode};

use chats_core::{id_prefix, integrity::IntegrityState};
use chats_storage::{encrypted_store::ArchiveEntry, importer::Importer, ArchiveStats};
use color_eyre::Result;
use tracing::warn;

use crate::{render, storage::ArchiveContext};

const MAX_PROBLEMS_SHOWN: usize = 50;
const TITLE_WIDTH: usize = 35;

pub fn list(ctx: &ArchiveContext) -> Result<ExitCode> {
    let store = ctx.open_store()?;
    let entries = store.list();
    if entries.is_empty() {
        println!("No conversations archived yet. Run `chats-archive export` first.");
        return Ok(ExitCode::SUCCESS);
    }
    println!("{:<10} {:<12} {}", "ID", "Date", "Title");
    println!("{}", "-".repeat(60));
    for entry in &entries {
        println!("{}", list_row(entry));
    }
    println!("\n{} file(s)", entries.len());
    Ok(ExitCode::SUCCESS)
}

fn list_row(entry: &ArchiveEntry) -> String {
    format!(
        "{:<10} {:<12} {}",
        id_prefix(&entry.record_id),
        entry.date,
        truncate(&entry.title, TITLE_WIDTH)
    )
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let cut: String = text.chars().take(width).collect();
    format!("{cut}...")
}

/// Print a conversation only if it verifies as VALID.
pub fn read(ctx: &ArchiveContext, id: &str) -> Result<ExitCode> {
    let store = ctx.open_store()?;
    let result = store.verify(id);
    if !result.is_valid() {
        println!("Conversation {id} is not readable as VALID");
        println!("   State: {}", result.state);
        if let Some(code) = result.error_code {
            println!("   Error: {code}");
        }
        if let Some(path) = &result.filepath {
            println!("   File: {path}");
        }
        return Ok(ExitCode::FAILURE);
    }
    let Some(conversation) = store.retrieve(id) else {
        println!("Conversation {id} could not be loaded");
        return Ok(ExitCode::FAILURE);
    };
    print!("{}", render::render_transcript(&conversation));
    Ok(ExitCode::SUCCESS)
}

pub fn status(ctx: &ArchiveContext) -> Result<ExitCode> {
    let store = ctx.open_store()?;
    let stats = store.stats();
    println!("Archive Status");
    println!("{}", "-".repeat(50));
    for line in status_lines(&stats) {
        println!("{line}");
    }
    println!("{}", "-".repeat(50));
    Ok(ExitCode::SUCCESS)
}

fn status_lines(stats: &ArchiveStats) -> Vec<String> {
    let mut lines = vec![
        format!("Total conversations: {}", stats.count),
        format!(
            "Total size: {:.1} MB",
            stats.total_bytes as f64 / 1024.0 / 1024.0
        ),
    ];
    if let (Some(oldest), Some(newest)) = (stats.oldest_date, stats.newest_date) {
        lines.push(format!("Oldest conversation: {oldest}"));
        lines.push(format!("Newest conversation: {newest}"));
    }
    lines
}

/// Sweep every wrapper. Exit 2 when any file is not VALID.
pub fn verify_archive(ctx: &ArchiveContext) -> Result<ExitCode> {
    let store = ctx.open_store()?;
    let report = store.verify_all();

    println!("Archive Verification");
    println!("{}", "-".repeat(50));
    println!("Total files: {}", report.total_files);
    for state in IntegrityState::ALL {
        let count = report.counts.get(&state).copied().unwrap_or(0);
        println!("{state}: {count}");
    }
    println!("{}", "-".repeat(50));

    if report.is_clean() {
        println!("Archive verified (no problems detected)");
        return Ok(ExitCode::SUCCESS);
    }

    println!("Problems:");
    for problem in report.problems.iter().take(MAX_PROBLEMS_SHOWN) {
        let id: String = problem.record_id.chars().take(12).collect();
        println!(
            " - {id}  {}  {}  {}",
            problem.state,
            problem.error_code.map(|c| c.as_str()).unwrap_or(""),
            problem.filepath.as_deref().unwrap_or("")
        );
    }
    if report.problems.len() > MAX_PROBLEMS_SHOWN {
        println!("... and {} more", report.problems.len() - MAX_PROBLEMS_SHOWN);
    }
    Ok(ExitCode::from(2))
}

pub fn import_json(ctx: &ArchiveContext, file: &Path) -> Result<ExitCode> {
    if !file.exists() {
        println!("File not found: {}", file.display());
        return Ok(ExitCode::FAILURE);
    }
    let store = ctx.open_store()?;
    if store.is_poisoned() {
        color_eyre::eyre::bail!("archive key does not match this archive; refusing to import");
    }
    let report = Importer::new(&store)
        .import_file(file)
        .map_err(|e| color_eyre::eyre::eyre!(e.to_string()))?;
    println!("Found {} conversations", report.found);
    println!("Imported {} conversations", report.imported);
    if report.failed > 0 {
        println!("Failed: {}", report.failed);
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct MarkdownReport {
    pub exported: usize,
    pub failed: usize,
}

pub fn export_markdown(ctx: &ArchiveContext, output: &Path) -> Result<ExitCode> {
    let store = ctx.open_store()?;
    let report = write_markdown(&store, output)?;
    println!(
        "Exported {} conversations to {}",
        report.exported,
        output.display()
    );
    if report.failed > 0 {
        println!("Failed: {}", report.failed);
    }
    Ok(ExitCode::SUCCESS)
}

/// One file per distinct VALID record; the newest copy of a duplicated id wins.
fn write_markdown(
    store: &chats_storage::EncryptedStore,
    output: &Path,
) -> Result<MarkdownReport> {
    fs::create_dir_all(output)?;
    let mut report = MarkdownReport::default();
    let mut seen = HashSet::new();
    for entry in store.list() {
        if !seen.insert(entry.record_id.clone()) {
            continue;
        }
        let Some(conversation) = store.retrieve(&entry.record_id) else {
            warn!(record = id_prefix(&entry.record_id), "skipping record that is not VALID");
            report.failed += 1;
            continue;
        };
        let name = render::markdown_file_name(&entry.date, &conversation, &entry.record_id);
        fs::write(output.join(name), render::render_markdown(&conversation))?;
        report.exported += 1;
    }
    Ok(report)
}
