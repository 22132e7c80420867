mod archive;
mod auth;
mod cli;
mod config;
mod export;
mod keys;
mod render;
mod storage;

use std::{
    fs::{self, File, OpenOptions},
    process::ExitCode,
    sync::Mutex,
};

use clap::Parser;
use color_eyre::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{
    cli::{Command, ConfigCommand},
    storage::ArchiveContext,
};

/// Entry point: parse, resolve the archive, set up logging, dispatch.
#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;

    let cli = cli::Cli::parse();
    let config = config::load()?;
    let root = storage::resolve_archive_dir(cli.archive_dir.as_deref(), &config)?;
    let ctx = ArchiveContext::from_config(root, &config);
    let audit = if uses_archive(&cli.command) {
        open_audit_log(&ctx)
    } else {
        None
    };
    init_tracing(audit);

    let tokens = ctx.token_manager();
    let settings = config.fetcher_settings();

    match cli.command {
        Command::AuthSetup { token } => auth::auth_setup(&tokens, token),
        Command::AuthStatus => auth::auth_status(&tokens, settings).await,
        Command::AuthClear => auth::auth_clear(&tokens),
        Command::VerifyApi => auth::verify_api(&tokens, settings).await,
        Command::DiagnoseApi => auth::diagnose_api(&tokens, settings).await,
        Command::Export {
            resume,
            force_refetch,
        } => export::run(&ctx, &config, resume.as_deref(), force_refetch).await,
        Command::Jobs { job_id, limit } => export::jobs(&ctx, job_id.as_deref(), limit),
        Command::ImportJson { file } => archive::import_json(&ctx, &file),
        Command::List => archive::list(&ctx),
        Command::Read { id } => archive::read(&ctx, &id),
        Command::ExportMarkdown { output } => archive::export_markdown(&ctx, &output),
        Command::Status => archive::status(&ctx),
        Command::VerifyArchive => archive::verify_archive(&ctx),
        Command::KeyExport { output } => keys::key_export(&ctx, output.as_deref()),
        Command::KeyImport { file, key } => {
            keys::key_import(&ctx, file.as_deref(), key.as_deref())
        }
        Command::RotateKey => keys::rotate_key(&ctx, config.lock_timeout()),
        Command::Config(ConfigCommand::Init) => init_config(&config),
    }
}

/// Commands that read or write the archive get an audit trail inside it.
fn uses_archive(command: &Command) -> bool {
    match command {
        Command::AuthSetup { .. }
        | Command::AuthStatus
        | Command::AuthClear
        | Command::VerifyApi
        | Command::DiagnoseApi
        | Command::Config(_) => false,
        Command::Export { .. }
        | Command::Jobs { .. }
        | Command::ImportJson { .. }
        | Command::List
        | Command::Read { .. }
        | Command::ExportMarkdown { .. }
        | Command::Status
        | Command::VerifyArchive
        | Command::KeyExport { .. }
        | Command::KeyImport { .. }
        | Command::RotateKey => true,
    }
}

fn open_audit_log(ctx: &ArchiveContext) -> Option<File> {
    let path = ctx.archive.audit_log_path();
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let opened = fs::create_dir_all(ctx.root()).and_then(|_| options.open(&path));
    match opened {
        Ok(file) => Some(file),
        Err(err) => {
            // Tracing is not up yet.
            eprintln!("warning: audit log unavailable at {}: {err}", path.display());
            None
        }
    }
}

fn init_tracing(audit: Option<File>) {
    // Respect user-provided filters, default to info to avoid noisy stdout.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    let audit_layer = audit.map(|file| {
        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
    });
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(audit_layer)
        .init();
}

fn init_config(config: &config::Config) -> Result<ExitCode> {
    let path = config::default_path()?;
    let written = config::write_default_if_missing(config, &path)?;
    println!("Config initialized at {}", written.display());
    Ok(ExitCode::SUCCESS)
}
