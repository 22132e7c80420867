use std::{
    process::ExitCode,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chats_core::{
    fetcher::Fetcher,
    jobs::{ExportJob, JobStatus},
};
use chats_export::{ExportConfig, ExportError, JobLedger, Orchestrator};
use color_eyre::{eyre::eyre, Result};
use tracing::warn;

use crate::{auth, config::Config, storage::ArchiveContext};

pub const EXIT_INTERRUPTED: u8 = 130;

/// `export`: fetch and archive with the stored token. Ctrl-C stops the run between records.
pub async fn run(
    ctx: &ArchiveContext,
    config: &Config,
    resume: Option<&str>,
    force_refetch: bool,
) -> Result<ExitCode> {
    let Some((token, _)) = ctx
        .token_manager()
        .retrieve_token()
        .map_err(|e| eyre!(format!("{e:#}")))?
    else {
        println!("No token found. Run: chats-archive auth-setup");
        return Ok(ExitCode::FAILURE);
    };
    let fetcher = auth::build_fetcher(&token, config.fetcher_settings())?;

    let interrupt = Arc::new(AtomicBool::new(false));
    let flag = interrupt.clone();
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current record");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let code = run_with(ctx, config, fetcher, interrupt, resume, force_refetch).await;
    watcher.abort();
    code
}

pub async fn run_with<F: Fetcher>(
    ctx: &ArchiveContext,
    config: &Config,
    fetcher: F,
    interrupt: Arc<AtomicBool>,
    resume: Option<&str>,
    force_refetch: bool,
) -> Result<ExitCode> {
    let key = ctx.load_key()?;
    let export_config =
        ExportConfig::new(ctx.archive.clone()).with_lock_timeout(config.lock_timeout());
    let orchestrator = Orchestrator::new(export_config, key, fetcher).with_interrupt(interrupt);

    match orchestrator.run_export(resume, force_refetch).await {
        Ok(job_id) => {
            let job = orchestrator
                .job_status(&job_id)
                .map_err(|e| eyre!(e.to_string()))?
                .ok_or_else(|| eyre!("job {job_id} vanished from the ledger"))?;
            print_summary(&job);
            Ok(exit_code_for(&job))
        }
        Err(ExportError::Interrupted { job_id }) => {
            println!("\nInterrupted. Resume with: chats-archive export --resume {job_id}");
            Ok(ExitCode::from(EXIT_INTERRUPTED))
        }
        Err(err @ ExportError::AlreadyRunning(_)) => {
            println!("{err}");
            Ok(ExitCode::FAILURE)
        }
        Err(err) => {
            println!("Export failed: {err}");
            if let Ok(Some(job)) = orchestrator.last_export() {
                if job.status == JobStatus::Failed {
                    println!("Resume with: chats-archive export --resume {}", job.job_id);
                }
            }
            Ok(ExitCode::FAILURE)
        }
    }
}

fn exit_code_for(job: &ExportJob) -> ExitCode {
    if job.status == JobStatus::Completed && job.failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn print_summary(job: &ExportJob) {
    println!("\nExport {}: {}", job.job_id, job.status);
    println!("   Total: {}", job.total);
    println!("   Successful: {}", job.successful);
    println!("   Failed: {}", job.failed);
    for error in job.errors.iter().rev().take(5) {
        println!("   - {error}");
    }
    if job.status == JobStatus::Failed || job.failed > 0 {
        println!("Resume with: chats-archive export --resume {}", job.job_id);
    }
}

/// `jobs`: recent export history, or one job with its error list.
pub fn jobs(ctx: &ArchiveContext, job_id: Option<&str>, limit: usize) -> Result<ExitCode> {
    let ledger_path = ctx.archive.ledger_path();
    if !ledger_path.exists() {
        println!("No exports recorded yet.");
        return Ok(ExitCode::SUCCESS);
    }
    let ledger = JobLedger::open(&ledger_path).map_err(|e| eyre!(e.to_string()))?;

    if let Some(job_id) = job_id {
        let Some(job) = ledger.get(job_id).map_err(|e| eyre!(e.to_string()))? else {
            println!("Job {job_id} not found");
            return Ok(ExitCode::FAILURE);
        };
        println!("{}", job_line(&job));
        if let Some(done) = job.completed_at {
            println!("   completed {}", done.format("%Y-%m-%d %H:%M:%S UTC"));
        }
        for error in &job.errors {
            println!("   - {error}");
        }
        return Ok(ExitCode::SUCCESS);
    }

    let jobs = ledger
        .list_recent(limit)
        .map_err(|e| eyre!(e.to_string()))?;
    if jobs.is_empty() {
        println!("No exports recorded yet.");
    }
    for job in &jobs {
        println!("{}", job_line(job));
    }
    Ok(ExitCode::SUCCESS)
}

fn job_line(job: &ExportJob) -> String {
    format!(
        "{}  {:<11}  {}  {}/{} ok, {} failed",
        job.job_id,
        job.status.as_str(),
        job.started_at.format("%Y-%m-%d %H:%M"),
        job.successful,
        job.total,
        job.failed
    )
}

#[cfg(test)]
mod tests {
    use chats_core::fetcher::{DetailResponse, InMemoryFetcher};
    use serde_json::json;

    use super::*;
    use crate::storage::test_context;

    fn fetcher() -> InMemoryFetcher {
        InMemoryFetcher::new()
            .with_record(
                json!({"id": "alpha-0001", "title": "A"}),
                DetailResponse::Found(json!({"id": "alpha-0001", "mapping": {}})),
            )
            .with_record(
                json!({"id": "beta-0002", "title": "B"}),
                DetailResponse::Found(json!({"id": "beta-0002", "mapping": {}})),
            )
    }

    #[tokio::test]
    async fn clean_export_exits_zero_and_is_listed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(dir.path());
        let interrupt = Arc::new(AtomicBool::new(false));

        let code = run_with(&ctx, &Config::default(), fetcher(), interrupt, None, false)
            .await
            .expect("export");
        assert_eq!(code, ExitCode::SUCCESS);

        let store = ctx.open_store().expect("open");
        assert!(store.has_valid("alpha-0001"));
        assert!(store.has_valid("beta-0002"));
        assert_eq!(jobs(&ctx, None, 5).expect("jobs"), ExitCode::SUCCESS);
        assert_eq!(
            jobs(&ctx, Some("nope"), 5).expect("jobs"),
            ExitCode::FAILURE
        );
    }

    #[tokio::test]
    async fn interrupted_export_exits_130() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(dir.path());
        let interrupt = Arc::new(AtomicBool::new(true));

        let code = run_with(&ctx, &Config::default(), fetcher(), interrupt, None, false)
            .await
            .expect("export");
        assert_eq!(code, ExitCode::from(EXIT_INTERRUPTED));
    }

    #[tokio::test]
    async fn per_item_failures_exit_one() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(dir.path());
        let fetcher = fetcher().with_record(
            json!({"id": "gone-0003"}),
            DetailResponse::NotFound,
        );

        let code = run_with(
            &ctx,
            &Config::default(),
            fetcher,
            Arc::new(AtomicBool::new(false)),
            None,
            false,
        )
        .await
        .expect("export");
        assert_eq!(code, ExitCode::FAILURE);
    }

    #[test]
    fn jobs_without_ledger_is_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = test_context(dir.path());
        assert_eq!(jobs(&ctx, None, 10).expect("jobs"), ExitCode::SUCCESS);
    }
}
