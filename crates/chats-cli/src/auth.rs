use std::{io, process::ExitCode};

use chats_core::{
    fetcher::{ApiStatus, FetchError, Fetcher},
    record_id,
};
use chats_fetch::{token_hash, ConversationFetcher, FetcherSettings, TokenManager, TokenSource};
use color_eyre::{eyre::eyre, Result};

const SETUP_HINT: &str = "Run: chats-archive auth-setup";

pub fn auth_setup(tokens: &TokenManager, token: Option<String>) -> Result<ExitCode> {
    let token = match token {
        Some(token) => token,
        None => {
            println!("Paste the session bearer token and press Enter:");
            let mut line = String::new();
            io::stdin().read_line(&mut line)?;
            line
        }
    };
    if let Err(err) = tokens.store_token(&token) {
        println!("Token not stored: {err:#}");
        return Ok(ExitCode::FAILURE);
    }
    println!("Token stored (hash {})", token_hash(token.trim()));
    Ok(ExitCode::SUCCESS)
}

pub async fn auth_status(tokens: &TokenManager, settings: FetcherSettings) -> Result<ExitCode> {
    let Some((token, source)) = stored_token(tokens)? else {
        println!("No token found. {SETUP_HINT}");
        return Ok(ExitCode::FAILURE);
    };
    println!("Token source: {}", source_label(source));
    println!("Token hash: {}", token_hash(&token));

    let fetcher = build_fetcher(&token, settings)?;
    if fetcher.validate_credentials().await {
        println!("Token is valid");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("Token is invalid or expired. {SETUP_HINT}");
        Ok(ExitCode::FAILURE)
    }
}

pub fn auth_clear(tokens: &TokenManager) -> Result<ExitCode> {
    tokens.delete_token().map_err(|e| eyre!(format!("{e:#}")))?;
    println!("Stored token removed");
    Ok(ExitCode::SUCCESS)
}

/// One endpoint probe as shown in the verification summary.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Probe {
    endpoint: &'static str,
    outcome: String,
    ok: bool,
}

/// Probe the listing endpoint, then the detail endpoint for the first listed record.
pub async fn verify_api(tokens: &TokenManager, settings: FetcherSettings) -> Result<ExitCode> {
    let Some((token, _)) = stored_token(tokens)? else {
        println!("No token found. {SETUP_HINT}");
        return Ok(ExitCode::FAILURE);
    };
    let fetcher = build_fetcher(&token, settings)?;
    println!("Verifying API endpoints...\n");
    let probes = probe_endpoints(&fetcher).await;

    println!("{}", "=".repeat(50));
    println!("VERIFICATION SUMMARY");
    println!("{}", "=".repeat(50));
    for probe in &probes {
        let mark = if probe.ok { "ok  " } else { "FAIL" };
        println!("[{mark}] {}: {}", probe.endpoint, probe.outcome);
    }
    if probes.iter().all(|p| p.ok) {
        println!("\nAPI verification passed. You can proceed with: chats-archive export");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("\nAPI verification failed. Check your token or try again later.");
        Ok(ExitCode::FAILURE)
    }
}

async fn probe_endpoints(fetcher: &ConversationFetcher) -> Vec<Probe> {
    let mut probes = Vec::new();
    let items = match fetcher.fetch_page(0).await {
        Ok((items, _)) => {
            probes.push(Probe {
                endpoint: "/conversations",
                outcome: format!("200 ({} item(s))", items.len()),
                ok: true,
            });
            items
        }
        Err(err) => {
            probes.push(Probe {
                endpoint: "/conversations",
                outcome: describe(&err),
                ok: false,
            });
            return probes;
        }
    };

    if let Some(id) = items.iter().find_map(|item| record_id(item)) {
        let probe = match fetcher.fetch_detail(id).await {
            Ok(Some(_)) => Probe {
                endpoint: "/conversation/{id}",
                outcome: "200".into(),
                ok: true,
            },
            Ok(None) => Probe {
                endpoint: "/conversation/{id}",
                outcome: "404".into(),
                ok: false,
            },
            Err(err) => Probe {
                endpoint: "/conversation/{id}",
                outcome: describe(&err),
                ok: false,
            },
        };
        probes.push(probe);
    }
    probes
}

fn describe(err: &FetchError) -> String {
    match err {
        FetchError::Auth(_) => "token invalid, expired or forbidden".into(),
        FetchError::Timeout => "TIMEOUT".into(),
        FetchError::Transport(_) => "UNREACHABLE".into(),
        other => other.to_string(),
    }
}

pub async fn diagnose_api(tokens: &TokenManager, settings: FetcherSettings) -> Result<ExitCode> {
    let Some((token, _)) = stored_token(tokens)? else {
        println!("No authentication token found. {SETUP_HINT}");
        return Ok(ExitCode::FAILURE);
    };
    let fetcher = build_fetcher(&token, settings)?;
    println!("Running API diagnostic...");
    println!("{}", "-".repeat(50));
    let (status, message) = fetcher.check_health().await;
    println!("Status: {}", status.as_str().to_uppercase());
    println!("Message: {message}");
    println!("{}", "-".repeat(50));
    println!("\nDiagnostic token: {}", diagnostic_token(status, &message));
    Ok(ExitCode::SUCCESS)
}

/// Short shareable tag for a health result; carries no token material.
fn diagnostic_token(status: ApiStatus, message: &str) -> String {
    format!("break-{status}-{}", &token_hash(message)[..4])
}

fn stored_token(tokens: &TokenManager) -> Result<Option<(String, TokenSource)>> {
    tokens
        .retrieve_token()
        .map_err(|e| eyre!(format!("{e:#}")))
}

pub fn build_fetcher(token: &str, settings: FetcherSettings) -> Result<ConversationFetcher> {
    ConversationFetcher::new(token, settings).map_err(|e| eyre!(format!("{e:#}")))
}

fn source_label(source: TokenSource) -> &'static str {
    match source {
        TokenSource::SecretStore => "OS credential store",
        TokenSource::Environment => "environment variable (less secure)",
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chats_core::secret_store::InMemorySecretStore;

    use super::*;

    #[test]
    fn diagnostic_token_is_stable_and_short() {
        let token = diagnostic_token(ApiStatus::Blocked, "Access forbidden");
        assert!(token.starts_with("break-blocked-"));
        assert_eq!(token.len(), "break-blocked-".len() + 4);
        assert_eq!(token, diagnostic_token(ApiStatus::Blocked, "Access forbidden"));
    }

    #[test]
    fn auth_setup_rejects_short_tokens() {
        let tokens = TokenManager::new(Arc::new(InMemorySecretStore::new()))
            .with_env_var("CHATS_ARCHIVE_TEST_AUTH_SETUP_UNSET");
        let code = auth_setup(&tokens, Some("short".into())).expect("setup");
        assert_eq!(code, ExitCode::FAILURE);
        assert!(tokens.retrieve_token().expect("retrieve").is_none());

        let code = auth_setup(&tokens, Some("a-long-enough-session-token".into())).expect("setup");
        assert_eq!(code, ExitCode::SUCCESS);
        assert!(tokens.retrieve_token().expect("retrieve").is_some());

        auth_clear(&tokens).expect("clear");
        assert!(tokens.retrieve_token().expect("retrieve").is_none());
    }

    #[test]
    fn describes_transport_failures_without_detail() {
        assert_eq!(describe(&FetchError::Transport("dns".into())), "UNREACHABLE");
        assert_eq!(describe(&FetchError::Timeout), "TIMEOUT");
        assert_eq!(describe(&FetchError::Status(502)), "unexpected status 502");
    }

    #[tokio::test]
    async fn probes_stop_after_a_failed_listing() {
        let settings = FetcherSettings {
            base_url: "http://127.0.0.1:9".into(),
            max_retries: 1,
            ..FetcherSettings::default()
        };
        let fetcher = build_fetcher("a-long-enough-session-token", settings).expect("fetcher");
        let probes = probe_endpoints(&fetcher).await;
        assert_eq!(probes.len(), 1);
        assert!(!probes[0].ok);
    }
}
