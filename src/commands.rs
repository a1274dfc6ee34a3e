//! Session administration commands: list, show, delete, status, export, reset.

use crate::linker::capture;
use chrono::{DateTime, Utc};
use pairgate_core::link::{SessionRecord, SessionStatus, CREDS_FILE};
use pairgate_memory::{AuditLogger, Store};
use std::path::Path;

/// `sessions list` — one line per record, newest first.
pub async fn list(store: &Store, status: Option<SessionStatus>) -> anyhow::Result<String> {
    let records = store.list_sessions(status).await?;
    if records.is_empty() {
        return Ok("No sessions.".to_string());
    }

    let mut out = format!(
        "{:<16} {:<5} {:<9} {:>3}  {:<20} {}\n",
        "KEY", "MODE", "STATUS", "VER", "UPDATED", "EXPIRES"
    );
    for r in &records {
        out.push_str(&format!(
            "{:<16} {:<5} {:<9} {:>3}  {:<20} {}\n",
            r.key,
            r.mode,
            r.status,
            r.version,
            short_time(&r.updated_at),
            r.expires_at
                .as_ref()
                .map(short_time)
                .unwrap_or_else(|| "never".to_string()),
        ));
    }
    out.push_str(&format!("\n{} session(s)", records.len()));
    Ok(out)
}

/// `sessions show <key>` — record details plus version history.
pub async fn show(store: &Store, key: &str, with_credentials: bool) -> anyhow::Result<String> {
    let Some(record) = store.find_session(key).await? else {
        anyhow::bail!("no session for {key}");
    };
    let versions = store.list_versions(key).await?;

    let mut out = describe(&record);
    out.push_str("\nFiles:\n");
    for f in &record.files {
        out.push_str(&format!("  {:<40} {:<6} {}\n", f.name, f.kind.as_str(), format_bytes(f.size)));
    }

    out.push_str("\nVersions:\n");
    for v in &versions {
        out.push_str(&format!(
            "  v{:<3} {:<5} {}  {}\n",
            v.version,
            v.mode,
            short_time(&v.created_at),
            v.session_id
        ));
    }

    if with_credentials {
        out.push_str("\nCredentials:\n");
        out.push_str(&serde_json::to_string_pretty(&record.credentials)?);
        out.push('\n');
    }
    Ok(out)
}

/// `sessions delete <key>`
pub async fn delete(store: &Store, key: &str) -> anyhow::Result<String> {
    if store.delete_session(key).await? {
        Ok(format!("Deleted session {key} and its history."))
    } else {
        Ok(format!("No session for {key}."))
    }
}

/// `sessions deactivate|activate <key>`
pub async fn set_status(store: &Store, key: &str, status: SessionStatus) -> anyhow::Result<String> {
    if store.update_status(key, status, Utc::now()).await? {
        Ok(format!("Session {key} is now {status}."))
    } else {
        Ok(format!("No session for {key}."))
    }
}

/// `sessions export <key> <dir>` — rebuild the credential store on disk.
pub async fn export(
    store: &Store,
    key: &str,
    version: Option<i64>,
    dir: &Path,
) -> anyhow::Result<String> {
    let credentials = match version {
        Some(v) => store
            .version_credentials(key, v)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no version {v} for {key}"))?,
        None => {
            store
                .find_session(key)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no session for {key}"))?
                .credentials
        }
    };
    let written = capture::restore_store(&credentials, dir).await?;
    Ok(format!("Wrote {written} file(s) to {}", dir.display()))
}

/// `sessions status` — store totals and the most recent attempts.
pub async fn status(store: &Store, audit: &AuditLogger) -> String {
    let mut out = String::from("pairgate sessions\n");
    for s in [
        SessionStatus::Active,
        SessionStatus::Inactive,
        SessionStatus::Expired,
    ] {
        let count = store
            .count_sessions(s)
            .await
            .map(|n| n.to_string())
            .unwrap_or_else(|_| "?".to_string());
        out.push_str(&format!("  {:<9} {count}\n", s.as_str()));
    }

    let db_size = store
        .db_size()
        .await
        .map(format_bytes)
        .unwrap_or_else(|_| "unknown".to_string());
    out.push_str(&format!("  database  {db_size}\n"));

    match audit.recent(10).await {
        Ok(rows) if !rows.is_empty() => {
            out.push_str("\nRecent attempts:\n");
            for (_, key, mode, outcome, detail, created_at) in rows {
                out.push_str(&format!(
                    "  {created_at}  {mode:<4} {:<16} {outcome}",
                    key.as_deref().unwrap_or("-")
                ));
                if let Some(detail) = detail {
                    out.push_str(&format!("  ({detail})"));
                }
                out.push('\n');
            }
        }
        Ok(_) => out.push_str("\nNo attempts recorded.\n"),
        Err(e) => out.push_str(&format!("\nAudit log unavailable: {e}\n")),
    }
    out
}

/// `reset` — drop every stored session.
pub async fn reset(store: &Store) -> anyhow::Result<String> {
    let removed = store.reset().await?;
    Ok(format!("Database reset: removed {removed} session(s)."))
}

/// `inspect <dir>` — report what a local credential store contains.
pub async fn inspect(dir: &Path) -> anyhow::Result<String> {
    if !dir.is_dir() {
        anyhow::bail!("credential store not found: {}", dir.display());
    }

    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut lines = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if !meta.is_file() {
            continue;
        }
        lines.push(format!(
            "  {:<40} {}",
            entry.file_name().to_string_lossy(),
            format_bytes(meta.len())
        ));
    }
    lines.sort();

    let mut out = format!("{}\n{} file(s)\n", dir.display(), lines.len());
    for line in &lines {
        out.push_str(line);
        out.push('\n');
    }

    let creds_path = dir.join(CREDS_FILE);
    match tokio::fs::read(&creds_path).await {
        Ok(bytes) => match serde_json::from_slice::<serde_json::Value>(&bytes) {
            Ok(creds) => {
                let me = creds["me"]["id"].as_str().unwrap_or("not linked yet");
                out.push_str(&format!("{CREDS_FILE}: valid JSON, account {me}\n"));
            }
            Err(e) => out.push_str(&format!("{CREDS_FILE}: invalid JSON ({e})\n")),
        },
        Err(_) => out.push_str(&format!("{CREDS_FILE}: missing\n")),
    }
    Ok(out)
}

fn describe(r: &SessionRecord) -> String {
    format!(
        "Session {}\n\
         Session id: {}\n\
         Mode: {}\n\
         Status: {}\n\
         Version: {}\n\
         Created: {}\n\
         Updated: {}\n\
         Expires: {}\n",
        r.key,
        r.session_id,
        r.mode,
        r.status,
        r.version,
        short_time(&r.created_at),
        short_time(&r.updated_at),
        r.expires_at
            .as_ref()
            .map(short_time)
            .unwrap_or_else(|| "never".to_string()),
    )
}

fn short_time(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
