//! Reading a local credential store into a persistable document.

use base64::Engine;
use chrono::Utc;
use pairgate_core::{
    error::PairgateError,
    link::{jid_user, FileKind, LinkMode, SessionFile, SessionRecord, CREDS_FILE},
};
use pairgate_memory::{NewSession, Store};
use serde_json::{json, Map, Value};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Everything captured from one credential store.
#[derive(Debug, Clone)]
pub struct CapturedStore {
    /// File name to content. JSON files are embedded parsed.
    pub credentials: Value,
    pub files: Vec<SessionFile>,
}

impl CapturedStore {
    /// Device JID recorded in `creds.json`, if any.
    pub fn me(&self) -> Option<&str> {
        self.credentials
            .get(CREDS_FILE)?
            .get("me")?
            .get("id")?
            .as_str()
    }
}

/// Read every regular file in `dir` (non-recursive).
///
/// Fails when `creds.json` is missing.
pub async fn read_store(dir: &Path) -> Result<CapturedStore, PairgateError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut credentials = Map::new();
    let mut files = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let bytes = tokio::fs::read(entry.path()).await?;

        let content = match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => value,
            Err(_) => json!({
                "base64": base64::engine::general_purpose::STANDARD.encode(&bytes)
            }),
        };

        files.push(SessionFile {
            kind: FileKind::classify(&name),
            size: bytes.len() as u64,
            name: name.clone(),
        });
        credentials.insert(name, content);
    }

    if !credentials.contains_key(CREDS_FILE) {
        return Err(PairgateError::Validation(format!(
            "{CREDS_FILE} not found in {}",
            dir.display()
        )));
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    debug!("captured {} file(s) from {}", files.len(), dir.display());

    Ok(CapturedStore {
        credentials: Value::Object(credentials),
        files,
    })
}

/// Write a stored credentials document back out as a credential store.
///
/// Returns the number of files written.
pub async fn restore_store(credentials: &Value, dir: &Path) -> Result<usize, PairgateError> {
    let Some(files) = credentials.as_object() else {
        return Err(PairgateError::Validation(
            "credentials document is not an object".into(),
        ));
    };
    tokio::fs::create_dir_all(dir).await?;

    for (name, content) in files {
        if name.contains('/') || name.contains('\\') || name == ".." {
            return Err(PairgateError::Validation(format!(
                "refusing to write file name {name:?}"
            )));
        }
        let bytes = match content.get("base64").and_then(Value::as_str) {
            Some(encoded) if content.as_object().is_some_and(|o| o.len() == 1) => {
                base64::engine::general_purpose::STANDARD
                    .decode(encoded)
                    .map_err(|e| PairgateError::Validation(format!("{name}: bad base64: {e}")))?
            }
            _ => serde_json::to_vec(content)?,
        };
        tokio::fs::write(dir.join(name), bytes).await?;
    }

    Ok(files.len())
}

/// Poll for `creds.json` to appear. True once it exists.
pub async fn wait_for_creds(dir: &Path, attempts: u32, interval: Duration) -> bool {
    let creds = dir.join(CREDS_FILE);
    for attempt in 0..attempts.max(1) {
        if tokio::fs::try_exists(&creds).await.unwrap_or(false) {
            return true;
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    warn!("{CREDS_FILE} did not appear in {}", dir.display());
    false
}

/// Key a captured store is persisted under.
///
/// The request key wins. QR attempts fall back to the JID from the open
/// event, then to the one inside `creds.json`.
pub fn resolve_key(
    request_key: Option<&str>,
    event_me: Option<&str>,
    captured: &CapturedStore,
) -> Option<String> {
    if let Some(key) = request_key {
        return Some(key.to_string());
    }
    event_me
        .and_then(jid_user)
        .or_else(|| captured.me().and_then(jid_user))
}

/// Upsert a captured store as the active record for `key`, then prune history.
pub async fn persist(
    store: &Store,
    key: &str,
    session_id: &str,
    mode: LinkMode,
    captured: CapturedStore,
    ttl_days: i64,
    retention: i64,
) -> Result<SessionRecord, PairgateError> {
    let record = store
        .upsert_session(
            &NewSession {
                key: key.to_string(),
                session_id: session_id.to_string(),
                mode,
                credentials: captured.credentials,
                files: captured.files,
            },
            ttl_days,
            Utc::now(),
        )
        .await?;

    match store.prune_versions(key, retention).await {
        Ok(0) => {}
        Ok(n) => debug!("pruned {n} old version(s) of {key}"),
        Err(e) => warn!("retention prune for {key} failed: {e}"),
    }

    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairgate_core::link::SessionStatus;

    fn write(dir: &Path, name: &str, content: &[u8]) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[tokio::test]
    async fn test_read_store_embeds_json_and_binary() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "creds.json",
            br#"{"me":{"id":"15551234567:1@s.whatsapp.net"}}"#,
        );
        write(tmp.path(), "app-state-sync-key-AAA.json", b"{\"k\":1}");
        write(tmp.path(), "blob.bin", &[0xff, 0x00, 0x10]);
        std::fs::create_dir(tmp.path().join("sub")).unwrap();

        let captured = read_store(tmp.path()).await.unwrap();
        assert_eq!(captured.me(), Some("15551234567:1@s.whatsapp.net"));
        assert_eq!(captured.files.len(), 3);
        assert_eq!(captured.files[0].name, "app-state-sync-key-AAA.json");
        assert_eq!(captured.files[1].name, "blob.bin");
        assert_eq!(captured.files[1].size, 3);
        assert_eq!(captured.files[2].kind, FileKind::Creds);
        assert_eq!(captured.credentials["blob.bin"]["base64"], "/wAQ");
        assert_eq!(captured.credentials["app-state-sync-key-AAA.json"]["k"], 1);
    }

    #[tokio::test]
    async fn test_read_store_requires_creds() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "pre-key-1.json", b"{}");
        assert!(read_store(tmp.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_restore_reverses_read() {
        let src = tempfile::tempdir().unwrap();
        write(src.path(), "creds.json", br#"{"me":{"id":"1@s.whatsapp.net"}}"#);
        write(src.path(), "blob.bin", &[0xff, 0x00, 0x10]);
        let captured = read_store(src.path()).await.unwrap();

        let dst = tempfile::tempdir().unwrap();
        let out = dst.path().join("restored");
        assert_eq!(restore_store(&captured.credentials, &out).await.unwrap(), 2);
        assert_eq!(std::fs::read(out.join("blob.bin")).unwrap(), vec![0xff, 0x00, 0x10]);
        let again = read_store(&out).await.unwrap();
        assert_eq!(again.credentials, captured.credentials);
    }

    #[tokio::test]
    async fn test_restore_rejects_path_names() {
        let dst = tempfile::tempdir().unwrap();
        let doc = json!({"../creds.json": {}});
        assert!(restore_store(&doc, dst.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_wait_for_creds() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!wait_for_creds(tmp.path(), 2, Duration::from_millis(5)).await);
        write(tmp.path(), "creds.json", b"{}");
        assert!(wait_for_creds(tmp.path(), 2, Duration::from_millis(5)).await);
    }

    #[test]
    fn test_resolve_key_order() {
        let captured = CapturedStore {
            credentials: json!({"creds.json": {"me": {"id": "447911123456:3@s.whatsapp.net"}}}),
            files: Vec::new(),
        };
        assert_eq!(
            resolve_key(Some("15551234567"), None, &captured).as_deref(),
            Some("15551234567")
        );
        assert_eq!(
            resolve_key(None, Some("33612345678:2@s.whatsapp.net"), &captured).as_deref(),
            Some("33612345678")
        );
        assert_eq!(
            resolve_key(None, None, &captured).as_deref(),
            Some("447911123456")
        );

        let empty = CapturedStore {
            credentials: json!({"creds.json": {}}),
            files: Vec::new(),
        };
        assert_eq!(resolve_key(None, None, &empty), None);
    }

    #[tokio::test]
    async fn test_persist_prunes_history() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open(tmp.path().join("db.sqlite").to_str().unwrap())
            .await
            .unwrap();
        let captured = CapturedStore {
            credentials: json!({"creds.json": {"me": {"id": "15551234567:1@s.whatsapp.net"}}}),
            files: Vec::new(),
        };

        for sid in ["a", "b", "c"] {
            persist(&store, "15551234567", sid, LinkMode::Pair, captured.clone(), 90, 2)
                .await
                .unwrap();
        }

        let record = store.find_session("15551234567").await.unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Active);
        assert_eq!(record.version, 3);
        assert_eq!(store.list_versions("15551234567").await.unwrap().len(), 2);
    }
}
