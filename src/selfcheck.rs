//! Startup self-check — verify the database, the bridge, and the store directory.

use pairgate_channels::BridgeSocketFactory;
use pairgate_core::config::Config;
use pairgate_core::shellexpand;
use pairgate_memory::Store;
use std::path::Path;

/// Result of a single check.
struct CheckResult {
    name: String,
    detail: String,
    ok: bool,
}

/// Run all checks. Returns true if all passed.
pub async fn run(config: &Config, store: &Store) -> bool {
    let results = vec![
        check_database(store).await,
        check_bridge(config).await,
        check_sessions_dir(&shellexpand(&config.link.sessions_dir)),
    ];

    println!("\npairgate self-check");
    println!("===================");
    let mut all_ok = true;
    for r in &results {
        let icon = if r.ok { "+" } else { "x" };
        println!("  {icon} {}: {}", r.name, r.detail);
        if !r.ok {
            all_ok = false;
        }
    }
    println!();

    all_ok
}

async fn check_database(store: &Store) -> CheckResult {
    match store.db_size().await {
        Ok(size) => CheckResult {
            name: "Database".to_string(),
            detail: format!("accessible ({} KB)", size / 1024),
            ok: true,
        },
        Err(e) => CheckResult {
            name: "Database".to_string(),
            detail: format!("FAILED: {e}"),
            ok: false,
        },
    }
}

async fn check_bridge(config: &Config) -> CheckResult {
    let factory = BridgeSocketFactory::new(&config.bridge);
    let Some(program) = factory.program() else {
        return CheckResult {
            name: "Bridge".to_string(),
            detail: "no bridge.command configured".to_string(),
            ok: false,
        };
    };

    let available = tokio::process::Command::new(program)
        .arg("--version")
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false);

    let script = config
        .bridge
        .command
        .iter()
        .skip(1)
        .find(|arg| arg.ends_with(".js") || arg.ends_with(".mjs"));
    let script_ok = script.map(|s| Path::new(s).exists()).unwrap_or(true);

    let detail = match (available, script_ok, script) {
        (true, true, _) => format!("{program} (available)"),
        (false, _, _) => format!("{program} (NOT FOUND)"),
        (true, false, Some(s)) => format!("{program} available, but {s} is missing"),
        (true, false, None) => format!("{program} (available)"),
    };

    CheckResult {
        name: "Bridge".to_string(),
        detail,
        ok: available && script_ok,
    }
}

fn check_sessions_dir(dir: &str) -> CheckResult {
    let ok = std::fs::create_dir_all(dir).is_ok();
    CheckResult {
        name: "Session stores".to_string(),
        detail: if ok {
            format!("{dir} (writable)")
        } else {
            format!("{dir} (cannot create)")
        },
        ok,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_check_passes() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::open(tmp.path().join("pairgate.db").to_str().unwrap())
            .await
            .unwrap();
        assert!(check_database(&store).await.ok);
    }

    #[tokio::test]
    async fn test_missing_bridge_program_fails() {
        let mut config = Config::default();
        config.bridge.command = vec!["definitely-not-a-real-program-7f3a".to_string()];
        let result = check_bridge(&config).await;
        assert!(!result.ok);
        assert!(result.detail.contains("NOT FOUND"));
    }

    #[test]
    fn test_sessions_dir_created() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("sessions");
        assert!(check_sessions_dir(dir.to_str().unwrap()).ok);
        assert!(dir.is_dir());
    }
}
