//! Init wizard — writes a starter `config.toml`.

use pairgate_core::config::Config;
use pairgate_core::shellexpand;
use std::path::Path;

/// Answers collected by the wizard.
struct Answers {
    data_dir: String,
    port: u16,
    api_key: String,
    bridge_command: Vec<String>,
}

/// Run the interactive init wizard.
pub fn run(config_path: &str) -> anyhow::Result<()> {
    cliclack::intro(console::style("pairgate init").bold().to_string())?;

    if Path::new(config_path).exists() {
        let overwrite: bool = cliclack::confirm(format!("{config_path} exists. Overwrite it?"))
            .initial_value(false)
            .interact()?;
        if !overwrite {
            cliclack::outro("Nothing changed.")?;
            return Ok(());
        }
    }

    let data_dir: String = cliclack::input("Data directory")
        .default_input("~/.pairgate")
        .interact()?;
    let port: u16 = cliclack::input("HTTP port")
        .default_input("5000")
        .validate(|v: &String| match v.parse::<u16>() {
            Ok(_) => Ok(()),
            Err(_) => Err("enter a port number"),
        })
        .interact()?;
    let api_key: String = cliclack::input("API key (blank disables auth)")
        .required(false)
        .interact()?;
    let bridge: String = cliclack::input("Bridge command")
        .default_input("node bridge/baileys-bridge.mjs")
        .interact()?;

    let answers = Answers {
        data_dir: data_dir.trim_end_matches('/').to_string(),
        port,
        api_key,
        bridge_command: bridge.split_whitespace().map(str::to_string).collect(),
    };
    let content = render_config(&answers);
    // Refuse to write something the loader would reject.
    Config::parse(&content)?;

    let expanded = shellexpand(&answers.data_dir);
    std::fs::create_dir_all(&expanded)?;
    std::fs::write(config_path, content)?;

    cliclack::log::success(format!("Wrote {config_path}"))?;
    cliclack::outro("Next: pairgate check, then pairgate serve")?;
    Ok(())
}

fn render_config(a: &Answers) -> String {
    let command = a
        .bridge_command
        .iter()
        .map(|part| format!("{part:?}"))
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        r#"data_dir = "{data_dir}"

[api]
host = "0.0.0.0"
port = {port}
api_key = "{api_key}"

[memory]
db_path = "{data_dir}/pairgate.db"
session_ttl_days = 90
retention_versions = 5

[link]
sessions_dir = "{data_dir}/sessions"
max_retries = 3
retry_backoff_ms = 2000

[bridge]
command = [{command}]
"#,
        data_dir = a.data_dir,
        port = a.port,
        api_key = a.api_key,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendered_config_loads() {
        let content = render_config(&Answers {
            data_dir: "/srv/pairgate".into(),
            port: 8080,
            api_key: "secret".into(),
            bridge_command: vec!["node".into(), "/opt/bridge.mjs".into()],
        });
        let config = Config::parse(&content).unwrap();
        assert_eq!(config.api.port, 8080);
        assert_eq!(config.api.api_key, "secret");
        assert_eq!(config.memory.db_path, "/srv/pairgate/pairgate.db");
        assert_eq!(config.link.sessions_dir, "/srv/pairgate/sessions");
        assert_eq!(config.bridge.command, vec!["node", "/opt/bridge.mjs"]);
    }
}
