//! TOML parser with helpful error messages

use super::BerthConfig;
use anyhow::{Context, Result};
use std::path::Path;

/// Parse berth.toml with detailed error messages
pub fn parse_berth_toml(path: &Path) -> Result<BerthConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_berth_toml_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse berth.toml content from string
pub fn parse_berth_toml_str(content: &str) -> Result<BerthConfig> {
    let config: BerthConfig =
        toml::from_str(content).map_err(|e| enhance_toml_error(e, content))?;
    config.validate()?;
    Ok(config)
}

/// Load `path` if given, otherwise the defaults.
pub fn load_config(path: Option<&Path>) -> Result<BerthConfig> {
    match path {
        Some(path) => parse_berth_toml(path),
        None => Ok(BerthConfig::default()),
    }
}

fn enhance_toml_error(error: toml::de::Error, content: &str) -> anyhow::Error {
    let line = error
        .span()
        .map(|span| content[..span.start.min(content.len())].matches('\n').count() + 1);

    match line {
        Some(line_num) => anyhow::anyhow!(
            "TOML parsing error at line {}:\n{}\n\nError: {}",
            line_num,
            get_line_context(content, line_num),
            error.message()
        ),
        None => anyhow::anyhow!("TOML parsing error: {}", error),
    }
}

/// Get context lines around an error
fn get_line_context(content: &str, line_num: usize) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let start = line_num.saturating_sub(2);
    let end = (line_num + 2).min(lines.len());
    if start >= end {
        return String::new();
    }

    lines[start..end]
        .iter()
        .enumerate()
        .map(|(i, line)| {
            let num = start + i + 1;
            let marker = if num == line_num { ">>>" } else { "   " };
            format!("{} {:4} | {}", marker, num, line)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
[agent]
slots_dir = "/var/lib/berth/slots"
max_lock_wait_ms = 250
resources = { cpu = 8, memory = 1024 }
internal_uri = "http://10.0.0.5:8080/"
external_uri = "https://apple.example.com/"

[repository]
default_group_ids = ["fruit", "food.fruit"]
bases = ["file:///srv/repo/", "https://repo.example.com/maven"]
request_timeout_ms = 2000

[coordinator]
environment = "prod"
announce_interval_ms = 1500
"#;

        let config = parse_berth_toml_str(toml).expect("parse should succeed");
        assert_eq!(config.agent.max_lock_wait_ms, 250);
        assert_eq!(config.agent.resources["cpu"], 8);
        assert_eq!(
            config.agent.external_uri.as_ref().map(|uri| uri.as_str()),
            Some("https://apple.example.com/")
        );
        assert_eq!(config.repository.default_group_ids.len(), 2);
        assert_eq!(config.repository.bases[1].as_str(), "https://repo.example.com/maven");
        assert_eq!(config.coordinator.environment, "prod");
    }

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = parse_berth_toml_str("").expect("parse should succeed");
        assert_eq!(config.agent.max_lock_wait_ms, 1000);
        assert_eq!(config.repository.request_timeout_ms, 5000);
        assert_eq!(config.coordinator.announce_interval_ms, 3000);
    }

    #[test]
    fn test_zero_lock_wait_is_rejected() {
        let err = parse_berth_toml_str("[agent]\nmax_lock_wait_ms = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_lock_wait_ms"));
    }

    #[test]
    fn test_bad_base_url_is_rejected() {
        let toml = "[repository]\ndefault_group_ids = [\"fruit\"]\nbases = [\"not a url\"]\n";
        let err = parse_berth_toml_str(toml).unwrap_err();
        assert!(err.to_string().contains("TOML parsing error"));
    }

    #[test]
    fn test_unsupported_scheme_is_rejected() {
        let err = parse_berth_toml_str("[repository]\nbases = [\"ftp://example.com/\"]\n")
            .unwrap_err();
        assert!(err.to_string().contains("unsupported scheme"));
    }

    #[test]
    fn test_parse_from_file() {
        let mut file = NamedTempFile::new().expect("tempfile should succeed");
        writeln!(file, "[coordinator]\nenvironment = \"staging\"").expect("write");

        let config = parse_berth_toml(file.path()).expect("parse should succeed");
        assert_eq!(config.coordinator.environment, "staging");
    }
}
