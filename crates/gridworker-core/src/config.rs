//! `./config` reader: `key = value` lines, a fixed recognized-key set.
//!
//! Ported from `read_config` in the original client; unknown keys are
//! ignored rather than rejected so a config file written for a newer or
//! older release still works.

use std::path::Path;

use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub username: String,
    pub password: String,
    pub database: String,
    pub port: u16,
    pub gridqueue: i32,
    pub verifier: Option<String>,
}

const DEFAULT_PORT: u16 = 3306;

impl Config {
    /// Parses the `key = value` lines in `text`. Lines that are blank, or
    /// whose first non-whitespace character is `#`, are skipped. Lines
    /// without a literal `=` are ignored, matching the original parser's
    /// tolerance for stray lines.
    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let mut host = None;
        let mut username = None;
        let mut password = String::new();
        let mut database = None;
        let mut port = DEFAULT_PORT;
        let mut gridqueue = None;
        let mut verifier = None;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            match key {
                "host" => host = Some(value.to_string()),
                "username" => username = Some(value.to_string()),
                "password" => password = value.to_string(),
                "database" => database = Some(value.to_string()),
                "port" => {
                    port = value
                        .parse()
                        .map_err(|_| ConfigError::InvalidPort(value.to_string()))?;
                }
                "gridqueue" => gridqueue = value.parse().ok(),
                "verifier" => verifier = Some(value.to_string()),
                _ => {} // unknown keys are ignored, not an error
            }
        }

        Ok(Config {
            host: host.ok_or(ConfigError::MissingKey("host"))?,
            username: username.ok_or(ConfigError::MissingKey("username"))?,
            password,
            database: database.ok_or(ConfigError::MissingKey("database"))?,
            port,
            gridqueue: gridqueue.ok_or(ConfigError::MissingKey("gridqueue"))?,
            verifier,
        })
    }

    /// Reads and parses the config file at `path` (typically `./config`,
    /// relative to the process's current directory — not `base_path`).
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Config::parse(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = "\
host = db.example.org
username = worker
password = s3cret
database = edacc
gridqueue = 3
";

    #[test]
    fn parses_minimal_config() {
        let cfg = Config::parse(MINIMAL).unwrap();
        assert_eq!(cfg.host, "db.example.org");
        assert_eq!(cfg.username, "worker");
        assert_eq!(cfg.password, "s3cret");
        assert_eq!(cfg.database, "edacc");
        assert_eq!(cfg.port, DEFAULT_PORT);
        assert_eq!(cfg.gridqueue, 3);
        assert!(cfg.verifier.is_none());
    }

    #[test]
    fn port_defaults_and_can_be_overridden() {
        let cfg = Config::parse(&format!("{MINIMAL}port = 3307\n")).unwrap();
        assert_eq!(cfg.port, 3307);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let cfg = Config::parse(&format!("{MINIMAL}some_future_key = yes\n")).unwrap();
        assert_eq!(cfg.host, "db.example.org");
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let text = format!("# a comment\n\n{MINIMAL}\n# trailing\n");
        assert!(Config::parse(&text).is_ok());
    }

    #[test]
    fn verifier_is_optional() {
        let cfg = Config::parse(&format!("{MINIMAL}verifier = /opt/verify\n")).unwrap();
        assert_eq!(cfg.verifier.as_deref(), Some("/opt/verify"));
    }

    #[test]
    fn missing_host_is_fatal() {
        let text = "username = worker\ndatabase = edacc\ngridqueue = 1\n";
        match Config::parse(text) {
            Err(ConfigError::MissingKey("host")) => {}
            other => panic!("expected MissingKey(\"host\"), got {other:?}"),
        }
    }

    #[test]
    fn missing_username_is_fatal() {
        let text = "host = h\ndatabase = edacc\ngridqueue = 1\n";
        assert!(matches!(
            Config::parse(text),
            Err(ConfigError::MissingKey("username"))
        ));
    }

    #[test]
    fn missing_database_is_fatal() {
        let text = "host = h\nusername = u\ngridqueue = 1\n";
        assert!(matches!(
            Config::parse(text),
            Err(ConfigError::MissingKey("database"))
        ));
    }

    #[test]
    fn missing_gridqueue_is_fatal() {
        let text = "host = h\nusername = u\ndatabase = d\n";
        assert!(matches!(
            Config::parse(text),
            Err(ConfigError::MissingKey("gridqueue"))
        ));
    }

    #[test]
    fn invalid_port_is_fatal() {
        let text = format!("{MINIMAL}port = not-a-number\n");
        assert!(matches!(
            Config::parse(&text),
            Err(ConfigError::InvalidPort(_))
        ));
    }
}
