use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration for the front door.
///
/// Loadable from a TOML file; every field has a default so a bare
/// `devmux` invocation works out of the box. CLI flags override file values.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Directory whose immediate children are application folders
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Base host suffix; apps are served at `<app>.<domain>`
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Listen port for the front door
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Seconds without traffic before an app is stopped
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,

    /// Seconds between idle-reaper sweeps
    #[serde(default = "default_reap_interval")]
    pub reap_interval_secs: u64,

    /// Seconds an app gets to bind its port before launch is abandoned
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Verbose logging toggle
    #[serde(default)]
    pub verbose: bool,
}

fn default_root() -> PathBuf {
    PathBuf::from("~/Web")
}

fn default_domain() -> String {
    "localhost".to_string()
}

fn default_listen_port() -> u16 {
    7777
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_idle_ttl() -> u64 {
    600
}

fn default_reap_interval() -> u64 {
    30
}

fn default_startup_timeout() -> u64 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: default_root(),
            domain: default_domain(),
            port: default_listen_port(),
            bind: default_bind_address(),
            idle_ttl_secs: default_idle_ttl(),
            reap_interval_secs: default_reap_interval(),
            startup_timeout_secs: default_startup_timeout(),
            verbose: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {}", path.display(), e))?;
        let config: Config = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("failed to parse {}: {}", path.display(), e))?;
        Ok(config)
    }

    /// Expand a leading `~` in `root` and make it absolute. The directory
    /// itself does not have to exist yet.
    pub fn resolve_root(&mut self) -> anyhow::Result<()> {
        let expanded = expand_tilde(&self.root);
        self.root = if expanded.is_absolute() {
            expanded
        } else {
            std::env::current_dir()?.join(expanded)
        };
        Ok(())
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

/// Replace a leading `~` or `~/` with the value of `$HOME`.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Some(s) = path.to_str() else {
        return path.to_path_buf();
    };
    if s == "~" {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home);
        }
    } else if let Some(rest) = s.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.domain, "localhost");
        assert_eq!(config.port, 7777);
        assert_eq!(config.idle_ttl(), Duration::from_secs(600));
        assert_eq!(config.reap_interval(), Duration::from_secs(30));
        assert_eq!(config.startup_timeout(), Duration::from_secs(5));
        assert!(!config.verbose);
    }

    #[test]
    fn test_parse_toml() {
        let config: Config = toml::from_str(
            r#"
root = "/srv/apps"
domain = "dev.local"
port = 8080
idle_ttl_secs = 120
verbose = true
"#,
        )
        .unwrap();

        assert_eq!(config.root, PathBuf::from("/srv/apps"));
        assert_eq!(config.domain, "dev.local");
        assert_eq!(config.port, 8080);
        assert_eq!(config.idle_ttl_secs, 120);
        // Unset keys fall back to defaults
        assert_eq!(config.reap_interval_secs, 30);
        assert!(config.verbose);
    }

    #[test]
    fn test_expand_tilde() {
        assert_eq!(
            expand_tilde(Path::new("/absolute/path")),
            PathBuf::from("/absolute/path")
        );
        assert_eq!(
            expand_tilde(Path::new("relative/path")),
            PathBuf::from("relative/path")
        );
        if let Ok(home) = std::env::var("HOME") {
            assert_eq!(
                expand_tilde(Path::new("~/Web")),
                PathBuf::from(&home).join("Web")
            );
            assert_eq!(expand_tilde(Path::new("~")), PathBuf::from(home));
        }
    }

    #[test]
    fn test_resolve_root_absolute() {
        let mut config = Config {
            root: PathBuf::from("/srv/apps"),
            ..Config::default()
        };
        config.resolve_root().unwrap();
        assert_eq!(config.root, PathBuf::from("/srv/apps"));
    }
}
