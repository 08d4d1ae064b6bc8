//! Configuration file management for fleetd.
//!
//! Provides a TOML-based config file at `~/.config/fleetd/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default, applied
//! independently to every recognized key.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use fleetd_core::config::CoreConfig;
use fleetd_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub database: DatabaseSection,
    #[serde(default)]
    pub log: LogSection,
    #[serde(default)]
    pub server: ServerSection,
    /// Scheduler/pool/retry/dead-run-detection/stage-timeout knobs, one
    /// section per `CoreConfig` field. Absent sections fall back to
    /// `CoreConfig::default()` via `#[serde(default)]` on every nested type.
    #[serde(default)]
    pub core: CoreConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LogSection {
    pub level: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ServerSection {
    pub bind: Option<String>,
    pub port: Option<u16>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the fleetd config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/fleetd` or `~/.config/fleetd`.
/// We intentionally ignore the platform-specific `dirs::config_dir()`
/// (which returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("fleetd");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("fleetd")
}

/// Return the path to the fleetd config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns `Ok(None)` if it does not exist.
pub fn load_config() -> Result<Option<ConfigFile>> {
    let path = config_path();
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(Some(config))
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct FleetdConfig {
    pub db_config: DbConfig,
    pub log_level: String,
    pub server_bind: String,
    pub server_port: u16,
    pub core: CoreConfig,
}

pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_SERVER_BIND: &str = "127.0.0.1";
pub const DEFAULT_SERVER_PORT: u16 = 7070;

impl FleetdConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default, independently for each key.
    pub fn resolve(
        cli_db_url: Option<&str>,
        cli_log_level: Option<&str>,
        cli_bind: Option<&str>,
        cli_port: Option<u16>,
    ) -> Result<Self> {
        let file_config = load_config()?;

        let db_url = cli_db_url
            .map(str::to_string)
            .or_else(|| std::env::var("FLEETD_DATABASE_URL").ok())
            .or_else(|| std::env::var("DATABASE_URL").ok())
            .or_else(|| file_config.as_ref().and_then(|c| c.database.url.clone()))
            .unwrap_or_else(|| DbConfig::DEFAULT_URL.to_string());
        let db_config = DbConfig::new(db_url);

        let log_level = cli_log_level
            .map(str::to_string)
            .or_else(|| std::env::var("RUST_LOG").ok())
            .or_else(|| file_config.as_ref().and_then(|c| c.log.level.clone()))
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        let server_bind = cli_bind
            .map(str::to_string)
            .or_else(|| std::env::var("FLEETD_SERVER_BIND").ok())
            .or_else(|| file_config.as_ref().and_then(|c| c.server.bind.clone()))
            .unwrap_or_else(|| DEFAULT_SERVER_BIND.to_string());

        let server_port = cli_port
            .or_else(|| {
                std::env::var("FLEETD_SERVER_PORT")
                    .ok()
                    .and_then(|p| p.parse().ok())
            })
            .or_else(|| file_config.as_ref().and_then(|c| c.server.port))
            .unwrap_or(DEFAULT_SERVER_PORT);

        let core = file_config.map(|c| c.core).unwrap_or_default();
        core.validate().map_err(anyhow::Error::msg)?;

        Ok(Self {
            db_config,
            log_level,
            server_bind,
            server_port,
            core,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    /// Tests that mutate process env must not interleave.
    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    fn lock_env() -> MutexGuard<'static, ()> {
        env_lock().lock().unwrap_or_else(|e| e.into_inner())
    }

    fn clear_env() {
        unsafe {
            std::env::remove_var("FLEETD_DATABASE_URL");
            std::env::remove_var("DATABASE_URL");
            std::env::remove_var("RUST_LOG");
            std::env::remove_var("FLEETD_SERVER_BIND");
            std::env::remove_var("FLEETD_SERVER_PORT");
        }
    }

    #[test]
    fn resolve_with_cli_flag_overrides_all() {
        let _lock = lock_env();
        clear_env();
        unsafe { std::env::set_var("FLEETD_DATABASE_URL", "postgresql://env:5432/envdb") };

        let config = FleetdConfig::resolve(Some("postgresql://cli:5432/clidb"), None, None, None)
            .unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://cli:5432/clidb");

        clear_env();
    }

    #[test]
    fn resolve_with_env_var_overrides_config_file() {
        let _lock = lock_env();
        clear_env();
        unsafe { std::env::set_var("FLEETD_DATABASE_URL", "postgresql://env:5432/envdb") };

        let config = FleetdConfig::resolve(None, None, None, None).unwrap();
        assert_eq!(config.db_config.database_url, "postgresql://env:5432/envdb");

        clear_env();
    }

    #[test]
    fn resolve_defaults_when_nothing_set() {
        let _lock = lock_env();
        clear_env();

        let config = FleetdConfig::resolve(None, None, None, None).unwrap();
        assert_eq!(config.db_config.database_url, DbConfig::DEFAULT_URL);
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert_eq!(config.server_bind, DEFAULT_SERVER_BIND);
        assert_eq!(config.server_port, DEFAULT_SERVER_PORT);
    }

    #[test]
    fn resolve_port_from_env_parses_as_u16() {
        let _lock = lock_env();
        clear_env();
        unsafe { std::env::set_var("FLEETD_SERVER_PORT", "9090") };

        let config = FleetdConfig::resolve(None, None, None, None).unwrap();
        assert_eq!(config.server_port, 9090);

        clear_env();
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("fleetd/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let original = ConfigFile {
            database: DatabaseSection {
                url: Some("postgresql://testhost:5432/testdb".to_string()),
            },
            log: LogSection {
                level: Some("debug".to_string()),
            },
            server: ServerSection {
                bind: Some("0.0.0.0".to_string()),
                port: Some(8080),
            },
            core: CoreConfig::default(),
        };

        let path = tmp.path().join("config.toml");
        let contents = toml::to_string_pretty(&original).unwrap();
        std::fs::write(&path, &contents).unwrap();

        let loaded_contents = std::fs::read_to_string(&path).unwrap();
        let loaded: ConfigFile = toml::from_str(&loaded_contents).unwrap();

        assert_eq!(loaded.database.url, original.database.url);
        assert_eq!(loaded.server.port, original.server.port);
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::TempDir::new().unwrap();
        let file = tmp.path().join("test.toml");
        std::fs::write(&file, "test").unwrap();

        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&file, perms).unwrap();

        let meta = std::fs::metadata(&file).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
