//! 统一配置
//!
//! 分层加载（Figment）：内置默认值 → `haven.toml` → `HAVEN__SECTION__KEY` 环境变量，
//! 最后再应用 `HAVEN_HOST` / `HAVEN_USER` / `HAVEN_PORT` / `HAVEN_SSH_KEY` /
//! `HAVEN_LOG_LEVEL` / `HAVEN_REGISTRY` 这些快捷变量。加载一次后只读。

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::backoff::RetryConfig;
use crate::diagnostics::ThresholdSet;
use crate::error::{CoreError, Result};
use crate::registry::DEFAULT_SSH_PORT;

pub const CONFIG_FILE_NAME: &str = "haven.toml";
pub const REGISTRY_FILE_NAME: &str = "servers.toml";
pub const ENV_CONFIG_PATH: &str = "HAVEN_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct HavenConfig {
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default)]
    pub watch: WatchConfig,
    #[serde(default)]
    pub diagnostics: ThresholdSet,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub defaults: ServerDefaults,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default)]
    pub log_no_ansi: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            log_no_ansi: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SshConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_sec: u64,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_sec: u64,
    /// 记录未指定密钥时使用的私钥
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_path: Option<PathBuf>,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_sec: default_connect_timeout(),
            command_timeout_sec: default_command_timeout(),
            key_path: None,
            retry: RetryConfig::default(),
        }
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_sec)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_sec)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DeployConfig {
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,
    #[serde(default = "default_per_target_timeout")]
    pub per_target_timeout_sec: u64,
    /// 0 表示不限制整批耗时
    #[serde(default = "default_overall_timeout")]
    pub overall_timeout_sec: u64,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: default_concurrency_limit(),
            per_target_timeout_sec: default_per_target_timeout(),
            overall_timeout_sec: default_overall_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WatchConfig {
    #[serde(default = "default_watch_interval")]
    pub interval_sec: u64,
    #[serde(default = "default_grace_period")]
    pub grace_period_sec: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            interval_sec: default_watch_interval(),
            grace_period_sec: default_grace_period(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// `server add` 未显式给出时使用的默认连接参数
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServerDefaults {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerDefaults {
    fn default() -> Self {
        Self {
            host: None,
            user: None,
            port: default_port(),
        }
    }
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_command_timeout() -> u64 {
    60
}

fn default_concurrency_limit() -> usize {
    4
}

fn default_per_target_timeout() -> u64 {
    300
}

fn default_overall_timeout() -> u64 {
    900
}

fn default_watch_interval() -> u64 {
    5
}

fn default_grace_period() -> u64 {
    10
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("dev", "haven", "haven")
}

/// 平台配置目录下的 `haven.toml`
pub fn default_config_path() -> Option<PathBuf> {
    project_dirs().map(|d| d.config_dir().join(CONFIG_FILE_NAME))
}

impl HavenConfig {
    /// 加载配置：显式路径 > `HAVEN_CONFIG` > 平台配置目录（存在时）
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(ENV_CONFIG_PATH).map(PathBuf::from));

        let file = match explicit {
            Some(p) => {
                if !p.exists() {
                    return Err(CoreError::config(format!(
                        "config file {} does not exist",
                        p.display()
                    )));
                }
                Some(p)
            }
            None => default_config_path().filter(|p| p.exists()),
        };

        let mut figment = Figment::from(Serialized::defaults(HavenConfig::default()));
        if let Some(p) = &file {
            debug!(path = %p.display(), "Loading config file");
            figment = figment.merge(Toml::file(p));
        }
        figment = figment.merge(Env::prefixed("HAVEN__").split("__"));

        let mut cfg: HavenConfig = figment
            .extract()
            .map_err(|e| CoreError::config(format!("failed to load config: {}", e)))?;

        cfg.apply_env_overrides(|key| std::env::var(key).ok())?;
        if let Some(p) = &file {
            let base = p.parent().unwrap_or_else(|| Path::new("."));
            cfg.resolve_relative_paths(base);
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// 应用快捷环境变量；`lookup` 便于测试时注入
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("HAVEN_HOST") {
            self.defaults.host = Some(host);
        }
        if let Some(user) = lookup("HAVEN_USER") {
            self.defaults.user = Some(user);
        }
        if let Some(port) = lookup("HAVEN_PORT") {
            self.defaults.port = port
                .parse()
                .map_err(|_| CoreError::config(format!("HAVEN_PORT is not a valid port: {}", port)))?;
        }
        if let Some(key) = lookup("HAVEN_SSH_KEY") {
            self.ssh.key_path = Some(PathBuf::from(key));
        }
        if let Some(level) = lookup("HAVEN_LOG_LEVEL") {
            self.telemetry.log_level = level;
        }
        if let Some(path) = lookup("HAVEN_REGISTRY") {
            self.registry.path = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// 验证配置参数的有效性
    pub fn validate(&self) -> Result<()> {
        if self.ssh.connect_timeout_sec == 0 || self.ssh.command_timeout_sec == 0 {
            return Err(CoreError::config("ssh timeouts must be greater than zero"));
        }
        if self.ssh.retry.max_attempts == 0 {
            return Err(CoreError::config("ssh.retry.max_attempts must be at least 1"));
        }
        if self.ssh.retry.multiplier < 1.0 {
            return Err(CoreError::config("ssh.retry.multiplier must be >= 1.0"));
        }
        if self.deploy.concurrency_limit == 0 {
            return Err(CoreError::config("deploy.concurrency_limit must be at least 1"));
        }
        if self.deploy.per_target_timeout_sec == 0 {
            return Err(CoreError::config("deploy.per_target_timeout_sec must be greater than zero"));
        }
        if self.watch.interval_sec == 0 {
            return Err(CoreError::config("watch.interval_sec must be greater than zero"));
        }
        if self.defaults.port == 0 {
            return Err(CoreError::config("defaults.port must be non-zero"));
        }
        if !matches!(self.telemetry.log_format.to_lowercase().as_str(), "text" | "json") {
            return Err(CoreError::config(format!(
                "telemetry.log_format must be 'text' or 'json', got '{}'",
                self.telemetry.log_format
            )));
        }
        self.diagnostics
            .validate()
            .map_err(|e| CoreError::config(format!("diagnostics: {}", e)))?;
        Ok(())
    }

    pub fn registry_path(&self) -> PathBuf {
        if let Some(p) = &self.registry.path {
            return p.clone();
        }
        project_dirs()
            .map(|d| d.config_dir().join(REGISTRY_FILE_NAME))
            .unwrap_or_else(|| PathBuf::from(REGISTRY_FILE_NAME))
    }

    pub fn resolve_relative_paths(&mut self, base_dir: &Path) {
        fn make_absolute(path: &mut PathBuf, base: &Path) {
            if path.is_relative() && !path.starts_with("~") {
                *path = base.join(&*path);
            }
        }

        if let Some(p) = self.registry.path.as_mut() {
            make_absolute(p, base_dir);
        }
        if let Some(p) = self.ssh.key_path.as_mut() {
            make_absolute(p, base_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn write_config(body: &str) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, body).unwrap();
        (dir, path)
    }

    mod load_tests {
        use super::*;

        #[test]
        fn test_defaults_are_valid() {
            let cfg = HavenConfig::default();
            assert!(cfg.validate().is_ok());
            assert_eq!(cfg.deploy.concurrency_limit, 4);
            assert_eq!(cfg.ssh.connect_timeout(), Duration::from_secs(30));
            assert_eq!(cfg.diagnostics.thresholds.battery_warning_level, 20);
        }

        #[test]
        fn test_file_layer_and_relative_paths() {
            let (dir, path) = write_config(
                r#"
[deploy]
concurrency_limit = 8

[registry]
path = "fleet.toml"

[diagnostics.thresholds]
max_halt_level_percent = 7

[diagnostics.hosts.air]
battery_warning_level = 35
"#,
            );
            let cfg = HavenConfig::load(Some(&path)).unwrap();
            assert_eq!(cfg.deploy.concurrency_limit, 8);
            assert_eq!(cfg.deploy.per_target_timeout_sec, 300);
            assert_eq!(cfg.registry_path(), dir.path().join("fleet.toml"));
            assert_eq!(cfg.diagnostics.for_host("air").battery_warning_level, 35);
            assert_eq!(cfg.diagnostics.for_host("air").max_halt_level_percent, 7);
        }

        #[test]
        fn test_missing_explicit_file_is_error() {
            let dir = TempDir::new().unwrap();
            let err = HavenConfig::load(Some(&dir.path().join("nope.toml"))).unwrap_err();
            assert!(matches!(err, CoreError::Config { .. }));
        }

        #[test]
        fn test_unknown_field_rejected() {
            let (_dir, path) = write_config("[deploy]\nparallelism = 3\n");
            assert!(HavenConfig::load(Some(&path)).is_err());
        }

        #[test]
        fn test_invalid_values_rejected() {
            let (_dir, path) = write_config("[deploy]\nconcurrency_limit = 0\n");
            assert!(HavenConfig::load(Some(&path)).is_err());
        }
    }

    mod env_tests {
        use super::*;

        #[test]
        fn test_shortcut_variables() {
            let vars: HashMap<&str, &str> = [
                ("HAVEN_HOST", "10.0.0.9"),
                ("HAVEN_USER", "admin"),
                ("HAVEN_PORT", "2222"),
                ("HAVEN_SSH_KEY", "/keys/id"),
                ("HAVEN_LOG_LEVEL", "debug"),
            ]
            .into_iter()
            .collect();

            let mut cfg = HavenConfig::default();
            cfg.apply_env_overrides(|k| vars.get(k).map(|v| v.to_string()))
                .unwrap();
            assert_eq!(cfg.defaults.host.as_deref(), Some("10.0.0.9"));
            assert_eq!(cfg.defaults.user.as_deref(), Some("admin"));
            assert_eq!(cfg.defaults.port, 2222);
            assert_eq!(cfg.ssh.key_path, Some(PathBuf::from("/keys/id")));
            assert_eq!(cfg.telemetry.log_level, "debug");
        }

        #[test]
        fn test_bad_port_is_config_error() {
            let mut cfg = HavenConfig::default();
            let err = cfg
                .apply_env_overrides(|k| (k == "HAVEN_PORT").then(|| "ssh".to_string()))
                .unwrap_err();
            assert!(matches!(err, CoreError::Config { .. }));
        }
    }
}
