//! 服务器注册表
//!
//! 持久化为一个 TOML 文件（`[[servers]]` 数组，保持插入顺序）。
//! 所有修改都在写锁内完成落盘：同目录临时文件 → fsync → rename，
//! 因此修改是串行的，进程崩溃也不会留下半写的文件。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use crate::core_types::ServerName;
use crate::error::{CoreError, Result, ValidationError};

pub const DEFAULT_SSH_PORT: u16 = 22;

/// 注册表中的一台服务器
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub name: ServerName,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_key_path: Option<PathBuf>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 最近一次部署成功或连通性测试成功的时间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

fn default_enabled() -> bool {
    true
}

impl ServerRecord {
    pub fn new(name: impl Into<String>, host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            name: ServerName::new(name),
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            user: user.into(),
            auth_key_path: None,
            tags: BTreeSet::new(),
            enabled: true,
            last_seen: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.auth_key_path = Some(path.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// `user@host:port`，用于日志和错误信息
    pub fn endpoint(&self) -> String {
        format!("{}@{}:{}", self.user, self.host, self.port)
    }

    pub fn has_all_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|t| self.tags.contains(t))
    }

    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidRecord {
            name: self.name.to_string(),
            reason: reason.to_string(),
        };
        if self.name.as_str().trim().is_empty() {
            return Err(invalid("name cannot be empty"));
        }
        if self.host.trim().is_empty() {
            return Err(invalid("host cannot be empty"));
        }
        if self.user.trim().is_empty() {
            return Err(invalid("user cannot be empty"));
        }
        if self.port == 0 {
            return Err(invalid("port must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    servers: Vec<ServerRecord>,
}

/// 服务器注册表；读多写少，用一把读写锁保护
#[derive(Debug)]
pub struct ServerRegistry {
    path: PathBuf,
    records: RwLock<Vec<ServerRecord>>,
}

impl ServerRegistry {
    /// 打开注册表文件；文件不存在视为空注册表
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = match fs::read_to_string(&path) {
            Ok(content) => parse_records(&path, &content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "registry file not found, starting empty");
                Vec::new()
            }
            Err(e) => return Err(CoreError::io(path.display().to_string(), e)),
        };

        info!(path = %path.display(), servers = records.len(), "Server registry loaded");
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<ServerRecord>> {
        self.records.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<ServerRecord>> {
        self.records.write().unwrap_or_else(|e| e.into_inner())
    }

    /// 在写锁内修改副本并落盘，成功后再替换内存状态
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut Vec<ServerRecord>) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.write();
        let mut next = guard.clone();
        let out = f(&mut next)?;
        persist(&self.path, &next)?;
        *guard = next;
        Ok(out)
    }

    pub fn add(&self, record: ServerRecord) -> Result<()> {
        record.validate()?;
        let name = record.name.clone();
        self.mutate(|records| {
            if records.iter().any(|r| r.name == record.name) {
                return Err(ValidationError::DuplicateName(record.name.to_string()).into());
            }
            records.push(record);
            Ok(())
        })?;
        info!(server = %name, "Server added to registry");
        Ok(())
    }

    /// 替换同名记录，位置不变
    pub fn update(&self, record: ServerRecord) -> Result<()> {
        record.validate()?;
        let name = record.name.clone();
        self.mutate(|records| {
            let slot = records
                .iter_mut()
                .find(|r| r.name == record.name)
                .ok_or_else(|| ValidationError::NotFound(record.name.to_string()))?;
            *slot = record;
            Ok(())
        })?;
        info!(server = %name, "Server record updated");
        Ok(())
    }

    pub fn touch(&self, name: &str, when: DateTime<Utc>) -> Result<()> {
        self.mutate(|records| {
            let slot = records
                .iter_mut()
                .find(|r| r.name == name)
                .ok_or_else(|| ValidationError::NotFound(name.to_string()))?;
            slot.last_seen = Some(when);
            Ok(())
        })?;
        debug!(server = %name, last_seen = %when, "Server marked as seen");
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<ServerRecord> {
        let removed = self.mutate(|records| {
            let idx = records
                .iter()
                .position(|r| r.name == name)
                .ok_or_else(|| ValidationError::NotFound(name.to_string()))?;
            Ok(records.remove(idx))
        })?;
        info!(server = %name, "Server removed from registry");
        Ok(removed)
    }

    pub fn get(&self, name: &str) -> Option<ServerRecord> {
        self.read().iter().find(|r| r.name == name).cloned()
    }

    /// 先按名称精确匹配，再按主机地址匹配
    pub fn resolve(&self, name_or_host: &str) -> Option<ServerRecord> {
        let records = self.read();
        records
            .iter()
            .find(|r| r.name == name_or_host)
            .or_else(|| records.iter().find(|r| r.host == name_or_host))
            .cloned()
    }

    /// 按插入顺序列出；过滤条件要求记录包含全部给定标签
    pub fn list(&self, tags: &[String]) -> Vec<ServerRecord> {
        self.read()
            .iter()
            .filter(|r| r.has_all_tags(tags))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

fn parse_records(path: &Path, content: &str) -> Result<Vec<ServerRecord>> {
    let file: RegistryFile = toml::from_str(content).map_err(|e| {
        CoreError::config(format!("malformed registry {}: {}", path.display(), e))
    })?;

    let mut seen = HashSet::new();
    for record in &file.servers {
        record
            .validate()
            .map_err(|e| CoreError::config(format!("registry {}: {}", path.display(), e)))?;
        if !seen.insert(record.name.clone()) {
            return Err(CoreError::config(format!(
                "registry {}: duplicate server name '{}'",
                path.display(),
                record.name
            )));
        }
    }
    Ok(file.servers)
}

/// 原子写入：同目录临时文件 → fsync → rename → fsync 目录
fn persist(path: &Path, records: &[ServerRecord]) -> Result<()> {
    let body = toml::to_string_pretty(&RegistryFile {
        servers: records.to_vec(),
    })
    .map_err(|e| CoreError::config(format!("failed to serialize registry: {}", e)))?;

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).map_err(|e| CoreError::io(parent.display().to_string(), e))?;

    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("servers.toml");
    let tmp_path = parent.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let write_tmp = || -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        file.write_all(body.as_bytes())?;
        file.sync_all()
    };
    if let Err(e) = write_tmp() {
        let _ = fs::remove_file(&tmp_path);
        return Err(CoreError::io(tmp_path.display().to_string(), e));
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(CoreError::io(path.display().to_string(), e));
    }

    if let Ok(dir) = OpenOptions::new().read(true).open(&parent) {
        let _ = dir.sync_all();
    }
    debug!(path = %path.display(), servers = records.len(), "Registry persisted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn registry() -> (TempDir, ServerRegistry) {
        let dir = TempDir::new().unwrap();
        let reg = ServerRegistry::open(dir.path().join("servers.toml")).unwrap();
        (dir, reg)
    }

    mod record_tests {
        use super::*;

        #[test]
        fn test_endpoint_format() {
            let r = ServerRecord::new("mini", "10.0.0.5", "admin").with_port(2222);
            assert_eq!(r.endpoint(), "admin@10.0.0.5:2222");
        }

        #[test]
        fn test_validate_rejects_bad_fields() {
            assert!(ServerRecord::new("", "h", "u").validate().is_err());
            assert!(ServerRecord::new("n", " ", "u").validate().is_err());
            assert!(ServerRecord::new("n", "h", "").validate().is_err());
            assert!(ServerRecord::new("n", "h", "u").with_port(0).validate().is_err());
            assert!(ServerRecord::new("n", "h", "u").validate().is_ok());
        }

        #[test]
        fn test_tag_matching_requires_all() {
            let r = ServerRecord::new("n", "h", "u").with_tags(["lab", "arm"]);
            assert!(r.has_all_tags(&[]));
            assert!(r.has_all_tags(&["lab".to_string()]));
            assert!(!r.has_all_tags(&["lab".to_string(), "x86".to_string()]));
        }
    }

    mod registry_tests {
        use super::*;

        #[test]
        fn test_missing_file_is_empty() {
            let (_dir, reg) = registry();
            assert!(reg.is_empty());
        }

        #[test]
        fn test_duplicate_name_rejected() {
            let (_dir, reg) = registry();
            reg.add(ServerRecord::new("a", "h1", "u")).unwrap();
            let err = reg.add(ServerRecord::new("a", "h2", "u")).unwrap_err();
            assert!(matches!(
                err,
                CoreError::Validation(ValidationError::DuplicateName(ref n)) if n == "a"
            ));
            assert_eq!(reg.len(), 1);
            assert_eq!(reg.get("a").unwrap().host, "h1");
        }

        #[test]
        fn test_remove_missing_is_not_found() {
            let (_dir, reg) = registry();
            assert!(matches!(
                reg.remove("ghost"),
                Err(CoreError::Validation(ValidationError::NotFound(_)))
            ));
        }

        #[test]
        fn test_update_keeps_position() {
            let (_dir, reg) = registry();
            reg.add(ServerRecord::new("a", "h1", "u")).unwrap();
            reg.add(ServerRecord::new("b", "h2", "u")).unwrap();
            reg.update(ServerRecord::new("a", "h9", "root")).unwrap();
            let names: Vec<_> = reg.list(&[]).into_iter().map(|r| r.host).collect();
            assert_eq!(names, vec!["h9", "h2"]);
            assert!(reg.update(ServerRecord::new("zz", "h", "u")).is_err());
        }

        #[test]
        fn test_resolve_by_name_then_host() {
            let (_dir, reg) = registry();
            reg.add(ServerRecord::new("a", "10.0.0.1", "u")).unwrap();
            reg.add(ServerRecord::new("10.0.0.1", "10.0.0.2", "u")).unwrap();
            assert_eq!(reg.resolve("10.0.0.1").unwrap().host, "10.0.0.2");
            assert_eq!(reg.resolve("10.0.0.2").unwrap().name, "10.0.0.1");
            assert!(reg.resolve("nope").is_none());
        }

        #[test]
        fn test_touch_sets_last_seen() {
            let (_dir, reg) = registry();
            reg.add(ServerRecord::new("a", "h", "u")).unwrap();
            let now = Utc::now();
            reg.touch("a", now).unwrap();
            assert_eq!(reg.get("a").unwrap().last_seen, Some(now));
            assert!(reg.touch("b", now).is_err());
        }

        #[test]
        fn test_failed_mutation_leaves_no_temp_files() {
            let (dir, reg) = registry();
            reg.add(ServerRecord::new("a", "h", "u")).unwrap();
            let _ = reg.add(ServerRecord::new("a", "h", "u"));
            let entries: Vec<_> = fs::read_dir(dir.path())
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
                .collect();
            assert_eq!(entries, vec!["servers.toml".to_string()]);
        }
    }
}
