//! 部署载荷
//!
//! 载荷由 TOML 清单描述，清单中的本地路径相对于清单所在目录：
//!
//! ```toml
//! name = "server-setup"
//! setup_commands = ["bash haven/bin/server_setup.sh"]
//!
//! [[files]]
//! local = "scripts/server_setup.sh"
//! remote = "haven/bin/server_setup.sh"
//! mode = 0o755
//! ```

use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::error::{CoreError, Result, ValidationError};
use crate::utils::{remote_parent, shell_quote};

/// 目标机上部署标记所在目录（相对 home）
pub const MARKER_DIR: &str = ".haven/deployments";

const DEFAULT_FILE_MODE: u32 = 0o644;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadFile {
    pub local: PathBuf,
    pub remote: String,
    pub mode: u32,
}

/// 一次部署要下发的文件和初始化命令，加载后不可变
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentPayload {
    name: String,
    files: Vec<PayloadFile>,
    setup_commands: Vec<String>,
    checksum: String,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    name: String,
    #[serde(default)]
    files: Vec<ManifestFile>,
    #[serde(default)]
    setup_commands: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ManifestFile {
    local: PathBuf,
    remote: String,
    #[serde(default = "default_mode")]
    mode: u32,
}

fn default_mode() -> u32 {
    DEFAULT_FILE_MODE
}

fn invalid(message: impl Into<String>) -> CoreError {
    ValidationError::InvalidPayload(message.into()).into()
}

impl DeploymentPayload {
    /// 从清单文件加载并计算校验和
    pub fn load(manifest_path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(manifest_path)
            .map_err(|e| CoreError::io(manifest_path.display().to_string(), e))?;
        let manifest: Manifest = toml::from_str(&content).map_err(|e| {
            invalid(format!("malformed manifest {}: {}", manifest_path.display(), e))
        })?;

        let base = manifest_path.parent().unwrap_or_else(|| Path::new("."));
        let files = manifest
            .files
            .into_iter()
            .map(|f| PayloadFile {
                local: if f.local.is_absolute() {
                    f.local
                } else {
                    base.join(f.local)
                },
                remote: f.remote,
                mode: f.mode,
            })
            .collect();

        Self::new(manifest.name, files, manifest.setup_commands)
    }

    pub fn new(
        name: impl Into<String>,
        files: Vec<PayloadFile>,
        setup_commands: Vec<String>,
    ) -> Result<Self> {
        let name = name.into();
        validate_name(&name)?;
        if files.is_empty() && setup_commands.is_empty() {
            return Err(invalid(format!("payload '{}' has no files and no setup commands", name)));
        }
        for file in &files {
            validate_remote_path(&file.remote)?;
            if file.mode > 0o7777 {
                return Err(invalid(format!("invalid mode {:o} for {}", file.mode, file.remote)));
            }
        }
        if setup_commands.iter().any(|c| c.trim().is_empty()) {
            return Err(invalid("setup commands cannot be empty"));
        }

        let checksum = compute_checksum(&files, &setup_commands)?;
        Ok(Self {
            name,
            files,
            setup_commands,
            checksum,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn files(&self) -> &[PayloadFile] {
        &self.files
    }

    pub fn setup_commands(&self) -> &[String] {
        &self.setup_commands
    }

    /// 十六进制 SHA-256
    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn marker_path(&self) -> String {
        format!("{}/{}.sha256", MARKER_DIR, self.name)
    }

    /// 远程文件需要的父目录，去重并保持首次出现的顺序
    pub fn remote_dirs(&self) -> Vec<&str> {
        let mut dirs: Vec<&str> = Vec::new();
        for file in &self.files {
            if let Some(dir) = remote_parent(&file.remote) {
                if !dirs.contains(&dir) {
                    dirs.push(dir);
                }
            }
        }
        dirs
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(invalid("payload name cannot be empty"));
    }
    let ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !ok || name.starts_with('.') {
        return Err(invalid(format!(
            "payload name '{}' may only contain letters, digits, '-', '_' and '.'",
            name
        )));
    }
    Ok(())
}

fn validate_remote_path(remote: &str) -> Result<()> {
    if remote.trim().is_empty() || remote.ends_with('/') {
        return Err(invalid(format!("remote path '{}' must name a file", remote)));
    }
    if remote.split('/').any(|seg| seg == "..") {
        return Err(invalid(format!("remote path '{}' must not contain '..'", remote)));
    }
    if remote.chars().any(|c| c.is_whitespace() || c == '\'' || c == ':') {
        return Err(invalid(format!(
            "remote path '{}' contains unsupported characters",
            remote
        )));
    }
    Ok(())
}

/// 覆盖文件内容、远程路径、权限位和初始化命令
fn compute_checksum(files: &[PayloadFile], setup_commands: &[String]) -> Result<String> {
    let mut hasher = Sha256::new();
    for file in files {
        let content = std::fs::read(&file.local).map_err(|e| {
            invalid(format!("cannot read {}: {}", file.local.display(), e))
        })?;
        hasher.update(b"file\0");
        hasher.update(file.remote.as_bytes());
        hasher.update([0u8]);
        hasher.update(file.mode.to_be_bytes());
        hasher.update((content.len() as u64).to_be_bytes());
        hasher.update(&content);
    }
    for command in setup_commands {
        hasher.update(b"cmd\0");
        hasher.update(command.as_bytes());
        hasher.update([0u8]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// 读取部署标记；标记不存在时输出为空
pub fn marker_read_command(marker_path: &str) -> String {
    format!("cat {} 2>/dev/null", shell_quote(marker_path))
}

/// 写入部署标记
pub fn marker_write_command(marker_path: &str, checksum: &str) -> String {
    let dir = remote_parent(marker_path).unwrap_or(MARKER_DIR);
    format!(
        "mkdir -p {} && printf '%s' {} > {}",
        shell_quote(dir),
        shell_quote(checksum),
        shell_quote(marker_path)
    )
}

pub fn mkdir_command(dirs: &[&str]) -> String {
    let quoted: Vec<String> = dirs.iter().map(|d| shell_quote(d)).collect();
    format!("mkdir -p {}", quoted.join(" "))
}

pub fn chmod_command(files: &[PayloadFile]) -> String {
    files
        .iter()
        .map(|f| format!("chmod {:o} {}", f.mode, shell_quote(&f.remote)))
        .collect::<Vec<_>>()
        .join(" && ")
}
