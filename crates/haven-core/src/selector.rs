//! 目标选择器
//!
//! 把用户输入解析为对注册表的选择：
//! - `"all"` | `"true"` -> 所有启用的服务器
//! - `"tag:lab"` / `"tag:lab,arm"` -> 同时带有全部标签且启用的服务器
//! - `"a,b,c"` -> 按名称（或主机地址）逐个解析
//! - `"a"` -> 单台服务器
//!
//! 显式点名的服务器即使被禁用也会被选中。

use std::collections::HashSet;
use std::fmt;
use tracing::debug;

use crate::error::{Result, ValidationError};
use crate::registry::{ServerRecord, ServerRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSelector {
    All,
    Tags(Vec<String>),
    Names(Vec<String>),
}

impl TargetSelector {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(ValidationError::EmptySelector.into());
        }

        let split = |s: &str| -> Vec<String> {
            s.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        };

        let selector = if input == "all" || input == "true" {
            TargetSelector::All
        } else if let Some(tags) = input.strip_prefix("tag:") {
            let tags = split(tags);
            if tags.is_empty() {
                return Err(ValidationError::EmptySelector.into());
            }
            TargetSelector::Tags(tags)
        } else {
            let names = split(input);
            if names.is_empty() {
                return Err(ValidationError::EmptySelector.into());
            }
            TargetSelector::Names(names)
        };
        Ok(selector)
    }

    /// 解析为具体的服务器列表（去重，保持顺序）
    ///
    /// 点名的目标不存在时返回 `UnknownTarget`；结果为空时返回 `NoTargets`。
    pub fn resolve(&self, registry: &ServerRegistry) -> Result<Vec<ServerRecord>> {
        let records: Vec<ServerRecord> = match self {
            TargetSelector::All => registry.list(&[]).into_iter().filter(|r| r.enabled).collect(),
            TargetSelector::Tags(tags) => {
                registry.list(tags).into_iter().filter(|r| r.enabled).collect()
            }
            TargetSelector::Names(names) => {
                let mut seen = HashSet::new();
                let mut out = Vec::with_capacity(names.len());
                for name in names {
                    let record = registry
                        .resolve(name)
                        .ok_or_else(|| ValidationError::UnknownTarget(name.clone()))?;
                    if seen.insert(record.name.clone()) {
                        out.push(record);
                    }
                }
                out
            }
        };

        if records.is_empty() {
            return Err(ValidationError::NoTargets(self.to_string()).into());
        }
        debug!(selector = %self, targets = records.len(), "Selector resolved");
        Ok(records)
    }
}

impl fmt::Display for TargetSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetSelector::All => f.write_str("all"),
            TargetSelector::Tags(tags) => write!(f, "tag:{}", tags.join(",")),
            TargetSelector::Names(names) => f.write_str(&names.join(",")),
        }
    }
}
