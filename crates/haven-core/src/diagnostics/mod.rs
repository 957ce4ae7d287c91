//! 电源状态诊断引擎
//!
//! 引擎本身是纯函数：输入快照、规则表与阈值，输出按严重程度排序的结论列表。
//! 不做任何 I/O，也不在调用之间保存状态，可以被多个调用方并发使用。
//!
//! 规则是数据而不是分支代码，标准规则表见 [`rules::standard_rules`]。

pub mod rules;

use crate::error::exit_code;
use crate::snapshot::PowerSnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub use rules::standard_rules;

/// 结论严重程度，排序为 Info < Warning < Critical
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 一条诊断结论
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
    pub fix_command: Option<String>,
}

/// 诊断阈值；规则只通过这里读取可调参数
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// haltlevel 超过该值即告警
    pub max_halt_level_percent: u8,
    /// 修复命令里建议设置的 haltlevel
    pub recommended_halt_level: u8,
    pub battery_warning_level: u8,
    pub battery_critical_level: u8,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_halt_level_percent: 10,
            recommended_halt_level: 5,
            battery_warning_level: 20,
            battery_critical_level: 10,
        }
    }
}

/// 单台主机的阈值覆盖项，未设置的字段沿用全局值
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ThresholdOverrides {
    pub max_halt_level_percent: Option<u8>,
    pub recommended_halt_level: Option<u8>,
    pub battery_warning_level: Option<u8>,
    pub battery_critical_level: Option<u8>,
}

impl Thresholds {
    pub fn with_overrides(&self, o: &ThresholdOverrides) -> Thresholds {
        Thresholds {
            max_halt_level_percent: o
                .max_halt_level_percent
                .unwrap_or(self.max_halt_level_percent),
            recommended_halt_level: o
                .recommended_halt_level
                .unwrap_or(self.recommended_halt_level),
            battery_warning_level: o
                .battery_warning_level
                .unwrap_or(self.battery_warning_level),
            battery_critical_level: o
                .battery_critical_level
                .unwrap_or(self.battery_critical_level),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_halt_level_percent > 100
            || self.recommended_halt_level > 100
            || self.battery_warning_level > 100
        {
            return Err("threshold percentages must be between 0 and 100".to_string());
        }
        if self.battery_critical_level > self.battery_warning_level {
            return Err(format!(
                "battery_critical_level ({}) must not exceed battery_warning_level ({})",
                self.battery_critical_level, self.battery_warning_level
            ));
        }
        Ok(())
    }
}

/// 全局阈值加按主机名的覆盖项（配置中的 `[diagnostics]` 段）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ThresholdSet {
    pub thresholds: Thresholds,
    pub hosts: BTreeMap<String, ThresholdOverrides>,
}

impl ThresholdSet {
    pub fn for_host(&self, host: &str) -> Thresholds {
        match self.hosts.get(host) {
            Some(overrides) => self.thresholds.with_overrides(overrides),
            None => self.thresholds,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        self.thresholds.validate()?;
        for (host, overrides) in &self.hosts {
            self.thresholds
                .with_overrides(overrides)
                .validate()
                .map_err(|e| format!("diagnostics.hosts.{}: {}", host, e))?;
        }
        Ok(())
    }
}

/// 规则谓词：只读快照和阈值
pub type Predicate = fn(&PowerSnapshot, &Thresholds) -> bool;

/// 一条诊断规则
#[derive(Debug, Clone, Copy)]
pub struct Rule {
    pub id: &'static str,
    pub severity: Severity,
    /// 依赖电池信息；没有电池的主机直接跳过
    pub requires_battery: bool,
    pub predicate: Predicate,
    /// 支持 `{halt_level}` 这类占位符，见 [`render_template`]
    pub message_template: &'static str,
    pub fix_command: Option<&'static str>,
}

impl Rule {
    pub fn applies_to(&self, snapshot: &PowerSnapshot) -> bool {
        !self.requires_battery || snapshot.has_battery()
    }

    pub fn matches(&self, snapshot: &PowerSnapshot, thresholds: &Thresholds) -> bool {
        self.applies_to(snapshot) && (self.predicate)(snapshot, thresholds)
    }

    fn to_finding(&self, snapshot: &PowerSnapshot, thresholds: &Thresholds) -> Finding {
        Finding {
            rule_id: self.id.to_string(),
            severity: self.severity,
            message: render_template(self.message_template, snapshot, thresholds),
            fix_command: self
                .fix_command
                .map(|f| render_template(f, snapshot, thresholds)),
        }
    }
}

/// 评估快照；结果按严重程度降序、规则 id 升序排列
pub fn evaluate(snapshot: &PowerSnapshot, rules: &[Rule], thresholds: &Thresholds) -> Vec<Finding> {
    let mut findings: Vec<Finding> = rules
        .iter()
        .filter(|rule| rule.matches(snapshot, thresholds))
        .map(|rule| rule.to_finding(snapshot, thresholds))
        .collect();

    findings.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| a.rule_id.cmp(&b.rule_id))
    });
    findings
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "n/a".to_string())
}

fn flag(value: Option<bool>) -> String {
    opt(value.map(u8::from))
}

/// 替换模板中的快照/阈值占位符
pub fn render_template(template: &str, s: &PowerSnapshot, t: &Thresholds) -> String {
    if !template.contains('{') {
        return template.to_string();
    }

    let values = [
        ("{sleep}", opt(s.sleep)),
        ("{disk_sleep}", opt(s.disk_sleep)),
        ("{standby}", flag(s.standby)),
        ("{hibernate_mode}", opt(s.hibernate_mode)),
        ("{power_nap}", flag(s.power_nap)),
        ("{halt_level}", opt(s.halt_level)),
        ("{halt_after}", opt(s.halt_after)),
        ("{auto_power_off}", flag(s.auto_power_off)),
        ("{battery_pct}", opt(s.battery_pct)),
        ("{power_source}", s.power_source.as_str().to_string()),
        ("{max_halt_level_percent}", t.max_halt_level_percent.to_string()),
        ("{recommended_halt_level}", t.recommended_halt_level.to_string()),
        ("{battery_warning_level}", t.battery_warning_level.to_string()),
        ("{battery_critical_level}", t.battery_critical_level.to_string()),
    ];

    let mut out = template.to_string();
    for (key, value) in values.iter() {
        if out.contains(key) {
            out = out.replace(key, value);
        }
    }
    out
}

/// pmset 中只作用于电池供电配置的键
const BATTERY_ONLY_KEYS: &[&str] = &["haltlevel", "haltafter"];

/// 把 `set <key> <value>` 形式的修复命令翻译成 pmset 命令（仅用于展示）
pub fn render_pmset(fix: &str) -> String {
    let mut parts = fix.split_whitespace();
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some("set"), Some(key), Some(value), None) => {
            let scope = if BATTERY_ONLY_KEYS.contains(&key) {
                "-b"
            } else {
                "-a"
            };
            format!("sudo pmset {} {} {}", scope, key, value)
        }
        _ => fix.to_string(),
    }
}

/// 单台主机的诊断报告
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticReport {
    pub host: String,
    pub findings: Vec<Finding>,
}

impl DiagnosticReport {
    pub fn new(host: impl Into<String>, findings: Vec<Finding>) -> Self {
        Self {
            host: host.into(),
            findings,
        }
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.findings
            .iter()
            .filter(|f| f.severity == severity)
            .count()
    }

    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn has_critical(&self) -> bool {
        self.count(Severity::Critical) > 0
    }

    pub fn exit_code(&self) -> i32 {
        if self.has_critical() {
            exit_code::PARTIAL_FAILURE
        } else {
            exit_code::SUCCESS
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::PowerSource;

    fn thresholds() -> Thresholds {
        Thresholds::default()
    }

    #[test]
    fn test_clean_snapshot_has_no_findings() {
        let findings = evaluate(&PowerSnapshot::server_ready(), standard_rules(), &thresholds());
        assert!(findings.is_empty(), "{:?}", findings);
    }

    #[test]
    fn test_hibernate_mode_three_yields_single_critical() {
        let snapshot = PowerSnapshot {
            hibernate_mode: Some(3),
            ..PowerSnapshot::server_ready()
        };
        let findings = evaluate(&snapshot, standard_rules(), &thresholds());
        let critical: Vec<_> = findings
            .iter()
            .filter(|f| f.severity == Severity::Critical)
            .collect();
        assert_eq!(critical.len(), 1);
        assert_eq!(critical[0].rule_id, "hibernate-mode");
        assert_eq!(critical[0].fix_command.as_deref(), Some("set hibernatemode 0"));
    }

    #[test]
    fn test_hibernate_mode_zero_yields_nothing_hibernate_related() {
        let snapshot = PowerSnapshot {
            hibernate_mode: Some(0),
            sleep: Some(10),
            ..PowerSnapshot::server_ready()
        };
        let findings = evaluate(&snapshot, standard_rules(), &thresholds());
        assert!(findings.iter().all(|f| f.rule_id != "hibernate-mode"));
        assert!(findings.iter().any(|f| f.rule_id == "system-sleep"));
    }

    #[test]
    fn test_ordering_is_severity_desc_then_id_asc() {
        let snapshot = PowerSnapshot {
            sleep: Some(10),
            hibernate_mode: Some(3),
            standby: Some(true),
            power_nap: Some(true),
            halt_after: Some(60),
            ..PowerSnapshot::server_ready()
        };
        let ids: Vec<String> = evaluate(&snapshot, standard_rules(), &thresholds())
            .into_iter()
            .map(|f| f.rule_id)
            .collect();
        assert_eq!(
            ids,
            vec![
                "hibernate-mode",
                "system-sleep",
                "power-nap",
                "standby",
                "halt-after"
            ]
        );
    }

    #[test]
    fn test_evaluate_is_deterministic() {
        let snapshot = PowerSnapshot {
            sleep: Some(1),
            disk_sleep: Some(10),
            auto_power_off: Some(true),
            caffeinate_pid: None,
            battery_pct: Some(15),
            power_source: PowerSource::Battery,
            ..PowerSnapshot::server_ready()
        };
        let first = evaluate(&snapshot, standard_rules(), &thresholds());
        for _ in 0..20 {
            assert_eq!(evaluate(&snapshot, standard_rules(), &thresholds()), first);
        }
    }

    #[test]
    fn test_evaluate_does_not_mutate_snapshot() {
        let snapshot = PowerSnapshot {
            hibernate_mode: Some(25),
            ..Default::default()
        };
        let before = snapshot.clone();
        let _ = evaluate(&snapshot, standard_rules(), &thresholds());
        assert_eq!(snapshot, before);
    }

    #[test]
    fn test_battery_rules_skipped_without_battery() {
        let snapshot = PowerSnapshot {
            battery_pct: None,
            halt_level: Some(50),
            halt_after: Some(30),
            power_source: PowerSource::Battery,
            ..PowerSnapshot::server_ready()
        };
        let findings = evaluate(&snapshot, standard_rules(), &thresholds());
        assert!(findings.is_empty(), "{:?}", findings);
    }

    #[test]
    fn test_thresholds_drive_halt_level_rule() {
        let snapshot = PowerSnapshot {
            halt_level: Some(8),
            ..PowerSnapshot::server_ready()
        };
        assert!(evaluate(&snapshot, standard_rules(), &thresholds()).is_empty());

        let strict = Thresholds {
            max_halt_level_percent: 5,
            recommended_halt_level: 3,
            ..thresholds()
        };
        let findings = evaluate(&snapshot, standard_rules(), &strict);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].rule_id, "halt-level");
        assert_eq!(findings[0].fix_command.as_deref(), Some("set haltlevel 3"));
        assert!(findings[0].message.contains("8%"));
    }

    #[test]
    fn test_overrides_only_replace_given_fields() {
        let base = Thresholds::default();
        let merged = base.with_overrides(&ThresholdOverrides {
            battery_warning_level: Some(40),
            ..Default::default()
        });
        assert_eq!(merged.battery_warning_level, 40);
        assert_eq!(merged.max_halt_level_percent, base.max_halt_level_percent);
    }

    #[test]
    fn test_threshold_set_per_host() {
        let mut set = ThresholdSet::default();
        set.hosts.insert(
            "air".to_string(),
            ThresholdOverrides {
                max_halt_level_percent: Some(3),
                ..Default::default()
            },
        );
        assert_eq!(set.for_host("air").max_halt_level_percent, 3);
        assert_eq!(set.for_host("mini"), Thresholds::default());
        assert!(set.validate().is_ok());

        set.hosts.insert(
            "bad".to_string(),
            ThresholdOverrides {
                battery_critical_level: Some(90),
                ..Default::default()
            },
        );
        assert!(set.validate().unwrap_err().contains("diagnostics.hosts.bad"));
    }

    #[test]
    fn test_thresholds_validation() {
        assert!(Thresholds::default().validate().is_ok());
        let bad = Thresholds {
            battery_critical_level: 30,
            battery_warning_level: 20,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_render_pmset_scopes() {
        assert_eq!(render_pmset("set hibernatemode 0"), "sudo pmset -a hibernatemode 0");
        assert_eq!(render_pmset("set haltlevel 5"), "sudo pmset -b haltlevel 5");
        assert_eq!(render_pmset("caffeinate -imsud"), "caffeinate -imsud");
    }

    #[test]
    fn test_report_exit_code() {
        let clean = DiagnosticReport::new("local", vec![]);
        assert!(clean.is_clean());
        assert_eq!(clean.exit_code(), exit_code::SUCCESS);

        let snapshot = PowerSnapshot {
            hibernate_mode: Some(3),
            ..PowerSnapshot::server_ready()
        };
        let report = DiagnosticReport::new(
            "mini",
            evaluate(&snapshot, standard_rules(), &thresholds()),
        );
        assert!(report.has_critical());
        assert_eq!(report.exit_code(), exit_code::PARTIAL_FAILURE);
    }
}
