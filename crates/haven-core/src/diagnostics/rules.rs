//! 标准规则表
//!
//! 每条规则是一行数据：id、严重程度、谓词、消息模板和修复命令。
//! 修复命令统一写成 `set <pmset 键> <值>`，展示时由 `render_pmset` 翻译。

use super::{Rule, Severity, Thresholds};
use crate::snapshot::PowerSnapshot;

fn hibernate_enabled(s: &PowerSnapshot, _: &Thresholds) -> bool {
    s.hibernate_mode.is_some_and(|m| m != 0)
}

fn system_sleep_enabled(s: &PowerSnapshot, _: &Thresholds) -> bool {
    s.sleep.is_some_and(|m| m != 0)
}

fn disk_sleep_enabled(s: &PowerSnapshot, _: &Thresholds) -> bool {
    s.disk_sleep.is_some_and(|m| m != 0)
}

fn standby_enabled(s: &PowerSnapshot, _: &Thresholds) -> bool {
    s.standby == Some(true)
}

fn power_nap_enabled(s: &PowerSnapshot, _: &Thresholds) -> bool {
    s.power_nap == Some(true)
}

fn auto_power_off_enabled(s: &PowerSnapshot, _: &Thresholds) -> bool {
    s.auto_power_off == Some(true)
}

fn halt_level_too_high(s: &PowerSnapshot, t: &Thresholds) -> bool {
    s.halt_level.is_some_and(|l| l > t.max_halt_level_percent)
}

fn halt_after_set(s: &PowerSnapshot, _: &Thresholds) -> bool {
    s.halt_after.is_some_and(|m| m != 0)
}

fn caffeinate_missing(s: &PowerSnapshot, _: &Thresholds) -> bool {
    s.caffeinate_pid.is_none()
}

fn running_on_battery(s: &PowerSnapshot, _: &Thresholds) -> bool {
    s.on_battery()
}

fn battery_critical(s: &PowerSnapshot, t: &Thresholds) -> bool {
    s.on_battery() && s.battery_pct.is_some_and(|p| p <= t.battery_critical_level)
}

fn battery_low(s: &PowerSnapshot, t: &Thresholds) -> bool {
    s.on_battery()
        && s
            .battery_pct
            .is_some_and(|p| p > t.battery_critical_level && p <= t.battery_warning_level)
}

static STANDARD_RULES: [Rule; 12] = [
    Rule {
        id: "auto-power-off",
        severity: Severity::Warning,
        requires_battery: false,
        predicate: auto_power_off_enabled,
        message_template: "autopoweroff is enabled; the machine may power off after extended standby",
        fix_command: Some("set autopoweroff 0"),
    },
    Rule {
        id: "battery-critical",
        severity: Severity::Critical,
        requires_battery: true,
        predicate: battery_critical,
        message_template: "running on battery at {battery_pct}% (critical level {battery_critical_level}%)",
        fix_command: None,
    },
    Rule {
        id: "battery-low",
        severity: Severity::Warning,
        requires_battery: true,
        predicate: battery_low,
        message_template: "running on battery at {battery_pct}% (warning level {battery_warning_level}%)",
        fix_command: None,
    },
    Rule {
        id: "caffeinate-missing",
        severity: Severity::Warning,
        requires_battery: false,
        predicate: caffeinate_missing,
        message_template: "no caffeinate process is holding the system awake",
        fix_command: Some("caffeinate -imsud"),
    },
    Rule {
        id: "disk-sleep",
        severity: Severity::Warning,
        requires_battery: false,
        predicate: disk_sleep_enabled,
        message_template: "disksleep is {disk_sleep} minutes; disks spin down while serving",
        fix_command: Some("set disksleep 0"),
    },
    Rule {
        id: "halt-after",
        severity: Severity::Info,
        requires_battery: true,
        predicate: halt_after_set,
        message_template: "haltafter is {halt_after} minutes; battery shutdown is time-based",
        fix_command: Some("set haltafter 0"),
    },
    Rule {
        id: "halt-level",
        severity: Severity::Warning,
        requires_battery: true,
        predicate: halt_level_too_high,
        message_template: "haltlevel is {halt_level}%, above the {max_halt_level_percent}% limit; the machine shuts down early on battery",
        fix_command: Some("set haltlevel {recommended_halt_level}"),
    },
    Rule {
        id: "hibernate-mode",
        severity: Severity::Critical,
        requires_battery: false,
        predicate: hibernate_enabled,
        message_template: "hibernatemode is {hibernate_mode}; the machine hibernates instead of staying up",
        fix_command: Some("set hibernatemode 0"),
    },
    Rule {
        id: "on-battery",
        severity: Severity::Info,
        requires_battery: true,
        predicate: running_on_battery,
        message_template: "running on battery power ({battery_pct}%)",
        fix_command: None,
    },
    Rule {
        id: "power-nap",
        severity: Severity::Warning,
        requires_battery: false,
        predicate: power_nap_enabled,
        message_template: "powernap is enabled; background wakeups interrupt sleep settings",
        fix_command: Some("set powernap 0"),
    },
    Rule {
        id: "standby",
        severity: Severity::Warning,
        requires_battery: false,
        predicate: standby_enabled,
        message_template: "standby is enabled; the machine enters deep sleep when idle",
        fix_command: Some("set standby 0"),
    },
    Rule {
        id: "system-sleep",
        severity: Severity::Critical,
        requires_battery: false,
        predicate: system_sleep_enabled,
        message_template: "system sleep is {sleep} minutes; the machine goes to sleep when idle",
        fix_command: Some("set sleep 0"),
    },
];

/// 标准规则表
pub fn standard_rules() -> &'static [Rule] {
    &STANDARD_RULES
}

/// 按 id 查找标准规则
pub fn find_rule(id: &str) -> Option<&'static Rule> {
    STANDARD_RULES.iter().find(|r| r.id == id)
}
