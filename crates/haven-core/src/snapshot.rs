//! 主机电源状态快照

use serde::{Deserialize, Serialize};

/// 当前供电来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PowerSource {
    Ac,
    Battery,
    #[default]
    Unknown,
}

impl PowerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ac => "AC Power",
            Self::Battery => "Battery Power",
            Self::Unknown => "unknown",
        }
    }
}

/// 某一时刻主机的电源/睡眠配置与电池状态（只读值）
///
/// 主机没有上报的设置项为 `None`，对应规则不会触发。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PowerSnapshot {
    /// 系统睡眠时间（分钟，0 表示禁用）
    pub sleep: Option<u32>,
    /// 磁盘睡眠时间（分钟）
    pub disk_sleep: Option<u32>,
    pub standby: Option<bool>,
    pub hibernate_mode: Option<u8>,
    pub power_nap: Option<bool>,
    /// 电池低于该百分比时关机
    pub halt_level: Option<u8>,
    pub halt_after: Option<u32>,
    pub auto_power_off: Option<bool>,
    /// 没有电池的主机为 `None`
    pub battery_pct: Option<u8>,
    pub power_source: PowerSource,
    pub caffeinate_pid: Option<u32>,
}

impl PowerSnapshot {
    pub fn has_battery(&self) -> bool {
        self.battery_pct.is_some()
    }

    pub fn on_battery(&self) -> bool {
        self.power_source == PowerSource::Battery
    }

    /// 已按服务器要求配置好的快照，用于测试和文档示例
    pub fn server_ready() -> Self {
        Self {
            sleep: Some(0),
            disk_sleep: Some(0),
            standby: Some(false),
            hibernate_mode: Some(0),
            power_nap: Some(false),
            halt_level: Some(5),
            halt_after: Some(0),
            auto_power_off: Some(false),
            battery_pct: Some(100),
            power_source: PowerSource::Ac,
            caffeinate_pid: Some(321),
        }
    }
}
