//! 电源状态采集
//!
//! 通过 `pmset` 与 `pgrep` 的输出构造 [`PowerSnapshot`]。
//! 文本解析只在本模块的 `parse_*` 函数里进行，诊断引擎只接触解析后的快照。

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::{CoreError, ExecutionError, Result};
use crate::executor::RemoteExecutor;
use crate::registry::ServerRecord;
use crate::snapshot::{PowerSnapshot, PowerSource};
use crate::transport::CommandOutput;

pub const PMSET_SETTINGS_CMD: &str = "pmset -g";
pub const PMSET_BATTERY_CMD: &str = "pmset -g batt";
pub const CAFFEINATE_CMD: &str = "pgrep -x caffeinate";

/// 采集对象
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeTarget {
    Local,
    Remote(ServerRecord),
}

impl ProbeTarget {
    pub fn name(&self) -> &str {
        match self {
            ProbeTarget::Local => "local",
            ProbeTarget::Remote(record) => record.name.as_str(),
        }
    }
}

/// 快照来源
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(&self, target: &ProbeTarget) -> Result<PowerSnapshot>;
}

/// 解析 `pmset -g` 的设置项
pub fn parse_pmset_settings(output: &str, snapshot: &mut PowerSnapshot) {
    for line in output.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(value) = value.parse::<u32>() else {
            continue;
        };
        match key {
            "sleep" => snapshot.sleep = Some(value),
            "disksleep" => snapshot.disk_sleep = Some(value),
            "standby" => snapshot.standby = Some(value == 1),
            "hibernatemode" => snapshot.hibernate_mode = u8::try_from(value).ok(),
            "powernap" => snapshot.power_nap = Some(value == 1),
            "haltlevel" => snapshot.halt_level = u8::try_from(value).ok(),
            "haltafter" => snapshot.halt_after = Some(value),
            "autopoweroff" => snapshot.auto_power_off = Some(value == 1),
            _ => {}
        }
    }
}

/// 解析 `pmset -g batt`：供电来源和电量百分比
pub fn parse_pmset_battery(output: &str, snapshot: &mut PowerSnapshot) {
    snapshot.power_source = if output.contains("Battery Power") {
        PowerSource::Battery
    } else if output.contains("AC Power") {
        PowerSource::Ac
    } else {
        PowerSource::Unknown
    };
    snapshot.battery_pct = output.lines().find_map(parse_percentage);
}

/// 取一行中 `%` 之前紧挨着的数字
fn parse_percentage(line: &str) -> Option<u8> {
    let idx = line.find('%')?;
    let head = &line[..idx];
    let start = head
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    let digits = &head[start..];
    if digits.is_empty() {
        return None;
    }
    digits.parse::<u8>().ok().filter(|p| *p <= 100)
}

/// 解析 `pgrep` 输出的第一个 pid
pub fn parse_pgrep(output: &str) -> Option<u32> {
    output
        .lines()
        .find_map(|line| line.trim().parse::<u32>().ok())
}

/// 组合三段命令输出
pub fn parse_snapshot(settings: &str, battery: &str, pgrep: &str) -> PowerSnapshot {
    let mut snapshot = PowerSnapshot::default();
    parse_pmset_settings(settings, &mut snapshot);
    parse_pmset_battery(battery, &mut snapshot);
    snapshot.caffeinate_pid = parse_pgrep(pgrep);
    snapshot
}

fn require_success(command: &str, output: CommandOutput) -> Result<CommandOutput> {
    if output.success() {
        Ok(output)
    } else {
        Err(ExecutionError::NonZeroExit {
            command: command.to_string(),
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        }
        .into())
    }
}

/// 在本机执行 pmset/pgrep
#[derive(Debug, Clone)]
pub struct LocalProbe {
    command_timeout: Duration,
}

impl LocalProbe {
    pub fn new(command_timeout: Duration) -> Self {
        Self { command_timeout }
    }

    async fn run(&self, command: &str) -> Result<CommandOutput> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CoreError::io(command, e))?;

        let out = tokio::time::timeout(self.command_timeout, child.wait_with_output())
            .await
            .map_err(|_| ExecutionError::CommandTimeout {
                command: command.to_string(),
                timeout: self.command_timeout,
            })?
            .map_err(|e| CoreError::io(command, e))?;

        Ok(CommandOutput {
            exit_code: out.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&out.stdout).to_string(),
            stderr: String::from_utf8_lossy(&out.stderr).to_string(),
        })
    }

    pub async fn collect(&self) -> Result<PowerSnapshot> {
        let settings = require_success(PMSET_SETTINGS_CMD, self.run(PMSET_SETTINGS_CMD).await?)?;
        let battery = require_success(PMSET_BATTERY_CMD, self.run(PMSET_BATTERY_CMD).await?)?;
        // pgrep 没有匹配时退出码为 1
        let pgrep = self.run(CAFFEINATE_CMD).await?;
        let snapshot = parse_snapshot(&settings.stdout, &battery.stdout, &pgrep.stdout);
        debug!(host = "local", ?snapshot, "Local power snapshot collected");
        Ok(snapshot)
    }
}

#[async_trait]
impl SnapshotSource for LocalProbe {
    async fn snapshot(&self, target: &ProbeTarget) -> Result<PowerSnapshot> {
        match target {
            ProbeTarget::Local => self.collect().await,
            ProbeTarget::Remote(record) => Err(CoreError::config(format!(
                "local probe cannot sample remote server '{}'",
                record.name
            ))),
        }
    }
}

/// 通过远程执行器采集；本机目标委托给 [`LocalProbe`]
#[derive(Clone)]
pub struct RemoteProbe {
    executor: RemoteExecutor,
    local: LocalProbe,
}

impl RemoteProbe {
    pub fn new(executor: RemoteExecutor) -> Self {
        let local = LocalProbe::new(executor.command_timeout());
        Self { executor, local }
    }

    pub async fn collect(&self, record: &ServerRecord) -> Result<PowerSnapshot> {
        let executor = self.executor.clone();
        let snapshot = self
            .executor
            .with_session(record, move |session| {
                Box::pin(async move {
                    let settings = executor.run_checked(session, PMSET_SETTINGS_CMD).await?;
                    let battery = executor.run_checked(session, PMSET_BATTERY_CMD).await?;
                    let pgrep = executor.run_command(session, CAFFEINATE_CMD).await?;
                    Ok(parse_snapshot(&settings.stdout, &battery.stdout, &pgrep.stdout))
                })
            })
            .await?;
        debug!(server = %record.name, ?snapshot, "Remote power snapshot collected");
        Ok(snapshot)
    }
}

#[async_trait]
impl SnapshotSource for RemoteProbe {
    async fn snapshot(&self, target: &ProbeTarget) -> Result<PowerSnapshot> {
        match target {
            ProbeTarget::Local => self.local.collect().await,
            ProbeTarget::Remote(record) => self.collect(record).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS: &str = "\
System-wide power settings:
 SleepDisabled\t\t0
Currently in use:
 standby              1
 Sleep On Power Button 1
 hibernatefile        /var/vm/sleepimage
 powernap             1
 disksleep            10
 sleep                1 (sleep prevented by caffeinate)
 hibernatemode        3
 haltlevel            15
 haltafter            0
 autopoweroff         1
 displaysleep         10
";

    const BATTERY: &str = "\
Now drawing from 'Battery Power'
 -InternalBattery-0 (id=4653155)\t85%; discharging; 4:20 remaining present: true
";

    mod parse_tests {
        use super::*;

        #[test]
        fn test_settings_extracts_every_field() {
            let snapshot = parse_snapshot(SETTINGS, BATTERY, "412\n");
            assert_eq!(snapshot.sleep, Some(1));
            assert_eq!(snapshot.disk_sleep, Some(10));
            assert_eq!(snapshot.standby, Some(true));
            assert_eq!(snapshot.hibernate_mode, Some(3));
            assert_eq!(snapshot.power_nap, Some(true));
            assert_eq!(snapshot.halt_level, Some(15));
            assert_eq!(snapshot.halt_after, Some(0));
            assert_eq!(snapshot.auto_power_off, Some(true));
            assert_eq!(snapshot.battery_pct, Some(85));
            assert_eq!(snapshot.power_source, PowerSource::Battery);
            assert_eq!(snapshot.caffeinate_pid, Some(412));
        }

        #[test]
        fn test_desktop_without_battery() {
            let snapshot = parse_snapshot(
                " sleep 0\n hibernatemode 0\n",
                "Now drawing from 'AC Power'\n",
                "",
            );
            assert_eq!(snapshot.power_source, PowerSource::Ac);
            assert_eq!(snapshot.battery_pct, None);
            assert_eq!(snapshot.caffeinate_pid, None);
            assert_eq!(snapshot.standby, None);
        }

        #[test]
        fn test_percentage_edge_cases() {
            assert_eq!(parse_percentage("\t100%; charged"), Some(100));
            assert_eq!(parse_percentage("no digits %"), None);
            assert_eq!(parse_percentage("nothing here"), None);
            assert_eq!(parse_percentage("999%"), None);
        }

        #[test]
        fn test_unknown_source() {
            let mut snapshot = PowerSnapshot::default();
            parse_pmset_battery("garbage", &mut snapshot);
            assert_eq!(snapshot.power_source, PowerSource::Unknown);
        }
    }

    #[test]
    fn test_target_names() {
        assert_eq!(ProbeTarget::Local.name(), "local");
        let record = ServerRecord::new("mini", "h", "u");
        assert_eq!(ProbeTarget::Remote(record).name(), "mini");
    }
}
