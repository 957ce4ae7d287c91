use time::UtcOffset;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::TelemetryConfig;

#[derive(Clone, Debug)]
pub struct LogConfig {
    pub level: String,  // trace|debug|info|warn|error，也可以是完整的 EnvFilter 指令
    pub format: String, // text|json
    pub no_ansi: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogConfig {
    pub fn format(&self) -> LogFormat {
        if self.format.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }

    /// `-v` 次数提升日志级别
    pub fn with_verbosity(mut self, verbose: u8) -> Self {
        match verbose {
            0 => {}
            1 => self.level = "debug".to_string(),
            _ => self.level = "trace".to_string(),
        }
        self
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_new(&self.level).unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

impl From<&TelemetryConfig> for LogConfig {
    fn from(cfg: &TelemetryConfig) -> Self {
        Self {
            level: cfg.log_level.clone(),
            format: cfg.log_format.clone(),
            no_ansi: cfg.log_no_ansi,
        }
    }
}

/// 使用提供的配置初始化 tracing；日志写到 stderr，stdout 留给命令输出
pub fn init_tracing_with(cfg: &LogConfig) {
    let base = fmt::layer()
        .with_target(true)
        .with_ansi(!cfg.no_ansi)
        .with_writer(std::io::stderr);
    let fmt_layer = match cfg.format() {
        LogFormat::Json => base.json().boxed(),
        LogFormat::Text => {
            let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
            base.with_timer(fmt::time::OffsetTime::new(
                offset,
                time::format_description::well_known::Rfc3339,
            ))
            .boxed()
        }
    };

    let _ = tracing_subscriber::registry()
        .with(cfg.filter())
        .with(fmt_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(level: &str, format: &str) -> LogConfig {
        LogConfig {
            level: level.into(),
            format: format.into(),
            no_ansi: true,
        }
    }

    #[test]
    fn test_format_parsing() {
        assert_eq!(cfg("info", "JSON").format(), LogFormat::Json);
        assert_eq!(cfg("info", "pretty").format(), LogFormat::Text);
    }

    #[test]
    fn test_verbosity_overrides_level() {
        assert_eq!(cfg("warn", "text").with_verbosity(0).level, "warn");
        assert_eq!(cfg("warn", "text").with_verbosity(1).level, "debug");
        assert_eq!(cfg("warn", "text").with_verbosity(3).level, "trace");
    }

    #[test]
    fn test_init_is_idempotent() {
        init_tracing_with(&cfg("haven_core=debug", "text"));
        init_tracing_with(&cfg("not a [valid filter", "json"));
    }
}
