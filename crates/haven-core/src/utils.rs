use std::path::{Path, PathBuf};

pub const OUTPUT_PREVIEW_MAX_LINES: usize = 3;
pub const OUTPUT_PREVIEW_MAX_CHARS_PER_LINE: usize = 60;

/// 截断命令输出，用于状态表格中的预览
pub fn truncate_output_preview(s: &str) -> String {
    let text = s.trim_end();
    if text.is_empty() {
        return String::new();
    }

    let mut out = String::new();
    let mut lines = text.lines();

    for (i, line) in lines.by_ref().take(OUTPUT_PREVIEW_MAX_LINES).enumerate() {
        if i > 0 {
            out.push('\n');
        }

        let mut chars = line.chars();
        out.extend(chars.by_ref().take(OUTPUT_PREVIEW_MAX_CHARS_PER_LINE));
        if chars.next().is_some() {
            out.push_str("...");
        }
    }

    if lines.next().is_some() {
        out.push_str("\n...");
    }
    out
}

/// POSIX shell 单引号转义
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// 展开开头的 `~/`；拿不到 HOME 时原样返回
pub fn expand_tilde(path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(rest),
        None => path.to_path_buf(),
    }
}

/// 远程路径的父目录（相对路径按 home 目录处理）
pub fn remote_parent(remote: &str) -> Option<&str> {
    let trimmed = remote.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    if idx == 0 {
        return Some("/");
    }
    Some(&trimmed[..idx])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_truncates_lines_and_width() {
        let long = "x".repeat(OUTPUT_PREVIEW_MAX_CHARS_PER_LINE + 5);
        let input = format!("{}\nb\nc\nd\n", long);
        let out = truncate_output_preview(&input);
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].ends_with("..."));
        assert_eq!(lines[3], "...");
    }

    #[test]
    fn test_preview_empty() {
        assert_eq!(truncate_output_preview("\n\n"), "");
        assert_eq!(truncate_output_preview("ok\n"), "ok");
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_remote_parent() {
        assert_eq!(remote_parent("bin/tool"), Some("bin"));
        assert_eq!(remote_parent("/usr/local/bin/tool"), Some("/usr/local/bin"));
        assert_eq!(remote_parent("/tool"), Some("/"));
        assert_eq!(remote_parent("tool"), None);
    }

    #[test]
    fn test_expand_tilde_leaves_absolute_paths() {
        assert_eq!(expand_tilde(Path::new("/etc/key")), PathBuf::from("/etc/key"));
    }
}
