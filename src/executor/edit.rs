//! In-place config patches: Op::LineInFile, Op::KeyValue, Op::CmdlineParams,
//! Op::CommentOut
//!
//! The text transforms are pure and return `None` when the text is already in
//! the desired state, so applying a patch twice never duplicates a line.

use anyhow::{Context, Result};
use regex::Regex;

use crate::connection::Connection;
use crate::process::ExecContext;

/// Replace the last line matching `pattern` with `line`, or append `line`.
pub fn line_in_file(text: &str, pattern: &str, line: &str) -> Result<Option<String>> {
    let re = Regex::new(pattern).with_context(|| format!("invalid pattern {:?}", pattern))?;
    let mut lines: Vec<&str> = text.lines().collect();
    match lines.iter().rposition(|existing| re.is_match(existing)) {
        Some(idx) if lines[idx] == line => return Ok(None),
        Some(idx) => lines[idx] = line,
        None if lines.contains(&line) => return Ok(None),
        None => lines.push(line),
    }
    Ok(Some(join_lines(lines)))
}

/// Set the value of every line starting with `key`.
///
/// The key token and the separator run that follows it are kept as they are;
/// only the value is replaced. Lines that merely mention the key (comments,
/// other keys sharing a prefix) are left alone. Without a matching line,
/// `key<separator>value` is appended.
pub fn upsert_key(text: &str, key: &str, value: &str, separator: &str) -> Result<Option<String>> {
    let key_re = regex::escape(key);
    let pattern = if separator.trim().is_empty() {
        format!(r"^(\s*{}\s+)(.*?)\s*$", key_re)
    } else {
        format!(
            r"^(\s*{}\s*{}\s*)(.*?)\s*$",
            key_re,
            regex::escape(separator.trim())
        )
    };
    let re = Regex::new(&pattern).with_context(|| format!("building pattern for key {:?}", key))?;

    let mut found = false;
    let mut changed = false;
    let mut lines = Vec::new();
    for line in text.lines() {
        match re.captures(line) {
            Some(caps) => {
                found = true;
                let prefix = caps.get(1).map_or("", |m| m.as_str());
                let updated = format!("{}{}", prefix, value);
                changed |= updated != line;
                lines.push(updated);
            }
            None => lines.push(line.to_string()),
        }
    }
    if !found {
        lines.push(format!("{}{}{}", key, separator, value));
        changed = true;
    }
    Ok(changed.then(|| join_lines(lines)))
}

/// Ensure kernel command-line parameters in a single-line file.
///
/// `name=value` replaces any parameter with the same name; a bare flag is
/// added when absent. Other parameters keep their order.
pub fn upsert_cmdline_params(text: &str, params: &[String]) -> Option<String> {
    let original: Vec<&str> = text.split_whitespace().collect();
    let mut tokens: Vec<&str> = original.clone();
    for param in params {
        let name = param_name(param);
        match tokens.iter().position(|token| param_name(token) == name) {
            Some(idx) => tokens[idx] = param.as_str(),
            None => tokens.push(param.as_str()),
        }
    }
    (tokens != original).then(|| format!("{}\n", tokens.join(" ")))
}

fn param_name(param: &str) -> &str {
    param.split_once('=').map_or(param, |(name, _)| name)
}

/// Prefix every active (non-blank, non-comment) line with `#`.
pub fn comment_out(text: &str) -> Option<String> {
    let mut changed = false;
    let lines: Vec<String> = text
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                line.to_string()
            } else {
                changed = true;
                format!("#{}", line)
            }
        })
        .collect();
    changed.then(|| join_lines(lines))
}

fn join_lines<S: AsRef<str>>(lines: Vec<S>) -> String {
    let mut out = String::new();
    for line in lines {
        out.push_str(line.as_ref());
        out.push('\n');
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Handle Op::LineInFile. A missing file is created.
pub fn apply_line_in_file(
    conn: &dyn Connection,
    ctx: &ExecContext,
    path: &str,
    regexp: &str,
    line: &str,
) -> Result<bool> {
    let current = conn.read_file(ctx, path)?.unwrap_or_default();
    write_back(conn, ctx, path, line_in_file(&current, regexp, line)?)
}

/// Handle Op::KeyValue. The file must exist.
pub fn apply_key_value(
    conn: &dyn Connection,
    ctx: &ExecContext,
    path: &str,
    key: &str,
    value: &str,
    separator: &str,
) -> Result<bool> {
    let current = read_existing(conn, ctx, path)?;
    write_back(conn, ctx, path, upsert_key(&current, key, value, separator)?)
}

/// Handle Op::CmdlineParams. The file must exist.
pub fn apply_cmdline_params(
    conn: &dyn Connection,
    ctx: &ExecContext,
    path: &str,
    params: &[String],
) -> Result<bool> {
    let current = read_existing(conn, ctx, path)?;
    write_back(conn, ctx, path, upsert_cmdline_params(&current, params))
}

/// Handle Op::CommentOut. A missing file is already neutral.
pub fn apply_comment_out(conn: &dyn Connection, ctx: &ExecContext, path: &str) -> Result<bool> {
    match conn.read_file(ctx, path)? {
        Some(current) => write_back(conn, ctx, path, comment_out(&current)),
        None => Ok(false),
    }
}

fn read_existing(conn: &dyn Connection, ctx: &ExecContext, path: &str) -> Result<String> {
    conn.read_file(ctx, path)?
        .with_context(|| format!("{} does not exist on {}", path, conn.name()))
}

fn write_back(
    conn: &dyn Connection,
    ctx: &ExecContext,
    path: &str,
    updated: Option<String>,
) -> Result<bool> {
    match updated {
        Some(text) => {
            conn.write_file(ctx, path, &text, None)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::fake::FakeConnection;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_upsert_key_preserves_key_and_whitespace() {
        let text = "# window_mode    windowed\nwindow_mode    default\naccel_selmode    yes\n";

        let updated = upsert_key(text, "window_mode", "fullscreen", "    ").unwrap().unwrap();
        assert_eq!(
            updated,
            "# window_mode    windowed\nwindow_mode    fullscreen\naccel_selmode    yes\n"
        );
        assert_eq!(upsert_key(&updated, "window_mode", "fullscreen", "    ").unwrap(), None);
    }

    #[test]
    fn test_upsert_key_keeps_odd_separator_run() {
        let text = "\tkey \t oldvalue\n";
        let updated = upsert_key(text, "key", "newvalue", "    ").unwrap().unwrap();
        assert_eq!(updated, "\tkey \t newvalue\n");
    }

    #[test]
    fn test_upsert_key_ignores_keys_sharing_a_prefix() {
        let text = "menu_prompt    Displays Menu\n";
        let updated = upsert_key(text, "menu", "on", "    ").unwrap().unwrap();
        assert_eq!(updated, "menu_prompt    Displays Menu\nmenu    on\n");
    }

    #[test]
    fn test_upsert_key_with_equals_separator() {
        let text = "# comment\nMODULES=most\nupdate_initramfs = yes\n";
        let updated = upsert_key(text, "update_initramfs", "no", "=").unwrap().unwrap();
        assert_eq!(updated, "# comment\nMODULES=most\nupdate_initramfs = no\n");

        let appended = upsert_key("MODULES=most\n", "update_initramfs", "no", "=").unwrap().unwrap();
        assert_eq!(appended, "MODULES=most\nupdate_initramfs=no\n");
    }

    #[test]
    fn test_upsert_key_escapes_regex_metacharacters() {
        let text = "paths.rom    /old\n";
        let updated = upsert_key(text, "paths.rom", "/new", "    ").unwrap().unwrap();
        assert_eq!(updated, "paths.rom    /new\n");
        assert!(upsert_key("pathsXrom    /old\n", "paths.rom", "/new", "    ")
            .unwrap()
            .unwrap()
            .ends_with("paths.rom    /new\n"));
    }

    #[test]
    fn test_line_in_file_replaces_last_match() {
        let text = "127.0.0.1\tlocalhost\n127.0.1.1\traspberrypi\n";
        let updated = line_in_file(text, r"^127\.0\.1\.1", "127.0.1.1\tarcade1")
            .unwrap()
            .unwrap();
        assert_eq!(updated, "127.0.0.1\tlocalhost\n127.0.1.1\tarcade1\n");
        assert_eq!(
            line_in_file(&updated, r"^127\.0\.1\.1", "127.0.1.1\tarcade1").unwrap(),
            None
        );
    }

    #[test]
    fn test_line_in_file_appends_when_absent() {
        let updated = line_in_file("gpu_mem=64\n", r"^disable_splash=", "disable_splash=1")
            .unwrap()
            .unwrap();
        assert_eq!(updated, "gpu_mem=64\ndisable_splash=1\n");
    }

    #[test]
    fn test_line_in_file_rejects_bad_pattern() {
        assert!(line_in_file("", "(", "x").is_err());
    }

    #[test]
    fn test_cmdline_params_replace_and_append() {
        let text = "console=serial0,115200 console=tty1 root=PARTUUID=abcd-02 rootwait\n";
        let params = vec![
            "consoleblank=0".to_string(),
            "quiet".to_string(),
            "root=PARTUUID=abcd-02".to_string(),
        ];

        let updated = upsert_cmdline_params(text, &params).unwrap();
        assert_eq!(
            updated,
            "console=serial0,115200 console=tty1 root=PARTUUID=abcd-02 rootwait consoleblank=0 quiet\n"
        );
        assert_eq!(upsert_cmdline_params(&updated, &params), None);

        let blank = upsert_cmdline_params(&updated, &["consoleblank=300".to_string()]).unwrap();
        assert!(blank.contains("consoleblank=300"));
        assert!(!blank.contains("consoleblank=0"));
    }

    #[test]
    fn test_comment_out_skips_comments_and_blanks() {
        let text = "/usr/lib/arm-linux-gnueabihf/libarmmem-${PLATFORM}.so\n\n# already\n";
        let updated = comment_out(text).unwrap();
        assert_eq!(
            updated,
            "#/usr/lib/arm-linux-gnueabihf/libarmmem-${PLATFORM}.so\n\n# already\n"
        );
        assert_eq!(comment_out(&updated), None);
    }

    #[test]
    fn test_apply_handlers_on_target() {
        let temp = TempDir::new().unwrap();
        let conn = FakeConnection::new(temp.path());
        let ctx = ExecContext::new();

        // Missing file: nothing to neutralize, line edits create it.
        assert!(!apply_comment_out(&conn, &ctx, "/etc/ld.so.preload").unwrap());
        assert!(apply_line_in_file(&conn, &ctx, "/etc/security/limits.conf", "^pi ", "pi - rtprio 99").unwrap());
        assert!(!apply_line_in_file(&conn, &ctx, "/etc/security/limits.conf", "^pi ", "pi - rtprio 99").unwrap());
        assert!(apply_cmdline_params(&conn, &ctx, "/boot/cmdline.txt", &["quiet".into()]).is_err());

        fs::create_dir_all(temp.path().join("boot")).unwrap();
        fs::write(temp.path().join("boot/cmdline.txt"), "rootwait\n").unwrap();
        assert!(apply_cmdline_params(&conn, &ctx, "/boot/cmdline.txt", &["quiet".into()]).unwrap());
        assert_eq!(
            fs::read_to_string(temp.path().join("boot/cmdline.txt")).unwrap(),
            "rootwait quiet\n"
        );
    }
}
