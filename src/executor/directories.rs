//! Directory operation handlers: Op::Dirs, Op::Migrate

use anyhow::{bail, Result};
use std::path::Path;
use tracing::{info, warn};

use crate::connection::Connection;
use crate::process::ExecContext;

/// Handle Op::Dirs: create every missing directory.
pub fn ensure_dirs(conn: &dyn Connection, ctx: &ExecContext, paths: &[String]) -> Result<bool> {
    let mut changed = false;
    for path in paths {
        if conn.is_dir(ctx, path)? {
            continue;
        }
        if conn.exists(ctx, path)? {
            bail!("{} exists on {} but is not a directory", path, conn.name());
        }
        conn.create_dir_all(ctx, path)?;
        changed = true;
    }
    Ok(changed)
}

/// Handle Op::Migrate: move a legacy path to its new location.
///
/// Runs only when `from` exists and `to` does not. When both exist the
/// migration already happened once and something recreated the legacy path;
/// both are left alone.
pub fn migrate(conn: &dyn Connection, ctx: &ExecContext, from: &str, to: &str) -> Result<bool> {
    if !conn.exists(ctx, from)? {
        return Ok(false);
    }
    if conn.exists(ctx, to)? {
        warn!(host = %conn.name(), from, to, "legacy and migrated paths both exist, leaving both");
        return Ok(false);
    }
    if let Some(parent) = parent_of(to) {
        conn.create_dir_all(ctx, parent)?;
    }
    conn.rename(ctx, from, to)?;
    info!(host = %conn.name(), from, to, "migrated");
    Ok(true)
}

fn parent_of(path: &str) -> Option<&str> {
    Path::new(path)
        .parent()
        .and_then(Path::to_str)
        .filter(|parent| !parent.is_empty() && *parent != "/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::fake::FakeConnection;
    use std::fs;
    use tempfile::TempDir;

    fn target() -> (TempDir, FakeConnection) {
        let temp = TempDir::new().unwrap();
        let conn = FakeConnection::new(temp.path());
        (temp, conn)
    }

    #[test]
    fn test_ensure_dirs_creates_nested_structure_once() {
        let (temp, conn) = target();
        let paths = vec![
            "/home/pi/.attract/romlists".to_string(),
            "/home/pi/.attract/mame/nvram".to_string(),
        ];

        assert!(ensure_dirs(&conn, &ExecContext::new(), &paths).unwrap());
        assert!(!ensure_dirs(&conn, &ExecContext::new(), &paths).unwrap());
        assert!(temp.path().join("home/pi/.attract/mame/nvram").is_dir());
    }

    #[test]
    fn test_ensure_dirs_rejects_file_in_the_way() {
        let (temp, conn) = target();
        fs::write(temp.path().join("stats"), "").unwrap();

        let result = ensure_dirs(&conn, &ExecContext::new(), &["/stats".to_string()]);
        assert!(result.is_err());
    }

    #[test]
    fn test_migrate_renames_exactly_once() {
        let (temp, conn) = target();
        let legacy = temp.path().join("home/pi/.attract/mame-roms");
        fs::create_dir_all(&legacy).unwrap();
        fs::write(legacy.join("pacman.zip"), "rom").unwrap();

        let from = "/home/pi/.attract/mame-roms";
        let to = "/home/pi/.attract/mame/roms";
        assert!(migrate(&conn, &ExecContext::new(), from, to).unwrap());
        assert!(!migrate(&conn, &ExecContext::new(), from, to).unwrap());

        assert!(!legacy.exists());
        assert_eq!(
            fs::read_to_string(temp.path().join("home/pi/.attract/mame/roms/pacman.zip")).unwrap(),
            "rom"
        );
    }

    #[test]
    fn test_migrate_leaves_both_when_target_exists() {
        let (temp, conn) = target();
        fs::create_dir_all(temp.path().join("old")).unwrap();
        fs::create_dir_all(temp.path().join("new")).unwrap();

        assert!(!migrate(&conn, &ExecContext::new(), "/old", "/new").unwrap());
        assert!(temp.path().join("old").is_dir());
    }

    #[test]
    fn test_parent_of() {
        assert_eq!(parent_of("/home/pi/.attract/mame/roms"), Some("/home/pi/.attract/mame"));
        assert_eq!(parent_of("/roms"), None);
        assert_eq!(parent_of("roms"), None);
    }
}
