//! This host, plus the filesystem helpers shared by every target whose files
//! are reachable from here.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::Connection;
use crate::process::{Cmd, CmdOutput};

/// Commands and files on the machine running the provisioner.
pub struct LocalConnection {
    name: String,
    root: PathBuf,
    login: String,
}

impl LocalConnection {
    /// The host itself, rooted at `/`.
    pub fn host() -> Self {
        // SAFETY: geteuid has no preconditions and cannot fail.
        let login = if unsafe { libc::geteuid() } == 0 {
            "root".to_string()
        } else {
            std::env::var("USER").unwrap_or_else(|_| "root".to_string())
        };
        Self {
            name: "localhost".to_string(),
            root: PathBuf::from("/"),
            login,
        }
    }
}

impl Connection for LocalConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn login_user(&self) -> &str {
        &self.login
    }

    fn exec(&self, cmd: &Cmd) -> Result<CmdOutput> {
        cmd.run()
    }

    fn local_root(&self) -> Option<&Path> {
        Some(&self.root)
    }
}

pub(crate) fn write_file(path: &Path, content: &str, mode: Option<u32>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .with_context(|| format!("chmod {:o} {}", mode, path.display()))?;
    }
    Ok(())
}

pub(crate) fn remove_all(path: &Path) -> Result<()> {
    let Ok(meta) = path.symlink_metadata() else {
        return Ok(());
    };
    if meta.is_dir() {
        fs::remove_dir_all(path).with_context(|| format!("removing {}", path.display()))
    } else {
        fs::remove_file(path).with_context(|| format!("removing {}", path.display()))
    }
}

/// Copy `src` over `dst` unless both already hold the same bytes.
pub(crate) fn copy_if_changed(src: &Path, dst: &Path) -> Result<bool> {
    if dst.is_file() && sha256_file(src)? == sha256_file(dst)? {
        return Ok(false);
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::copy(src, dst)
        .with_context(|| format!("copying {} -> {}", src.display(), dst.display()))?;
    Ok(true)
}

pub(crate) fn set_mtime(path: &Path, mtime: SystemTime) -> Result<()> {
    let file = File::options()
        .write(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    file.set_modified(mtime)
        .with_context(|| format!("setting mtime of {}", path.display()))
}

pub(crate) fn sha256_file(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;

    #[test]
    fn test_copy_if_changed_skips_identical() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dst = temp.path().join("nested/dst");
        fs::write(&src, "nameserver 1.1.1.1\n").unwrap();

        assert!(copy_if_changed(&src, &dst).unwrap());
        assert!(!copy_if_changed(&src, &dst).unwrap());

        fs::write(&src, "nameserver 9.9.9.9\n").unwrap();
        assert!(copy_if_changed(&src, &dst).unwrap());
        assert_eq!(fs::read_to_string(&dst).unwrap(), "nameserver 9.9.9.9\n");
    }

    #[test]
    fn test_set_mtime_round_trips() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("SDL_config.h");
        fs::write(&path, "#define X 1\n").unwrap();

        let when = UNIX_EPOCH + Duration::from_secs(1_600_000_000);
        set_mtime(&path, when).unwrap();

        assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), when);
    }

    #[test]
    fn test_remove_all_handles_files_dirs_and_missing() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("tree/sub");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("f"), "x").unwrap();
        let file = temp.path().join("shim");
        fs::write(&file, "#!/bin/sh\n").unwrap();

        remove_all(&temp.path().join("tree")).unwrap();
        remove_all(&file).unwrap();
        remove_all(&temp.path().join("missing")).unwrap();

        assert!(!temp.path().join("tree").exists());
        assert!(!file.exists());
    }

    #[test]
    fn test_sha256_file_known_digest() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("empty");
        fs::write(&path, "").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
