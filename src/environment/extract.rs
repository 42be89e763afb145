//! Root filesystem extraction from a Raspberry Pi OS disk image.
//!
//! 1. Read the partition table with `sfdisk --json`
//! 2. Loop-mount the root partition read-only at its byte offset
//! 3. `cp -a` everything into `<dest>.partial`
//! 4. Unmount, then rename `<dest>.partial` to `<dest>`
//!
//! The destination only ever appears complete: a failed copy leaves no
//! destination behind and the next run starts over.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use tracing::{info, warn};

use crate::connection::Connection;
use crate::process::{Cmd, ExecContext};

/// Sector size assumed when sfdisk does not report one.
const DEFAULT_SECTOR_SIZE: u64 = 512;

#[derive(Debug, Deserialize)]
struct SfdiskDump {
    partitiontable: PartitionTable,
}

#[derive(Debug, Deserialize)]
struct PartitionTable {
    #[serde(default)]
    sectorsize: Option<u64>,
    #[serde(default)]
    partitions: Vec<Partition>,
}

#[derive(Debug, Deserialize)]
struct Partition {
    start: u64,
    size: u64,
}

/// Byte range of one partition inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionWindow {
    pub offset: u64,
    pub size: u64,
}

impl PartitionWindow {
    /// `mount -o` options for a read-only loop mount of this window.
    pub fn mount_options(&self) -> String {
        format!("loop,ro,offset={},sizelimit={}", self.offset, self.size)
    }
}

/// Locate partition `number` (1-based) in `sfdisk --json` output.
pub fn partition_window(json: &str, number: usize) -> Result<PartitionWindow> {
    let dump: SfdiskDump = serde_json::from_str(json).context("parsing sfdisk --json output")?;
    let table = dump.partitiontable;
    let Some(part) = number
        .checked_sub(1)
        .and_then(|idx| table.partitions.get(idx))
    else {
        bail!(
            "image has {} partition(s), partition {} requested",
            table.partitions.len(),
            number
        );
    };

    let sector = table.sectorsize.unwrap_or(DEFAULT_SECTOR_SIZE);
    let offset = part
        .start
        .checked_mul(sector)
        .context("partition offset overflows")?;
    let size = part
        .size
        .checked_mul(sector)
        .context("partition size overflows")?;
    Ok(PartitionWindow { offset, size })
}

/// Copy partition `number` of `image` into `dest` on `host`.
pub fn extract_root(
    host: &dyn Connection,
    ctx: &ExecContext,
    image: &Path,
    dest: &Path,
    number: usize,
) -> Result<()> {
    let image_str = image.to_string_lossy().into_owned();
    let dest = super::normalize_root(dest);
    let dest_str = dest.to_string_lossy().into_owned();
    let staging = sibling(&dest, "partial")?;
    let mount_point = sibling(&dest, "mnt")?;

    if !host.exists(ctx, &image_str)? {
        bail!("image {} does not exist", image_str);
    }

    let table = host.exec(
        &Cmd::new("sfdisk")
            .args(["--json", image_str.as_str()])
            .with_context(ctx)
            .error_msg(format!("reading partition table of {}", image_str)),
    )?;
    let window = partition_window(&table.stdout, number)
        .with_context(|| format!("locating partition {} of {}", number, image_str))?;
    info!(image = %image_str, offset = window.offset, size = window.size, "extracting root partition");

    // leftovers from an interrupted run
    host.remove_all(ctx, &staging)?;
    host.create_dir_all(ctx, &staging)?;
    host.create_dir_all(ctx, &mount_point)?;

    host.exec(
        &Cmd::new("mount")
            .args(["-o", window.mount_options().as_str(), image_str.as_str(), mount_point.as_str()])
            .with_context(ctx)
            .error_msg(format!("loop-mounting {}", image_str)),
    )?;

    let copied = host.exec(
        &Cmd::new("cp")
            .args(["-a", &format!("{}/.", mount_point), &format!("{}/", staging)])
            .with_context(ctx)
            .error_msg(format!("copying root filesystem into {}", staging)),
    );

    // Always unmount, even if the copy failed
    let unmounted = host.exec(
        &Cmd::new("umount")
            .arg(mount_point.as_str())
            .with_context(ctx)
            .error_msg(format!("unmounting {}", mount_point)),
    );
    match unmounted {
        Ok(_) => host.remove_all(ctx, &mount_point)?,
        Err(err) => warn!(mount_point = %mount_point, error = %format!("{err:#}"), "staging mount left behind"),
    }

    if let Err(err) = copied {
        host.remove_all(ctx, &staging)?;
        return Err(err);
    }

    host.rename(ctx, &staging, &dest_str)?;
    info!(dest = %dest_str, "root filesystem extracted");
    Ok(())
}

/// `<parent>/<name>.<suffix>`: next to `dest`, never inside it.
fn sibling(dest: &Path, suffix: &str) -> Result<String> {
    let name = dest
        .file_name()
        .with_context(|| format!("{} does not name a directory", dest.display()))?;
    let mut name = name.to_os_string();
    name.push(".");
    name.push(suffix);
    Ok(dest.with_file_name(name).to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::fake::FakeConnection;
    use std::fs;
    use tempfile::TempDir;

    const RASPIOS: &str = r#"{
   "partitiontable": {
      "label": "dos",
      "id": "0x3e247b30",
      "device": "2023-05-03-raspios-bullseye-armhf.img",
      "unit": "sectors",
      "sectorsize": 512,
      "partitions": [
         {"node": "2023-05-03-raspios-bullseye-armhf.img1", "start": 8192, "size": 524288, "type": "c"},
         {"node": "2023-05-03-raspios-bullseye-armhf.img2", "start": 532480, "size": 7716864, "type": "83"}
      ]
   }
}"#;

    #[test]
    fn test_partition_window_root_partition() {
        let window = partition_window(RASPIOS, 2).unwrap();
        assert_eq!(window.offset, 532480 * 512);
        assert_eq!(window.size, 7716864 * 512);
        assert_eq!(
            window.mount_options(),
            "loop,ro,offset=272629760,sizelimit=3951034368"
        );
    }

    #[test]
    fn test_partition_window_defaults_sector_size() {
        let json = r#"{"partitiontable": {"partitions": [{"start": 2048, "size": 100}]}}"#;
        assert_eq!(partition_window(json, 1).unwrap().offset, 2048 * 512);
    }

    #[test]
    fn test_partition_window_rejects_missing_partition() {
        assert!(partition_window(RASPIOS, 3).is_err());
        assert!(partition_window(RASPIOS, 0).is_err());
        assert!(partition_window("not json", 2).is_err());
    }

    fn image_host(temp: &TempDir) -> FakeConnection {
        fs::create_dir_all(temp.path().join("images")).unwrap();
        fs::write(temp.path().join("images/raspios.img"), "").unwrap();
        FakeConnection::new(temp.path()).respond("sfdisk --json", 0, RASPIOS)
    }

    #[test]
    fn test_extract_root_renames_staging_into_place() {
        let temp = TempDir::new().unwrap();
        let host = image_host(&temp).on("cp -a", |root| {
            fs::create_dir_all(root.join("srv/pi.partial/etc")).unwrap();
        });

        extract_root(
            &host,
            &ExecContext::new(),
            Path::new("/images/raspios.img"),
            Path::new("/srv/pi"),
            2,
        )
        .unwrap();

        assert!(temp.path().join("srv/pi/etc").is_dir());
        assert!(!temp.path().join("srv/pi.partial").exists());
        assert!(!temp.path().join("srv/pi.mnt").exists());
        assert_eq!(host.count("umount /srv/pi.mnt"), 1);
        let mounts: Vec<String> = host
            .commands()
            .into_iter()
            .filter(|line| line.starts_with("mount -o"))
            .collect();
        assert_eq!(mounts.len(), 1);
        assert!(mounts[0].contains("offset=272629760"));
        assert!(mounts[0].ends_with("/images/raspios.img /srv/pi.mnt"));
    }

    #[test]
    fn test_extract_root_failed_copy_leaves_no_destination() {
        let temp = TempDir::new().unwrap();
        let host = image_host(&temp).respond("cp -a", 1, "");

        let result = extract_root(
            &host,
            &ExecContext::new(),
            Path::new("/images/raspios.img"),
            Path::new("/srv/pi"),
            2,
        );

        assert!(result.is_err());
        assert_eq!(host.count("umount"), 1);
        assert!(!temp.path().join("srv/pi").exists());
        assert!(!temp.path().join("srv/pi.partial").exists());
    }

    #[test]
    fn test_extract_root_trailing_slash_stages_beside_destination() {
        let temp = TempDir::new().unwrap();
        let host = image_host(&temp).on("cp -a", |root| {
            fs::create_dir_all(root.join("srv/pi.partial/proc")).unwrap();
        });

        extract_root(
            &host,
            &ExecContext::new(),
            Path::new("/images/raspios.img"),
            Path::new("/srv/pi/"),
            2,
        )
        .unwrap();

        assert!(temp.path().join("srv/pi/proc").is_dir());
        assert!(!temp.path().join("srv/pi/.partial").exists());
        assert!(!temp.path().join("srv/pi.partial").exists());
        assert_eq!(host.count("umount /srv/pi.mnt"), 1);
    }

    #[test]
    fn test_sibling_paths() {
        assert_eq!(sibling(Path::new("/srv/pi"), "partial").unwrap(), "/srv/pi.partial");
        assert_eq!(sibling(Path::new("/srv/pi/"), "mnt").unwrap(), "/srv/pi.mnt");
        assert!(sibling(Path::new("/"), "mnt").is_err());
    }
}
