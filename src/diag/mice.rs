//! Echo PS/2 mouse packets from `/dev/input/<device>`.
//!
//! Trackballs and spinners show up as mice; watching their raw deltas is the
//! quickest way to tell a wiring fault from an Attract-Mode mapping problem.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, ErrorKind, Read, Write};
use std::path::PathBuf;
use tracing::info;

/// Device read when none is named: every mouse multiplexed.
pub const DEFAULT_DEVICE: &str = "mice";

const INPUT_DIR: &str = "/dev/input";

/// One 3-byte packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MouseEvent {
    pub left: bool,
    pub right: bool,
    pub middle: bool,
    pub dx: i8,
    pub dy: i8,
}

impl MouseEvent {
    pub fn parse(packet: [u8; 3]) -> Self {
        let buttons = packet[0];
        Self {
            left: buttons & 0x1 != 0,
            right: buttons & 0x2 != 0,
            middle: buttons & 0x4 != 0,
            dx: packet[1] as i8,
            dy: packet[2] as i8,
        }
    }

    fn x_arrow(&self) -> char {
        match self.dx {
            dx if dx < 0 => '←',
            dx if dx > 0 => '→',
            _ => ' ',
        }
    }

    fn y_arrow(&self) -> char {
        match self.dy {
            dy if dy < 0 => '↑',
            dy if dy > 0 => '↓',
            _ => ' ',
        }
    }
}

impl fmt::Display for MouseEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}  (x: {}, y: {})",
            self.x_arrow(),
            self.y_arrow(),
            self.dx,
            self.dy
        )?;
        for (pressed, name) in [(self.left, "left"), (self.middle, "middle"), (self.right, "right")] {
            if pressed {
                write!(f, " {}", name)?;
            }
        }
        Ok(())
    }
}

pub fn device_path(device: &str) -> Result<PathBuf> {
    if device.is_empty() || device.contains('/') {
        bail!("invalid input device name {:?}", device);
    }
    Ok(PathBuf::from(INPUT_DIR).join(device))
}

/// Print one line per packet until the stream ends.
///
/// Returns the number of packets read.
pub fn echo(mut input: impl Read, mut out: impl Write) -> Result<u64> {
    let mut packets = 0;
    let mut packet = [0u8; 3];
    loop {
        match input.read_exact(&mut packet) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err).context("reading mouse packet"),
        }
        writeln!(out, "{}", MouseEvent::parse(packet))?;
        out.flush()?;
        packets += 1;
    }
    Ok(packets)
}

/// Watch `device` under `/dev/input` until interrupted.
pub fn watch(device: &str) -> Result<()> {
    let path = device_path(device)?;
    let file = File::open(&path).with_context(|| format!("opening {}", path.display()))?;
    info!(device = %path.display(), "watching mouse packets, Ctrl-C to stop");
    echo(file, BufWriter::new(io::stdout().lock()))?;
    Ok(())
}
