//! systemd handlers: Op::EnableServices, plus the daemon reload fleet runs
//! after unit files change.

use anyhow::Result;

use crate::connection::Connection;
use crate::process::{Cmd, ExecContext};

/// Whether `systemctl is-enabled` reports the unit as `enabled`.
pub fn is_enabled(conn: &dyn Connection, ctx: &ExecContext, unit: &str) -> Result<bool> {
    let out = conn.exec(
        &Cmd::new("systemctl")
            .args(["is-enabled", unit])
            .with_context(ctx)
            .allow_fail(),
    )?;
    Ok(out.stdout.trim() == "enabled")
}

/// Handle Op::EnableServices: enable every unit that is not enabled yet.
pub fn enable(conn: &dyn Connection, ctx: &ExecContext, units: &[String]) -> Result<bool> {
    let mut changed = false;
    for unit in units {
        if is_enabled(conn, ctx, unit)? {
            continue;
        }
        conn.exec(
            &Cmd::new("systemctl")
                .args(["enable", unit.as_str()])
                .with_context(ctx)
                .error_msg(format!("enabling {} on {}", unit, conn.name())),
        )?;
        changed = true;
    }
    Ok(changed)
}

/// `systemctl daemon-reload`, for use after unit files were replaced.
pub fn daemon_reload() -> Cmd {
    Cmd::new("systemctl")
        .arg("daemon-reload")
        .error_msg("systemctl daemon-reload failed")
}
