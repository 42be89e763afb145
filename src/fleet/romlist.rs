//! First-run romlist generation and artwork scraping for Attract-Mode.

use serde::{Deserialize, Serialize};

use crate::process::{Cmd, ExecContext};
use crate::step::{op, Step};

/// `attract --build-romlist` exits with its boolean result: 1 means success.
const ROMLIST_OK_CODES: &[i32] = &[1];

/// One Attract-Mode emulator whose romlist is built on first run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Emulator {
    /// Emulator name as configured in `~/.attract/emulators`.
    pub name: String,
    /// Romlist name; the emulator name when unset.
    #[serde(default)]
    pub romlist: Option<String>,
}

impl Emulator {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            romlist: None,
        }
    }

    pub fn romlist(&self) -> &str {
        self.romlist.as_deref().unwrap_or(&self.name)
    }

    /// Where Attract-Mode writes this emulator's romlist.
    pub fn romlist_path(&self, attract_dir: &str) -> String {
        format!("{}/romlists/{}.txt", attract_dir, self.romlist())
    }
}

pub fn build_step_name(emulator: &Emulator) -> String {
    format!("romlist {}", emulator.name)
}

/// Build the romlist once, then scrape artwork whenever it was (re)built.
///
/// Scraping talks to third-party services and never fails the run.
pub fn steps<'a>(emulator: &Emulator, attract_dir: &str, ctx: &ExecContext) -> Vec<Step<'a>> {
    let build = build_step_name(emulator);
    let romlist = Cmd::new("attract")
        .args(["--build-romlist", emulator.name.as_str(), "--output", emulator.romlist()])
        .ok_codes(ROMLIST_OK_CODES)
        .error_msg(format!("building romlist for {}", emulator.name));
    let scrape = Cmd::new("attract")
        .args(["--scrape-art", emulator.name.as_str()])
        .error_msg(format!("scraping artwork for {}", emulator.name));

    vec![
        Step::op(build.clone(), op::command(romlist))
            .context(ctx.clone())
            .creates(emulator.romlist_path(attract_dir)),
        Step::op(format!("scrape {}", emulator.name), op::command(scrape))
            .context(ctx.clone())
            .when_changed(build)
            .best_effort(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::fake::FakeConnection;
    use crate::step::{run_steps, Phase, StepStatus};
    use std::fs;
    use tempfile::TempDir;

    const ATTRACT: &str = "/home/pi/.attract";

    fn writes_romlist(root: &std::path::Path) {
        let dir = root.join("home/pi/.attract/romlists");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("mame.txt"), "#Name;Title;Emulator\n").unwrap();
    }

    #[test]
    fn test_romlist_path_defaults_to_emulator_name() {
        let mame = Emulator::new("mame");
        assert_eq!(mame.romlist_path(ATTRACT), "/home/pi/.attract/romlists/mame.txt");

        let renamed = Emulator {
            name: "mame".into(),
            romlist: Some("arcade".into()),
        };
        assert_eq!(renamed.romlist_path(ATTRACT), "/home/pi/.attract/romlists/arcade.txt");
    }

    #[test]
    fn test_exit_code_one_is_success() {
        let temp = TempDir::new().unwrap();
        let conn = FakeConnection::new(temp.path()).on_code("--build-romlist", 1, writes_romlist);
        let ctx = ExecContext::as_user("pi");

        let report = run_steps(Phase::Fleet, &conn, steps(&Emulator::new("mame"), ATTRACT, &ctx)).unwrap();

        assert!(report.changed("romlist mame"));
        assert!(report.changed("scrape mame"));
        assert_eq!(
            conn.commands(),
            [
                "attract --build-romlist mame --output mame",
                "attract --scrape-art mame"
            ]
        );
    }

    #[test]
    fn test_other_exit_codes_fail() {
        let temp = TempDir::new().unwrap();
        let conn = FakeConnection::new(temp.path()).respond("--build-romlist", 2, "");
        let ctx = ExecContext::as_user("pi");

        let result = run_steps(Phase::Fleet, &conn, steps(&Emulator::new("mame"), ATTRACT, &ctx));

        assert!(result.is_err());
        assert_eq!(conn.count("--scrape-art"), 0);
    }

    #[test]
    fn test_scrape_failure_is_ignored() {
        let temp = TempDir::new().unwrap();
        let conn = FakeConnection::new(temp.path())
            .on("--build-romlist", writes_romlist)
            .respond("--scrape-art", 1, "");
        let ctx = ExecContext::as_user("pi");

        let report = run_steps(Phase::Fleet, &conn, steps(&Emulator::new("mame"), ATTRACT, &ctx)).unwrap();

        assert!(matches!(report.status("scrape mame"), Some(StepStatus::FailedIgnored(_))));
    }

    #[test]
    fn test_existing_romlist_skips_both_steps() {
        let temp = TempDir::new().unwrap();
        writes_romlist(temp.path());
        let conn = FakeConnection::new(temp.path());
        let ctx = ExecContext::as_user("pi");

        let report = run_steps(Phase::Fleet, &conn, steps(&Emulator::new("mame"), ATTRACT, &ctx)).unwrap();

        assert!(conn.commands().is_empty());
        assert_eq!(report.skipped_steps(), ["romlist mame", "scrape mame"]);
    }
}
