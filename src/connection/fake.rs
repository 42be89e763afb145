//! Recording target for tests: real files under a temp root, scripted commands.

use anyhow::Result;
use std::cell::RefCell;
use std::path::{Path, PathBuf};

use super::Connection;
use crate::process::{Cmd, CmdOutput};

type Effect = Box<dyn Fn(&Path)>;
type Script = Box<dyn Fn(&Path, &str) -> i32>;

struct Rule {
    pattern: String,
    code: i32,
    stdout: String,
    effect: Option<Effect>,
    script: Option<Script>,
}

pub(crate) struct FakeConnection {
    root: PathBuf,
    login: String,
    rules: Vec<Rule>,
    log: RefCell<Vec<String>>,
}

impl FakeConnection {
    pub(crate) fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            login: "pi".to_string(),
            rules: Vec::new(),
            log: RefCell::new(Vec::new()),
        }
    }

    /// Commands whose rendered line contains `pattern` exit with `code`
    /// and print `stdout`. The first matching rule wins.
    pub(crate) fn respond(mut self, pattern: &str, code: i32, stdout: &str) -> Self {
        self.rules.push(Rule {
            pattern: pattern.to_string(),
            code,
            stdout: stdout.to_string(),
            effect: None,
            script: None,
        });
        self
    }

    /// Like [`respond`](Self::respond) with exit 0, also running `effect`
    /// against the fake root (e.g. to create the file a tool would write).
    pub(crate) fn on(mut self, pattern: &str, effect: impl Fn(&Path) + 'static) -> Self {
        self.rules.push(Rule {
            pattern: pattern.to_string(),
            code: 0,
            stdout: String::new(),
            effect: Some(Box::new(effect)),
            script: None,
        });
        self
    }

    /// Like [`on`](Self::on) with a custom exit code.
    pub(crate) fn on_code(
        mut self,
        pattern: &str,
        code: i32,
        effect: impl Fn(&Path) + 'static,
    ) -> Self {
        self.rules.push(Rule {
            pattern: pattern.to_string(),
            code,
            stdout: String::new(),
            effect: Some(Box::new(effect)),
            script: None,
        });
        self
    }

    /// Commands matching `pattern` exit with whatever `script` returns for
    /// the fake root and the rendered command line. Lets a test keep state
    /// (e.g. a mount table) in the root.
    pub(crate) fn script(
        mut self,
        pattern: &str,
        script: impl Fn(&Path, &str) -> i32 + 'static,
    ) -> Self {
        self.rules.push(Rule {
            pattern: pattern.to_string(),
            code: 0,
            stdout: String::new(),
            effect: None,
            script: Some(Box::new(script)),
        });
        self
    }

    pub(crate) fn commands(&self) -> Vec<String> {
        self.log.borrow().clone()
    }

    pub(crate) fn count(&self, pattern: &str) -> usize {
        self.log
            .borrow()
            .iter()
            .filter(|line| line.contains(pattern))
            .count()
    }
}

impl Connection for FakeConnection {
    fn name(&self) -> &str {
        "fake"
    }

    fn login_user(&self) -> &str {
        &self.login
    }

    fn exec(&self, cmd: &Cmd) -> Result<CmdOutput> {
        let line = cmd.to_string();
        self.log.borrow_mut().push(line.clone());

        let output = match self.rules.iter().find(|rule| line.contains(&rule.pattern)) {
            Some(rule) => {
                if let Some(effect) = &rule.effect {
                    effect(&self.root);
                }
                let code = match &rule.script {
                    Some(script) => script(&self.root, &line),
                    None => rule.code,
                };
                CmdOutput {
                    code: Some(code),
                    stdout: rule.stdout.clone(),
                    stderr: String::new(),
                }
            }
            None => CmdOutput {
                code: Some(0),
                ..CmdOutput::default()
            },
        };
        cmd.check(output)
    }

    fn local_root(&self) -> Option<&Path> {
        Some(&self.root)
    }
}
