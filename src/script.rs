//! An ordered list of [`Command`]s executed sequentially (§3 Script; §4.7 `Script.run`,
//! `Script.capture`). Grounded on `examples/original_source/grevling/script.py`
//! (`ScriptTemplate.run`) for the started/finished bookkeeping and abort-on-first-failure
//! control flow.

use std::path::Path;

use anyhow::Result;
use time::OffsetDateTime;
use tracing::info;

use crate::capture::ResultCollector;
use crate::command::{append_kv, Command};
use crate::context::Context as Ctx;
use crate::workspace::Workspace;

#[derive(Debug, Clone, Default)]
pub struct Script {
    pub commands: Vec<Command>,
}

impl Script {
    pub fn new(commands: Vec<Command>) -> Self {
        Self { commands }
    }

    /// Runs every command in order. Appends `g_started`/`g_finished` timestamps and
    /// `g_success` to `grevling.txt` regardless of outcome; stops at the first command that
    /// returns `false` from [`Command::execute`].
    pub fn run(&self, ctx: &Ctx, cwd: &Path, log_ws: &dyn Workspace, should_stop: &dyn Fn() -> bool) -> Result<bool> {
        append_kv(log_ws, "g_started", &now_str())?;
        let mut success = true;
        for command in &self.commands {
            info!(command = %command.name(), "running command");
            if !command.execute(ctx, cwd, log_ws, should_stop)? {
                success = false;
                break;
            }
            if should_stop() {
                success = false;
                break;
            }
        }
        append_kv(log_ws, "g_success", if success { "1" } else { "0" })?;
        append_kv(log_ws, "g_finished", &now_str())?;
        Ok(success)
    }

    /// Feeds each command's persisted stdout through its declared captures, in order.
    pub fn capture(&self, log_ws: &dyn Workspace, collector: &mut ResultCollector) -> Result<()> {
        for command in &self.commands {
            let stdout_path = format!("{}.stdout", command.name());
            if !log_ws.exists(&stdout_path) {
                continue;
            }
            let mut buf = vec![];
            std::io::Read::read_to_end(&mut *log_ws.open_read(&stdout_path)?, &mut buf)?;
            let stdout = String::from_utf8_lossy(&buf);
            for capture in &command.captures {
                capture.apply(&stdout, collector)?;
            }
        }
        Ok(())
    }
}

fn now_str() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        now.microsecond()
    )
}
