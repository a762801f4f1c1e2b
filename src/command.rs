//! Subprocess execution for a single [`Command`] (§3 Command; §4.7 step 1-6). Grounded on
//! `bench-harness::tasks::run_task`/`run_timed_task`, generalized from the teacher's agent-RPC
//! indirection down to a direct `std::process::Command` since the core executor runs in-process
//! against a local or locally-mounted remote workspace.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use anyhow::{Context as _, Result};
use tracing::{debug, info, warn};

use crate::capture::Capture;
use crate::context::Context as Ctx;
use crate::template;
use crate::workspace::Workspace;

/// Either an argv vector or a raw shell string (rendered through `sh -c`).
#[derive(Debug, Clone)]
pub enum Argv {
    Words(Vec<String>),
    Shell(String),
}

#[derive(Debug, Clone, Default)]
pub struct Command {
    pub name: Option<String>,
    pub argv: Vec<String>,
    pub shell: Option<String>,
    pub env: Vec<(String, String)>,
    pub workdir: Option<String>,
    pub container: Option<String>,
    pub container_args: Vec<String>,
    pub retry_on_fail: bool,
    pub allow_failure: bool,
    pub captures: Vec<Capture>,
}

impl Command {
    pub fn name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        let head = if let Some(shell) = &self.shell {
            shell.split_whitespace().next().unwrap_or("command")
        } else {
            self.argv.first().map(String::as_str).unwrap_or("command")
        };
        Path::new(head).file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| head.to_string())
    }

    /// Renders argv/shell/env/workdir against `ctx`, builds the (possibly container-wrapped)
    /// final argv, with env passed explicitly as `-e KEY=VALUE` per container (§9 open
    /// question resolution: the source relies on bare `docker run` propagating nothing).
    fn render_argv(&self, ctx: &Ctx) -> Result<Vec<String>> {
        let base: Vec<String> = match (&self.shell, &self.argv) {
            (Some(shell), _) => {
                let rendered = template::render_shell(shell, ctx)?;
                vec!["sh".into(), "-c".into(), rendered]
            }
            (None, argv) => argv.iter().map(|a| template::render(a, ctx)).collect::<Result<_>>()?,
        };

        let Some(container) = &self.container else {
            return Ok(base);
        };
        let container = template::render(container, ctx)?;
        let mut wrapped = vec!["docker".to_string(), "run".to_string(), "--rm".to_string()];
        for (key, value) in &self.env {
            let rendered_value = template::render(value, ctx)?;
            wrapped.push("-e".into());
            wrapped.push(format!("{key}={rendered_value}"));
        }
        for arg in &self.container_args {
            wrapped.push(template::render(arg, ctx)?);
        }
        wrapped.push("-v".into());
        wrapped.push(format!("{}:/workdir", self.render_workdir_host(ctx)?));
        wrapped.push("--workdir".into());
        wrapped.push("/workdir".into());
        wrapped.push(container);
        wrapped.push("sh".into());
        wrapped.push("-c".into());
        wrapped.push(shell_join(&base));
        Ok(wrapped)
    }

    fn render_workdir_host(&self, ctx: &Ctx) -> Result<String> {
        // Filled in by `execute` with the actual host cwd; placeholder substituted there.
        let _ = ctx;
        Ok("{{cwd}}".to_string())
    }

    /// Runs this command to completion, retrying the whole subprocess if `retryOnFail` is set
    /// and the first attempt exits nonzero. Returns `true` iff the command is considered
    /// successful (`exit == 0 || allow_failure`).
    pub fn execute(&self, ctx: &Ctx, cwd: &Path, log_ws: &dyn Workspace, should_stop: &dyn Fn() -> bool) -> Result<bool> {
        let name = self.name();
        loop {
            let mut argv = self.render_argv(ctx)?;
            for word in argv.iter_mut() {
                *word = word.replace("{{cwd}}", &cwd.to_string_lossy());
            }
            debug!(command = %name, argv = ?argv, "executing command");

            let mut process = std::process::Command::new(&argv[0]);
            process.args(&argv[1..]);
            process.current_dir(self.resolve_workdir(ctx, cwd)?);
            for (key, value) in &self.env {
                process.env(key, template::render(value, ctx)?);
            }
            process.stdin(Stdio::null());
            process.stdout(Stdio::piped());
            process.stderr(Stdio::piped());

            let start = Instant::now();
            let mut child = process.spawn().with_context(|| format!("spawning command `{name}`"))?;

            let mut stdout_handle = child.stdout.take().expect("piped stdout");
            let mut stderr_handle = child.stderr.take().expect("piped stderr");
            let stdout_thread = std::thread::spawn(move || {
                let mut buf = vec![];
                let _ = std::io::Read::read_to_end(&mut stdout_handle, &mut buf);
                buf
            });
            let mut stderr_buf = vec![];
            std::io::Read::read_to_end(&mut stderr_handle, &mut stderr_buf).ok();

            let status = crate::util::wait_for_process(&mut child, should_stop)?;
            let stdout_buf = stdout_thread.join().unwrap_or_default();
            let walltime = start.elapsed();

            log_ws.write_all(&format!("{name}.stdout"), &stdout_buf)?;
            log_ws.write_all(&format!("{name}.stderr"), &stderr_buf)?;
            append_kv(log_ws, &format!("g_walltime_{name}"), &format!("{:.6}", walltime.as_secs_f64()))?;

            let Some(status) = status else {
                warn!(command = %name, "command interrupted before exit");
                let _ = child.kill();
                return Ok(false);
            };

            if status.success() {
                return Ok(true);
            }
            if self.retry_on_fail && !should_stop() {
                info!(command = %name, "command failed, retrying");
                continue;
            }
            if self.allow_failure {
                info!(command = %name, code = ?status.code(), "command failed but allowed");
                return Ok(true);
            }
            warn!(command = %name, code = ?status.code(), "command failed");
            return Ok(false);
        }
    }

    fn resolve_workdir(&self, ctx: &Ctx, cwd: &Path) -> Result<PathBuf> {
        match &self.workdir {
            Some(w) => Ok(cwd.join(template::render(w, ctx)?)),
            None => Ok(cwd.to_path_buf()),
        }
    }
}

/// Quotes and joins argv words for embedding in a `sh -c` string (used when wrapping a
/// command for container execution).
fn shell_join(argv: &[String]) -> String {
    argv.iter().map(|w| template::shell_quote(w)).collect::<Vec<_>>().join(" ")
}

/// Appends `key=value\n` to `grevling.txt` in `log_ws`, the append-only event log (§3 Instance).
pub fn append_kv(log_ws: &dyn Workspace, key: &str, value: &str) -> Result<()> {
    let mut f = log_ws.open_write("grevling.txt", true)?;
    writeln!(f, "{key}={value}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::LocalWorkspace;

    #[test]
    fn name_defaults_to_argv_basename() {
        let cmd = Command { argv: vec!["/usr/bin/echo".into(), "hi".into()], ..Default::default() };
        assert_eq!(cmd.name(), "echo");
    }

    #[test]
    fn explicit_name_wins() {
        let cmd = Command { name: Some("custom".into()), argv: vec!["echo".into()], ..Default::default() };
        assert_eq!(cmd.name(), "custom");
    }

    #[test]
    fn execute_runs_and_captures_stdout() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = LocalWorkspace::new(tmp.path().join("log")).unwrap();
        let cwd = tmp.path().join("cwd");
        std::fs::create_dir_all(&cwd).unwrap();

        let cmd = Command { argv: vec!["echo".into(), "hello".into()], ..Default::default() };
        let ctx = Ctx::new();
        let ok = cmd.execute(&ctx, &cwd, &ws, &|| false).unwrap();
        assert!(ok);
        let mut buf = String::new();
        std::io::Read::read_to_string(&mut *ws.open_read("echo.stdout").unwrap(), &mut buf).unwrap();
        assert_eq!(buf.trim(), "hello");
        assert!(ws.exists("grevling.txt"));
    }

    #[test]
    fn failing_command_without_allow_failure_returns_false() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = LocalWorkspace::new(tmp.path().join("log")).unwrap();
        let cwd = tmp.path().join("cwd");
        std::fs::create_dir_all(&cwd).unwrap();

        let cmd = Command { shell: Some("exit 1".into()), ..Default::default() };
        let ctx = Ctx::new();
        let ok = cmd.execute(&ctx, &cwd, &ws, &|| false).unwrap();
        assert!(!ok);
    }

    #[test]
    fn allow_failure_turns_nonzero_exit_into_success() {
        let tmp = tempfile::tempdir().unwrap();
        let ws = LocalWorkspace::new(tmp.path().join("log")).unwrap();
        let cwd = tmp.path().join("cwd");
        std::fs::create_dir_all(&cwd).unwrap();

        let cmd = Command { shell: Some("exit 1".into()), allow_failure: true, ..Default::default() };
        let ctx = Ctx::new();
        let ok = cmd.execute(&ctx, &cwd, &ws, &|| false).unwrap();
        assert!(ok);
    }
}
