//! Small helpers shared across modules: interruptible process waiting and human-readable
//! durations. Trimmed from the teacher's `utils.rs`, which also carried VM-workdir and
//! template-variable helpers with no counterpart here.

use std::process::{Child, ExitStatus};
use std::time::Duration;

use anyhow::Result;

/// Polls `handle` until it exits or `timeout` elapses, checking `should_stop` between polls so
/// a ctrl-c can interrupt a long-running subprocess wait without killing it outright (the
/// script executor decides what to do with a cancelled-but-still-running child).
pub fn wait_for_process(handle: &mut Child, should_stop: impl Fn() -> bool) -> Result<Option<ExitStatus>> {
    const POLL: Duration = Duration::from_millis(20);
    loop {
        if let Some(status) = handle.try_wait()? {
            return Ok(Some(status));
        }
        if should_stop() {
            return Ok(None);
        }
        std::thread::sleep(POLL);
    }
}

/// A `Duration` rendered as `"<days> days <hours> hours <mins> mins <secs> seconds"`, skipping
/// zero components, for progress logging.
pub struct HumanReadableDuration(pub Duration);

impl std::fmt::Display for HumanReadableDuration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let seconds = self.0.as_secs();
        let minutes = seconds / 60;
        let hours = minutes / 60;
        let days = hours / 24;

        let seconds = seconds - 60 * minutes;
        let minutes = minutes - 60 * hours;
        let hours = hours - 24 * days;

        if days != 0 {
            write!(f, "{days} days ")?;
        }
        if hours != 0 {
            write!(f, "{hours} hours ")?;
        }
        if minutes != 0 {
            write!(f, "{minutes} mins ")?;
        }
        if seconds != 0 || (days == 0 && hours == 0 && minutes == 0) {
            write!(f, "{seconds} seconds")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_readable_duration_skips_zero_components() {
        assert_eq!(HumanReadableDuration(Duration::from_secs(65)).to_string(), "1 mins 5 seconds");
        assert_eq!(HumanReadableDuration(Duration::from_secs(3600)).to_string(), "1 hours ");
        assert_eq!(HumanReadableDuration(Duration::from_secs(0)).to_string(), "0 seconds");
    }

    #[test]
    fn wait_for_process_returns_exit_status() {
        let mut child = std::process::Command::new("true").spawn().expect("spawn true");
        let status = wait_for_process(&mut child, || false).unwrap();
        assert!(status.unwrap().success());
    }
}
