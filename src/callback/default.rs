//! The human-readable output stream.

use super::{Callback, Detail};
use crate::executor::{HostStats, TaskResult, TaskStatus};
use colored::Colorize;
use indexmap::IndexMap;

/// Banner width used for play and task headers.
const BANNER_WIDTH: usize = 80;

/// Renders play/task banners, one status line per host, and the final
/// recap table.
pub struct DefaultCallback {
    detail: Detail,
    show_diff: bool,
}

impl DefaultCallback {
    /// Create the callback; `verbosity > 0` includes messages and command
    /// output, `show_diff` prints diff payloads.
    pub fn new(verbosity: u8, show_diff: bool) -> Self {
        Self {
            detail: if verbosity > 0 {
                Detail::Verbose
            } else {
                Detail::Normal
            },
            show_diff,
        }
    }

    fn banner(kind: &str, name: &str) {
        let header = format!("{} [{}]", kind, name);
        let stars = "*".repeat(BANNER_WIDTH.saturating_sub(header.len() + 1));
        println!("\n{} {}", header.bright_white().bold(), stars.bright_black());
    }
}

impl Callback for DefaultCallback {
    fn on_play_start(&mut self, name: &str, _hosts: &[String]) {
        let name = if name.is_empty() { "unnamed" } else { name };
        Self::banner("PLAY", name);
    }

    fn on_task_start(&mut self, _task_index: usize, name: &str, _module: &str, is_handler: bool) {
        let kind = if is_handler { "RUNNING HANDLER" } else { "TASK" };
        Self::banner(kind, name);
    }

    fn on_host_result(&mut self, _task_index: usize, host: &str, result: &TaskResult) {
        let host_bold = host.bright_white().bold();
        match result.status {
            TaskStatus::Ok => println!("{}: [{}]", "ok".green(), host_bold),
            TaskStatus::Changed => println!("{}: [{}]", "changed".yellow(), host_bold),
            TaskStatus::Skipped => println!("{}: [{}]", "skipping".cyan(), host_bold),
            TaskStatus::Failed if result.ignored => println!(
                "{}: [{}] => {} {}",
                "failed".red().bold(),
                host_bold,
                result.msg.as_deref().unwrap_or(""),
                "...ignoring".cyan()
            ),
            TaskStatus::Failed => println!(
                "{}: [{}] => {}",
                "fatal".red().bold(),
                host_bold,
                result.msg.as_deref().unwrap_or("task failed")
            ),
            TaskStatus::Unreachable => println!(
                "{}: [{}] => {}",
                "unreachable".red().bold(),
                host_bold,
                result.msg.as_deref().unwrap_or("host unreachable")
            ),
        }

        if self.detail == Detail::Verbose {
            if let Some(stdout) = result.value.get("stdout").and_then(|v| v.as_str()) {
                if !stdout.is_empty() {
                    println!("  stdout: {}", stdout.trim_end());
                }
            }
            if let Some(stderr) = result.value.get("stderr").and_then(|v| v.as_str()) {
                if !stderr.is_empty() {
                    println!("  stderr: {}", stderr.trim_end());
                }
            }
            if let Some(rc) = result.value.get("rc").and_then(|v| v.as_i64()) {
                println!("  rc: {}", rc);
            }
        }

        if self.show_diff {
            if let Some(diff) = &result.diff {
                print!("{}", diff.unified());
            }
        }
    }

    fn on_recap(&mut self, stats: &IndexMap<String, HostStats>) {
        println!(
            "\n{} {}",
            "PLAY RECAP".bright_white().bold(),
            "*".repeat(BANNER_WIDTH.saturating_sub(10)).bright_black()
        );

        for (host, stat) in stats {
            let host_colored = if stat.failed > 0 || stat.unreachable > 0 {
                host.red().bold()
            } else if stat.changed > 0 {
                host.yellow()
            } else {
                host.green()
            };

            println!(
                "{:<26} : {}={:<4} {}={:<4} {}={:<4} {}={:<4} {}={:<4}",
                host_colored,
                "ok".green(),
                stat.ok,
                "changed".yellow(),
                stat.changed,
                "failed".red(),
                stat.failed,
                "skipped".cyan(),
                stat.skipped,
                "unreachable".red(),
                stat.unreachable,
            );
        }
    }
}
