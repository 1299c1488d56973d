//! Boots the initramfs under QEMU and scrapes the program's result from the
//! serial console.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::error::AgentError;
use crate::init_script::{EXIT_CODE_PREFIX, OUTPUT_END_MARKER, OUTPUT_START_MARKER};

/// Exit code reported when the guest never printed one.
const EXIT_CODE_UNKNOWN: i32 = 127;

const GUEST_MEMORY_MB: u32 = 512;
const GUEST_TIMEOUT_SECS: u64 = 30;

pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Extracts the delimited program output and exit code from console lines.
#[derive(Default)]
struct OutputScraper {
    capturing: bool,
    stdout: String,
    exit_code: Option<i32>,
}

impl OutputScraper {
    fn feed(&mut self, line: &str) {
        if line.contains(OUTPUT_START_MARKER) {
            self.capturing = true;
            return;
        }
        if line.contains(OUTPUT_END_MARKER) {
            self.capturing = false;
            return;
        }
        if let Some(rest) = line.strip_prefix(EXIT_CODE_PREFIX) {
            if let Ok(code) = rest.trim().parse::<i32>() {
                self.exit_code = Some(code);
            }
            return;
        }

        if self.capturing {
            self.stdout.push_str(line);
            self.stdout.push('\n');
        }
    }

    fn into_result(self) -> ExecutionResult {
        ExecutionResult {
            exit_code: self.exit_code.unwrap_or(EXIT_CODE_UNKNOWN),
            stdout: self.stdout,
            stderr: String::new(),
        }
    }
}

pub struct QemuRunner {
    kernel_path: PathBuf,
}

impl QemuRunner {
    pub fn new<P: AsRef<Path>>(kernel_path: P) -> Self {
        Self {
            kernel_path: kernel_path.as_ref().to_path_buf(),
        }
    }

    /// Boot the kernel with `initramfs_path`, wait for the init script to
    /// power the guest off, and return the scraped result.
    pub async fn run_initramfs(&self, initramfs_path: &Path) -> Result<ExecutionResult, AgentError> {
        let mut child = Command::new("qemu-system-x86_64")
            .arg("-kernel")
            .arg(&self.kernel_path)
            .arg("-initrd")
            .arg(initramfs_path)
            .arg("-append")
            .arg("console=ttyS0 quiet panic=-1")
            .arg("-m")
            .arg(format!("{GUEST_MEMORY_MB}M"))
            .arg("-nographic")
            .arg("-no-reboot")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(AgentError::QemuSpawn)?;

        let stdout = child
            .stdout
            .take()
            .expect("child stdout was requested as piped");
        let mut lines = BufReader::new(stdout).lines();

        let mut scraper = OutputScraper::default();
        while let Some(line) = lines.next_line().await.map_err(|e| AgentError::Io {
            context: "reading qemu console output".into(),
            source: e,
        })? {
            debug!(line = %line, "guest console");
            scraper.feed(&line);
        }

        match tokio::time::timeout(Duration::from_secs(GUEST_TIMEOUT_SECS), child.wait()).await {
            Ok(status) => {
                status.map_err(|e| AgentError::Io {
                    context: "waiting for qemu to exit".into(),
                    source: e,
                })?;
            }
            Err(_) => {
                let _ = child.kill().await;
                return Err(AgentError::GuestTimeout {
                    timeout_secs: GUEST_TIMEOUT_SECS,
                });
            }
        }

        Ok(scraper.into_result())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_lines(scraper: &mut OutputScraper, lines: &[&str]) {
        for line in lines {
            scraper.feed(line);
        }
    }

    #[test]
    fn captures_only_delimited_output() {
        let mut scraper = OutputScraper::default();
        feed_lines(
            &mut scraper,
            &[
                "=== Cloude Agent Init ===",
                "--- PROGRAM OUTPUT ---",
                "hello",
                "--- END OUTPUT ---",
                "Exit code: 0",
                "[    1.234] reboot: Power down",
            ],
        );

        let result = scraper.into_result();
        assert_eq!(result.stdout, "hello\n");
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn scrapes_the_sample_workload_output() {
        // The demo workload prints four lines, ending with the sum.
        let mut scraper = OutputScraper::default();
        feed_lines(
            &mut scraper,
            &[
                "--- PROGRAM OUTPUT ---",
                "Hello from the cloude agent!",
                "Node.js v20.11.1",
                "x64 on linux",
                "Sum 1 to 100 is: 5050",
                "--- END OUTPUT ---",
                "Exit code: 0",
            ],
        );

        let result = scraper.into_result();
        let lines: Vec<&str> = result.stdout.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[3], "Sum 1 to 100 is: 5050");
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn missing_exit_code_defaults_to_unknown() {
        let mut scraper = OutputScraper::default();
        feed_lines(
            &mut scraper,
            &["--- PROGRAM OUTPUT ---", "partial", "--- END OUTPUT ---"],
        );

        let result = scraper.into_result();
        assert_eq!(result.exit_code, EXIT_CODE_UNKNOWN);
        assert_eq!(result.stdout, "partial\n");
    }

    #[test]
    fn nonzero_exit_code_is_reported() {
        let mut scraper = OutputScraper::default();
        feed_lines(
            &mut scraper,
            &[
                "--- PROGRAM OUTPUT ---",
                "Traceback (most recent call last):",
                "--- END OUTPUT ---",
                "Exit code: 1",
            ],
        );

        assert_eq!(scraper.into_result().exit_code, 1);
    }

    #[test]
    fn kernel_noise_outside_markers_is_dropped() {
        let mut scraper = OutputScraper::default();
        feed_lines(
            &mut scraper,
            &[
                "[    0.000000] Linux version 6.1.0",
                "--- PROGRAM OUTPUT ---",
                "real output",
                "--- END OUTPUT ---",
                "Exit code: 0",
                "[    2.000000] ACPI: PM: Preparing to enter system sleep state S5",
            ],
        );

        assert_eq!(scraper.into_result().stdout, "real output\n");
    }
}
