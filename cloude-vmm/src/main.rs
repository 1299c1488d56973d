//! Boots a micro-VM from environment configuration.
//!
//! `KERNEL_PATH` is required. `INITRAMFS_PATH`, `SERIAL_OUTPUT` and
//! `TAP_DEVICE` are optional, as are the `CLOUDE_VCPUS` / `CLOUDE_MEMORY_MB`
//! sizing overrides.

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use miette::Diagnostic;
use thiserror::Error;
use tracing_subscriber::EnvFilter;
use vmm::{GuestInput, TeeWriter, Vmm};
use vmm_sys_util::terminal::Terminal;

const DEFAULT_VCPUS: u8 = 4;
const DEFAULT_MEMORY_MB: usize = 512;

#[derive(Debug, Error, Diagnostic)]
enum LaunchError {
    #[error("KERNEL_PATH must point to the kernel image to boot")]
    #[diagnostic(help("export KERNEL_PATH=/path/to/vmlinux and run again"))]
    MissingKernelPath,

    #[error("invalid {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("failed to open the serial output file {path}")]
    SerialOutput {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to switch the terminal to raw mode")]
    RawMode(#[source] vmm_sys_util::errno::Error),

    #[error(transparent)]
    Vmm(#[from] vmm::VmmError),
}

fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    run().map_err(Into::into)
}

fn run() -> Result<(), LaunchError> {
    let kernel_path = env::var("KERNEL_PATH").map_err(|_| LaunchError::MissingKernelPath)?;
    let initramfs_path = env::var_os("INITRAMFS_PATH").map(PathBuf::from);

    let vcpus: u8 = env_or("CLOUDE_VCPUS", DEFAULT_VCPUS)?;
    let memory_mb: usize = env_or("CLOUDE_MEMORY_MB", DEFAULT_MEMORY_MB)?;

    // Tee guest console output into a file when asked to.
    let serial_output = env::var_os("SERIAL_OUTPUT").map(PathBuf::from);
    if let Some(path) = &serial_output {
        tracing::info!(path = %path.display(), "capturing serial output");
    }
    let writer: Box<dyn std::io::Write + Send> =
        Box::new(TeeWriter::new(serial_output.as_deref(), true).map_err(|e| {
            LaunchError::SerialOutput {
                path: serial_output
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
                source: e,
            }
        })?);

    // Raw mode, so keystrokes reach the guest unmangled.
    let stdin = std::io::stdin();
    let stdin_lock = stdin.lock();
    stdin_lock.set_raw_mode().map_err(LaunchError::RawMode)?;
    let input: Box<dyn GuestInput> = Box::new(stdin_lock);

    let mut vmm = Vmm::new(input, writer, memory_mb << 20)?;

    if let Ok(tap_name) = env::var("TAP_DEVICE") {
        tracing::info!(tap = %tap_name, "attaching virtio-net device");
        vmm.add_net_device(&tap_name)?;
    }

    vmm.configure(
        vcpus,
        Path::new(&kernel_path),
        initramfs_path.as_deref(),
    )?;

    tracing::info!(vcpus, memory_mb, kernel = %kernel_path, "booting guest");
    let result = vmm.run();

    // Hand the terminal back before reporting anything.
    let _ = std::io::stdin().lock().set_canon_mode();

    result.map_err(Into::into)
}

/// Read an env var, falling back to a default when unset and failing on
/// values that do not parse.
fn env_or<T: FromStr>(var: &'static str, default: T) -> Result<T, LaunchError> {
    match env::var(var) {
        Ok(value) => value
            .parse()
            .map_err(|_| LaunchError::InvalidEnv { var, value }),
        Err(_) => Ok(default),
    }
}
