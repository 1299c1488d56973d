//! Runs a source file inside a disposable micro-VM and reports its output.

use std::path::PathBuf;

use agent::error::AgentError;
use agent::{image, qemu, runtimes};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "cloude-agent", about = "Run a code file inside a micro-VM")]
struct Args {
    /// Path to the kernel image to boot
    kernel: PathBuf,

    /// Source file to execute (.py, .js or .rs)
    code_file: PathBuf,

    /// Base rootfs archive (cpio.gz), as a local path or HTTP(S) URL
    #[arg(long, env = "CLOUDE_BASE_ROOTFS")]
    base: Option<String>,

    /// Directory for build artifacts
    #[arg(long, default_value = "build")]
    work_dir: PathBuf,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    run(args).await.map_err(Into::into)
}

async fn run(args: Args) -> Result<(), AgentError> {
    if !args.code_file.exists() {
        return Err(AgentError::CodeFileNotFound {
            path: args.code_file.display().to_string(),
        });
    }

    let runtime =
        runtimes::detect_runtime(&args.code_file).ok_or_else(|| AgentError::UnsupportedRuntime {
            path: args.code_file.display().to_string(),
        })?;

    let base_rootfs = match &args.base {
        Some(base) => Some(image::ensure_base_rootfs(base, &image::cache_dir()).await?),
        None => None,
    };

    let code = tokio::fs::read(&args.code_file)
        .await
        .map_err(|e| AgentError::Io {
            context: format!("reading {}", args.code_file.display()),
            source: e,
        })?;

    tokio::fs::create_dir_all(&args.work_dir)
        .await
        .map_err(|e| AgentError::Io {
            context: format!("creating work dir {}", args.work_dir.display()),
            source: e,
        })?;

    let initramfs_path = args.work_dir.join(format!(
        "agent-{}.cpio.gz",
        runtime.source_extension()
    ));

    println!("Building initramfs...");
    image::build_initramfs(
        runtime.as_ref(),
        &code,
        base_rootfs.as_deref(),
        &initramfs_path,
    )
    .await?;
    println!("Initramfs built at {}", initramfs_path.display());

    println!("Booting QEMU...");
    let runner = qemu::QemuRunner::new(&args.kernel);
    let result = runner.run_initramfs(&initramfs_path).await?;

    println!("\n=== EXECUTION RESULT ===");
    println!("Exit code: {}", result.exit_code);
    println!("--- STDOUT ---");
    println!("{}", result.stdout);
    if !result.stderr.is_empty() {
        println!("--- STDERR ---");
        println!("{}", result.stderr);
    }
    println!("========================");

    Ok(())
}
