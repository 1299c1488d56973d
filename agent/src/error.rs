use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum AgentError {
    #[error("code file not found: {path}")]
    #[diagnostic(help("the first argument must be an existing source file"))]
    CodeFileNotFound { path: String },

    #[error("unsupported file extension for {path}")]
    #[diagnostic(help("supported extensions are .py, .js and .rs"))]
    UnsupportedRuntime { path: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to download base image: {message}")]
    ImageDownload {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("failed to spawn qemu-system-x86_64 — is QEMU installed?")]
    QemuSpawn(#[source] std::io::Error),

    #[error("the guest did not finish within {timeout_secs}s")]
    GuestTimeout { timeout_secs: u64 },
}
