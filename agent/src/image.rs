//! Base rootfs caching and initramfs assembly.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::cpio;
use crate::error::AgentError;
use crate::init_script;
use crate::runtimes::LanguageRuntime;

/// Base rootfs cache directory: `~/.cache/cloude/images/`.
pub fn cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("cloude")
        .join("images")
}

/// Ensure the base rootfs archive is available locally, downloading if the
/// reference is an HTTP(S) URL. Returns the path to the local file.
pub async fn ensure_base_rootfs(base: &str, cache_dir: &Path) -> Result<PathBuf, AgentError> {
    if !base.starts_with("http://") && !base.starts_with("https://") {
        let path = PathBuf::from(base);
        if !path.exists() {
            return Err(AgentError::Io {
                context: format!("base rootfs not found: {}", path.display()),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"),
            });
        }
        return Ok(path);
    }

    let filename = base.rsplit('/').next().unwrap_or("rootfs.cpio.gz");

    tokio::fs::create_dir_all(cache_dir)
        .await
        .map_err(|e| AgentError::Io {
            context: format!("creating cache dir {}", cache_dir.display()),
            source: e,
        })?;

    let dest = cache_dir.join(filename);
    if dest.exists() {
        info!(path = %dest.display(), "using cached base rootfs");
        return Ok(dest);
    }

    info!(url = %base, "downloading base rootfs");

    let response = reqwest::get(base)
        .await
        .map_err(|e| AgentError::ImageDownload {
            message: format!("request to {base} failed"),
            source: Box::new(e),
        })?;

    if !response.status().is_success() {
        return Err(AgentError::ImageDownload {
            message: format!("HTTP {} from {base}", response.status()),
            source: format!("HTTP {}", response.status()).into(),
        });
    }

    let total_size = response.content_length().unwrap_or(0);

    let pb = ProgressBar::new(total_size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap()
            .progress_chars("#>-"),
    );

    // Download into a .part file and rename, so an interrupted download
    // never poisons the cache.
    let tmp_path = dest.with_extension("part");
    let _ = tokio::fs::remove_file(&tmp_path).await;

    if let Err(e) = download_to_file(&tmp_path, response, &pb).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    tokio::fs::rename(&tmp_path, &dest)
        .await
        .map_err(|e| AgentError::Io {
            context: format!("renaming {} to {}", tmp_path.display(), dest.display()),
            source: e,
        })?;

    pb.finish_and_clear();
    info!(path = %dest.display(), "base rootfs cached");

    Ok(dest)
}

async fn download_to_file(
    path: &Path,
    response: reqwest::Response,
    pb: &ProgressBar,
) -> Result<(), AgentError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| AgentError::Io {
            context: format!("creating temp file {}", path.display()),
            source: e,
        })?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| AgentError::ImageDownload {
            message: "error reading response body".into(),
            source: Box::new(e),
        })?;
        file.write_all(&chunk).await.map_err(|e| AgentError::Io {
            context: "writing base rootfs data".into(),
            source: e,
        })?;
        pb.inc(chunk.len() as u64);
    }

    file.flush().await.map_err(|e| AgentError::Io {
        context: "flushing base rootfs file".into(),
        source: e,
    })?;

    Ok(())
}

/// Build the bootable initramfs: the base rootfs (if any) with an overlay
/// archive carrying `/init` and the code file appended to it.
///
/// The kernel treats concatenated gzip members as a single initramfs and
/// unpacks them in order, so the overlay can shadow base files without this
/// code ever parsing the base archive.
pub async fn build_initramfs(
    runtime: &dyn LanguageRuntime,
    code: &[u8],
    base_rootfs: Option<&Path>,
    output_path: &Path,
) -> Result<(), AgentError> {
    let code_guest_path = format!("lambda/code.{}", runtime.source_extension());
    let script = init_script::render(runtime, &format!("/{code_guest_path}"));

    let entries = [
        cpio::directory("lambda"),
        cpio::file("init", 0o755, script.as_bytes()),
        cpio::file(&code_guest_path, 0o644, code),
    ];

    let mut image = match base_rootfs {
        Some(path) => tokio::fs::read(path).await.map_err(|e| AgentError::Io {
            context: format!("reading base rootfs {}", path.display()),
            source: e,
        })?,
        None => Vec::new(),
    };

    cpio::write_gzipped(&entries, &mut image).map_err(|e| AgentError::Io {
        context: "compressing overlay archive".into(),
        source: e,
    })?;

    tokio::fs::write(output_path, &image)
        .await
        .map_err(|e| AgentError::Io {
            context: format!("writing initramfs {}", output_path.display()),
            source: e,
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtimes::python::PythonRuntime;
    use std::io::Read;

    #[test]
    fn local_path_is_used_as_is() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let base = file.path().to_str().unwrap().to_string();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let resolved = rt
            .block_on(ensure_base_rootfs(&base, Path::new("/nonexistent-cache")))
            .unwrap();
        assert_eq!(resolved, file.path());
    }

    #[test]
    fn missing_local_path_is_an_error() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let err = rt
            .block_on(ensure_base_rootfs(
                "/definitely/not/here.cpio.gz",
                Path::new("/nonexistent-cache"),
            ))
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn initramfs_without_base_is_a_single_gzip_member() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("initramfs.cpio.gz");

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(build_initramfs(&PythonRuntime, b"print(1)\n", None, &out))
            .unwrap();

        let compressed = std::fs::read(&out).unwrap();
        let mut decoder = flate2::read::GzDecoder::new(compressed.as_slice());
        let mut archive = Vec::new();
        decoder.read_to_end(&mut archive).unwrap();

        let needle = b"lambda/code.py";
        assert!(archive.windows(needle.len()).any(|w| w == needle));
        assert!(archive.windows(4).any(|w| w == b"init"));
    }

    #[test]
    fn initramfs_appends_overlay_after_base() {
        let dir = tempfile::tempdir().unwrap();
        let base_path = dir.path().join("base.cpio.gz");
        let out = dir.path().join("initramfs.cpio.gz");

        // A tiny valid base archive.
        let mut base = Vec::new();
        cpio::write_gzipped(&[cpio::directory("usr")], &mut base).unwrap();
        std::fs::write(&base_path, &base).unwrap();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(build_initramfs(
            &PythonRuntime,
            b"print(1)\n",
            Some(&base_path),
            &out,
        ))
        .unwrap();

        let image = std::fs::read(&out).unwrap();
        // The base bytes come first, untouched.
        assert_eq!(&image[..base.len()], &base[..]);
        // And the second gzip member starts right after.
        assert_eq!(&image[base.len()..base.len() + 2], &[0x1f, 0x8b]);
    }
}
