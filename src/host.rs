//! Host file gateway (§4.7): operations that touch the *local* (Linux host)
//! filesystem rather than the remote legacy client, confined to the relay's
//! startup directory.

use std::path::{Component, Path, PathBuf};

use log::info;
use tokio::io::AsyncWrite;

use crate::error::RelayError;
use crate::ops;
use crate::session::Session;

/// Expand a leading `~` or `~/...` against `$HOME`, leaving everything else
/// untouched.
fn expand_tilde(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(rest);
        }
    } else if raw == "~" {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home);
        }
    }
    PathBuf::from(raw)
}

/// Lexically collapse `.`/`..` components without touching the filesystem —
/// the destination of a write may not exist yet, so `fs::canonicalize` is
/// not an option (mirrors `ops::resolve_remote_path`'s lexical approach,
/// §4.5/§9, applied to host paths instead of remote POSIX paths).
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !matches!(out.components().next_back(), None | Some(Component::RootDir)) {
                    out.pop();
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Resolve `raw` to an absolute host path and enforce that it is a
/// descendant of `base_dir` (§4.7 confinement, scenario 6).
pub fn resolve_host_path(base_dir: &Path, raw: &str) -> color_eyre::Result<PathBuf> {
    let expanded = expand_tilde(raw);
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        base_dir.join(expanded)
    };
    let normalized = normalize_lexically(&absolute);
    if !normalized.starts_with(base_dir) {
        return Err(RelayError::HostPathConfinement {
            base: base_dir.display().to_string(),
        }
        .into());
    }
    Ok(normalized)
}

/// `upload_to_host`: read a file from the remote client and write it to the
/// host filesystem at a confined path (§4.7).
pub async fn upload_to_host<W: AsyncWrite + Unpin>(
    session: &Session<W>,
    base_dir: &Path,
    remote_path: &str,
    host_path: &str,
    overwrite: bool,
) -> color_eyre::Result<()> {
    let dest = resolve_host_path(base_dir, host_path)?;
    if !overwrite && dest.exists() {
        return Err(RelayError::OverwriteRefused {
            path: dest.display().to_string(),
        }
        .into());
    }
    let bytes = ops::file_read(session, remote_path).await?;
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&dest, &bytes).await?;
    info!("uploaded {remote_path} -> {}", dest.display());
    Ok(())
}

/// `download_from_host`: read a file from the host filesystem and write it
/// to the remote client (§4.7).
pub async fn download_from_host<W: AsyncWrite + Unpin>(
    session: &Session<W>,
    base_dir: &Path,
    host_path: &str,
    remote_path: &str,
    overwrite: bool,
) -> color_eyre::Result<()> {
    let src = resolve_host_path(base_dir, host_path)?;
    if !overwrite && ops::file_exists(session, remote_path).await? {
        return Err(RelayError::OverwriteRefused {
            path: remote_path.to_string(),
        }
        .into());
    }
    let bytes = tokio::fs::read(&src).await?;
    ops::file_write(session, remote_path, &bytes, 0o644).await?;
    info!("downloaded {} -> {remote_path}", src.display());
    Ok(())
}

const DOWNLOAD_URL_USER_AGENT: &str = "claude-telepresence/2.0";
const DOWNLOAD_URL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

/// `download_url`: fetch `url` over the host's TLS stack and write the body
/// to the remote client via `FILE_WRITE` (§4.7). Relative `path` values are
/// rewritten under `/tmp` rather than resolved against the remote cwd, since
/// there is no local notion of "relative to the remote session" here.
pub async fn download_url<W: AsyncWrite + Unpin>(
    session: &Session<W>,
    url: &str,
    path: &str,
) -> color_eyre::Result<()> {
    let remote_path = if path.starts_with('/') {
        path.to_string()
    } else {
        let name = Path::new(path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "download".to_string());
        format!("/tmp/{name}")
    };

    let client = reqwest::Client::builder()
        .timeout(DOWNLOAD_URL_TIMEOUT)
        .user_agent(DOWNLOAD_URL_USER_AGENT)
        .build()?;
    let response = client.get(url).send().await?.error_for_status()?;
    let body = response.bytes().await?;
    ops::file_write(session, &remote_path, &body, 0o644).await?;
    info!("downloaded {url} -> {remote_path} ({} bytes)", body.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confines_relative_path_under_base() {
        let base = PathBuf::from("/srv/work");
        let resolved = resolve_host_path(&base, "sub/dir/file.txt").unwrap();
        assert_eq!(resolved, PathBuf::from("/srv/work/sub/dir/file.txt"));
    }

    #[test]
    fn rejects_traversal_outside_base() {
        let base = PathBuf::from("/srv/work");
        let err = resolve_host_path(&base, "../../etc/passwd").unwrap_err();
        assert!(err.to_string().contains("/srv/work"));
    }

    #[test]
    fn rejects_absolute_path_outside_base() {
        let base = PathBuf::from("/srv/work");
        let err = resolve_host_path(&base, "/etc/passwd").unwrap_err();
        assert!(err.to_string().contains("must be under"));
    }

    #[test]
    fn absolute_path_inside_base_is_accepted() {
        let base = PathBuf::from("/srv/work");
        let resolved = resolve_host_path(&base, "/srv/work/tmp/x").unwrap();
        assert_eq!(resolved, PathBuf::from("/srv/work/tmp/x"));
    }
}
