//! Streams remote cargo artifacts into a server volume.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use futures::StreamExt;
use krypton_datamodel::server::CargoFile;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Reduce a panel-supplied target path to one that resolves under the
/// volume: root prefixes and leading parent segments are stripped.
pub fn safe_relative_path(target: &str) -> PathBuf {
    let mut out = PathBuf::new();
    let mut seen_normal = false;

    for component in Path::new(target).components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::CurDir => {}
            Component::ParentDir if !seen_normal => {}
            Component::ParentDir => out.push(".."),
            Component::Normal(part) => {
                seen_normal = true;
                out.push(part);
            }
        }
    }

    out
}

/// Fetch every cargo entry into the volume, applying the file-mode policy.
/// `hidden`, `noDelete` and `customProperties` are metadata only.
pub async fn ship(http: &reqwest::Client, volume: &Path, cargo: &[CargoFile]) -> Result<()> {
    for entry in cargo {
        ship_one(http, volume, entry).await?;
    }
    Ok(())
}

async fn ship_one(http: &reqwest::Client, volume: &Path, entry: &CargoFile) -> Result<()> {
    let target = volume.join(safe_relative_path(&entry.target_path));
    tracing::info!("shipping cargo {} -> {}", entry.url, target.display());

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await?;
    }

    let download = async {
        let response = http
            .get(&entry.url)
            .send()
            .await
            .map_err(|e| Error::Internal(format!("cargo download failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "cargo source answered {} for {}",
                response.status(),
                entry.url
            )));
        }

        let mut file = fs::File::create(&target).await?;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| Error::Internal(format!("cargo stream failed: {e}")))?;
            file.write_all(&chunk).await?;
        }

        file.flush().await?;
        Ok(())
    };

    match tokio::time::timeout(DOWNLOAD_TIMEOUT, download).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(Error::Internal(format!(
                "cargo download of {} timed out",
                entry.url
            )))
        }
    }

    #[cfg(unix)]
    if entry.properties.readonly {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&target, std::fs::Permissions::from_mode(0o444)).await?;
    }

    Ok(())
}
