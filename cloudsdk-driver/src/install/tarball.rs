//! Fetching and unpacking SDK release tars.
//!
//! A tar location is either an HTTP(S) URL or a local path. Downloads land
//! in `<root>/downloads` and are reused by a later init against the same
//! root. Unpacking understands the two published layouts: a *repo* tar
//! carries a component snapshot plus a nested installer tar, while a plain
//! *installer* tar carries the SDK directory itself.

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tar::Archive;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{DriverError, Result};

// =============================================================================
// Constants
// =============================================================================

/// Directory under the installation root where downloads are cached.
pub const DOWNLOADS_DIR: &str = "downloads";

/// Directory under the installation root where tars are first extracted.
pub const REPO_DIR: &str = "repo";

/// Component snapshot file name. Its presence marks a repo tar.
pub const COMPONENTS_FILE: &str = "components-2.json";

/// Name of the installer tar nested inside a repo tar.
pub const INSTALLER_FILE: &str = "google-cloud-sdk.tar.gz";

// =============================================================================
// Fetch
// =============================================================================

/// Resolves a tar location to a local file, downloading when it is a URL.
///
/// Downloaded tars are cached under `<root>/downloads` keyed by the URL's
/// file name; a cached file that passes the checksum (when one is given) is
/// reused without a network round trip. A local path is used in place after
/// an existence check, verified against `expected_sha256` when given.
pub async fn fetch(
    tar_location: &str,
    root_dir: &Path,
    expected_sha256: Option<&str>,
) -> Result<PathBuf> {
    match parse_url(tar_location) {
        Some(url) => {
            let file_name = url
                .path_segments()
                .and_then(|segments| segments.last())
                .filter(|name| !name.is_empty())
                .unwrap_or(INSTALLER_FILE);
            let dest = root_dir.join(DOWNLOADS_DIR).join(file_name);

            if dest.is_file() {
                match expected_sha256 {
                    None => {
                        debug!("Reusing cached tar {}", dest.display());
                        return Ok(dest);
                    }
                    Some(expected) => {
                        if file_sha256(&dest)? == expected.to_lowercase() {
                            debug!("Reusing cached tar {}", dest.display());
                            return Ok(dest);
                        }
                        warn!(
                            "Cached tar {} failed checksum, downloading again",
                            dest.display()
                        );
                        fs::remove_file(&dest)?;
                    }
                }
            }

            download(&url, &dest, expected_sha256).await?;
            Ok(dest)
        }
        None => {
            let path = PathBuf::from(tar_location);
            if !path.is_file() {
                return Err(DriverError::MissingTar { path });
            }
            if let Some(expected) = expected_sha256 {
                let actual = file_sha256(&path)?;
                if actual != expected.to_lowercase() {
                    return Err(DriverError::ChecksumMismatch {
                        expected: expected.to_string(),
                        actual,
                    });
                }
            }
            Ok(path)
        }
    }
}

/// URLs download, everything else is treated as a local path. `Url::parse`
/// rejects scheme-less strings, which is exactly the split we need.
fn parse_url(location: &str) -> Option<Url> {
    Url::parse(location).ok()
}

async fn download(url: &Url, dest: &Path, expected_sha256: Option<&str>) -> Result<()> {
    info!("Downloading {} to {}", url, dest.display());

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let response = reqwest::Client::new()
        .get(url.clone())
        .send()
        .await
        .map_err(|source| DriverError::Download {
            url: url.to_string(),
            source,
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(DriverError::DownloadStatus {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    debug!("Content-Length: {:?}", response.content_length());

    let mut file = tokio::fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();
    let mut hasher = Sha256::new();
    let mut bytes_downloaded: u64 = 0;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|source| DriverError::Download {
            url: url.to_string(),
            source,
        })?;
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
        bytes_downloaded += chunk.len() as u64;
    }
    file.flush().await?;

    if let Some(expected) = expected_sha256 {
        let actual = format_sha256_hex(&hasher.finalize());
        if actual != expected.to_lowercase() {
            // Delete the corrupted file so a retry starts clean.
            let _ = tokio::fs::remove_file(dest).await;
            return Err(DriverError::ChecksumMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        debug!("SHA256 verified: {}", actual);
    }

    info!(
        "Download complete: {} bytes written to {}",
        bytes_downloaded,
        dest.display()
    );

    Ok(())
}

/// Formats a SHA256 hash as lowercase hex without using the hex crate.
fn format_sha256_hex(hash: &[u8]) -> String {
    hash.iter().map(|b| format!("{:02x}", b)).collect()
}

fn file_sha256(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(format_sha256_hex(&hasher.finalize()))
}

// =============================================================================
// Unpack
// =============================================================================

/// Unpacks a fetched tar into the installation root.
///
/// The tar is first extracted into `<root>/repo` without overwriting
/// anything already there. If that reveals a `components-2.json`, this was a
/// repo tar: its snapshot becomes the returned `file://` URL and the nested
/// installer tar is extracted into the root. Otherwise the entries move up
/// into the root, and for a local tar a `components-2.json` sitting next to
/// the tar is tried as the snapshot.
pub fn unpack(tar_path: &Path, tar_location: &str, root_dir: &Path) -> Result<Option<String>> {
    let repo_dir = root_dir.join(REPO_DIR);
    fs::create_dir_all(&repo_dir)?;
    extract_tar_gz(tar_path, &repo_dir)?;

    let components = repo_dir.join(COMPONENTS_FILE);
    if components.is_file() {
        let snapshot = file_url(&components);
        let installer = repo_dir.join(INSTALLER_FILE);
        if !installer.is_file() {
            return Err(DriverError::MissingTar { path: installer });
        }
        extract_tar_gz(&installer, root_dir)?;
        info!(
            "Unpacked repo tar {} into {}",
            tar_path.display(),
            root_dir.display()
        );
        return Ok(Some(snapshot));
    }

    let snapshot = sibling_snapshot(tar_location);
    for entry in fs::read_dir(&repo_dir)? {
        let entry = entry?;
        let target = root_dir.join(entry.file_name());
        if target.exists() {
            debug!("Not overwriting {}", target.display());
            continue;
        }
        fs::rename(entry.path(), &target)?;
    }
    info!(
        "Unpacked installer tar {} into {}",
        tar_path.display(),
        root_dir.display()
    );
    Ok(snapshot)
}

/// For a local installer tar, a component snapshot may sit next to the tar.
fn sibling_snapshot(tar_location: &str) -> Option<String> {
    if parse_url(tar_location).is_some() {
        return None;
    }
    let sibling = Path::new(tar_location).parent()?.join(COMPONENTS_FILE);
    if sibling.is_file() {
        Some(file_url(&sibling))
    } else {
        None
    }
}

fn file_url(path: &Path) -> String {
    let absolute = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    format!("file://{}", absolute.display())
}

// =============================================================================
// TAR Extraction
// =============================================================================

fn extract_tar_gz(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let file = File::open(archive_path).map_err(|source| DriverError::Unpack {
        path: archive_path.to_path_buf(),
        source,
    })?;
    let decoder = GzDecoder::new(BufReader::new(file));
    extract_tar(decoder, archive_path, dest_dir)
}

/// Extracts a tar stream, skipping existing files and unsafe entries.
fn extract_tar<R: Read>(reader: R, archive_path: &Path, dest_dir: &Path) -> Result<()> {
    let unpack_err = |source: io::Error| DriverError::Unpack {
        path: archive_path.to_path_buf(),
        source,
    };

    let mut archive = Archive::new(reader);
    let dest_dir_canonical = dest_dir
        .canonicalize()
        .unwrap_or_else(|_| dest_dir.to_path_buf());

    for entry_result in archive.entries().map_err(unpack_err)? {
        let mut entry = entry_result.map_err(unpack_err)?;
        let entry_type = entry.header().entry_type();

        // Security: Skip symlinks and hardlinks entirely to prevent escape attacks
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            warn!("Skipping symlink/hardlink in tar archive (security)");
            continue;
        }

        let path = entry.path().map_err(unpack_err)?;

        // Security: skip absolute paths and paths with ..
        if path.is_absolute()
            || path
                .components()
                .any(|c| c == std::path::Component::ParentDir)
        {
            warn!("Skipping unsafe path in tar: {:?}", path);
            continue;
        }

        let dest_path = dest_dir.join(&path);

        // Security: Verify destination is within dest_dir
        let dest_canonical = if dest_path.exists() {
            dest_path.canonicalize().map_err(unpack_err)?
        } else if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent).map_err(unpack_err)?;
            let parent_canonical = parent.canonicalize().map_err(unpack_err)?;
            parent_canonical.join(dest_path.file_name().unwrap_or_default())
        } else {
            dest_path.clone()
        };

        if !dest_canonical.starts_with(&dest_dir_canonical) {
            warn!(
                "Skipping path that escapes dest_dir: {:?} -> {:?}",
                path, dest_canonical
            );
            continue;
        }

        if entry_type.is_dir() {
            fs::create_dir_all(&dest_path).map_err(unpack_err)?;
        } else if entry_type.is_file() {
            if dest_path.exists() {
                debug!("Not overwriting {}", dest_path.display());
                continue;
            }
            if let Some(parent) = dest_path.parent() {
                fs::create_dir_all(parent).map_err(unpack_err)?;
            }

            let mut outfile = File::create(&dest_path).map_err(unpack_err)?;
            io::copy(&mut entry, &mut outfile).map_err(unpack_err)?;
            outfile.flush().map_err(unpack_err)?;

            #[cfg(unix)]
            {
                if let Ok(mode) = entry.header().mode() {
                    set_unix_permissions(&dest_path, mode).map_err(unpack_err)?;
                }
            }
        }
    }

    debug!("TAR extraction complete");
    Ok(())
}

#[cfg(unix)]
fn set_unix_permissions(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if mode & 0o111 != 0 {
        fs::set_permissions(path, fs::Permissions::from_mode(mode | 0o755))?;
    }
    Ok(())
}
