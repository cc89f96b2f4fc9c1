//! SDK installation lifecycle.
//!
//! One installation is live per process at a time. [`Installation::init`]
//! provisions it: resolve the root directory, fetch the release tar, unpack
//! it, and run the bundled installer. [`Installation::destroy`] removes it
//! again. Many SDK handles share one installation, so initialize once in a
//! coordinating context before spawning concurrent work; destroying while
//! commands are still in flight is not supported.

pub mod tarball;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::keys;
use crate::error::{DriverError, Result};

// =============================================================================
// Constants
// =============================================================================

/// The public rapid-channel release tar, used when no location is given.
pub const RELEASE_TAR: &str =
    "https://dl.google.com/dl/cloudsdk/channels/rapid/google-cloud-sdk.tar.gz";

/// Directory the SDK occupies beneath the installation root.
pub const SDK_DIR: &str = "google-cloud-sdk";

/// Binary directory beneath the SDK directory.
const BIN_DIR: &str = "bin";

/// Process-wide marker: exactly one live installation per process.
static INSTALLATION_ACTIVE: AtomicBool = AtomicBool::new(false);

// =============================================================================
// Init Options
// =============================================================================

/// Options accepted by [`Installation::init`].
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Where to fetch the SDK from: an HTTP(S) URL or a local tar path.
    /// Defaults to [`RELEASE_TAR`].
    pub tar_location: Option<String>,
    /// Extra components for the installer's `--additional-components`.
    pub additional_components: Vec<String>,
    /// Where to install. Defaults to a fresh temporary directory. A
    /// directory that already exists is treated as caller-owned and is kept
    /// on destroy.
    pub root_directory: Option<PathBuf>,
    /// Expected SHA256 of the tar, verified after download (lowercase hex).
    pub tar_sha256: Option<String>,
}

// =============================================================================
// Installation
// =============================================================================

/// An installed SDK shared by every handle in the process.
///
/// Obtained from [`Installation::init`] and passed around as
/// `Arc<Installation>`. After [`Installation::destroy`] every operation
/// through any handle fails with [`DriverError::NotInitialized`].
#[derive(Debug)]
pub struct Installation {
    root_dir: PathBuf,
    sdk_dir: PathBuf,
    components: Vec<String>,
    keep_root: bool,
    active: AtomicBool,
}

impl Installation {
    /// Downloads and installs the SDK.
    ///
    /// Fails with [`DriverError::AlreadyInitialized`] when another
    /// installation is live in this process. On any provisioning failure a
    /// root directory this call created is removed again, leaving the
    /// process ready for another `init`.
    pub async fn init(options: InitOptions) -> Result<Arc<Self>> {
        if INSTALLATION_ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(DriverError::AlreadyInitialized);
        }

        let (root_dir, keep_root) = match resolve_root(options.root_directory.as_deref()) {
            Ok(resolved) => resolved,
            Err(err) => {
                INSTALLATION_ACTIVE.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        match Self::provision(&root_dir, &options).await {
            Ok(()) => {
                let installation = Self {
                    sdk_dir: root_dir.join(SDK_DIR),
                    root_dir,
                    components: options.additional_components,
                    keep_root,
                    active: AtomicBool::new(true),
                };
                info!("SDK installed at {}", installation.sdk_dir.display());
                Ok(Arc::new(installation))
            }
            Err(err) => {
                if !keep_root {
                    if let Err(cleanup_err) = fs::remove_dir_all(&root_dir) {
                        warn!(
                            "Failed to clean up {}: {}",
                            root_dir.display(),
                            cleanup_err
                        );
                    }
                }
                INSTALLATION_ACTIVE.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Removes the installation.
    ///
    /// The root directory is deleted recursively unless it pre-existed this
    /// installation. Fails with [`DriverError::NotInitialized`] when already
    /// destroyed.
    pub fn destroy(&self) -> Result<()> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Err(DriverError::NotInitialized);
        }
        INSTALLATION_ACTIVE.store(false, Ordering::SeqCst);

        info!("Destroying SDK installation at {}", self.root_dir.display());
        if self.keep_root {
            debug!("Keeping caller-owned root {}", self.root_dir.display());
        } else if self.root_dir.is_dir() {
            fs::remove_dir_all(&self.root_dir)?;
        }
        Ok(())
    }

    /// The installation root: the SDK directory plus downloads and repo.
    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// The unpacked `google-cloud-sdk` directory.
    pub fn sdk_dir(&self) -> &Path {
        &self.sdk_dir
    }

    /// The directory holding `gcloud` and the other SDK binaries.
    pub fn bin_dir(&self) -> PathBuf {
        self.sdk_dir.join(BIN_DIR)
    }

    /// Absolute path of the installed `gcloud` executable.
    pub fn gcloud_path(&self) -> PathBuf {
        self.bin_dir().join("gcloud")
    }

    /// Components installed beyond the base distribution.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// False once [`Installation::destroy`] has run.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_active(&self) -> Result<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(DriverError::NotInitialized)
        }
    }

    /// Creates an active installation over an existing directory without
    /// provisioning anything (for testing).
    #[cfg(test)]
    pub(crate) fn for_tests(root_dir: &Path) -> Arc<Self> {
        Arc::new(Self {
            root_dir: root_dir.to_path_buf(),
            sdk_dir: root_dir.join(SDK_DIR),
            components: Vec::new(),
            keep_root: true,
            active: AtomicBool::new(true),
        })
    }

    async fn provision(root_dir: &Path, options: &InitOptions) -> Result<()> {
        let tar_location = options.tar_location.as_deref().unwrap_or(RELEASE_TAR);
        info!(
            "Initializing SDK from {} into {}",
            tar_location,
            root_dir.display()
        );

        let tar_path =
            tarball::fetch(tar_location, root_dir, options.tar_sha256.as_deref()).await?;
        let snapshot_url = tarball::unpack(&tar_path, tar_location, root_dir)?;

        let sdk_dir = root_dir.join(SDK_DIR);
        if !sdk_dir.is_dir() {
            return Err(DriverError::Unpack {
                path: tar_path,
                source: io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("tar did not produce a {} directory", SDK_DIR),
                ),
            });
        }

        run_installer(
            root_dir,
            &sdk_dir,
            snapshot_url.as_deref(),
            &options.additional_components,
        )
        .await
    }
}

// =============================================================================
// Installation Guard
// =============================================================================

/// RAII wrapper that destroys the installation when dropped.
///
/// Destruction on drop is best-effort: failures are logged, not raised.
pub struct InstallationGuard {
    installation: Arc<Installation>,
}

impl InstallationGuard {
    /// Initializes an installation that lives as long as the guard.
    pub async fn init(options: InitOptions) -> Result<Self> {
        let installation = Installation::init(options).await?;
        Ok(Self { installation })
    }

    /// Wraps an already-initialized installation.
    pub fn new(installation: Arc<Installation>) -> Self {
        Self { installation }
    }

    pub fn installation(&self) -> &Arc<Installation> {
        &self.installation
    }
}

impl Drop for InstallationGuard {
    fn drop(&mut self) {
        if self.installation.is_active() {
            if let Err(err) = self.installation.destroy() {
                warn!("Failed to destroy installation on drop: {}", err);
            }
        }
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn resolve_root(root_directory: Option<&Path>) -> Result<(PathBuf, bool)> {
    match root_directory {
        Some(dir) => {
            if dir.is_dir() {
                // A directory that already exists is the caller's to keep.
                Ok((dir.to_path_buf(), true))
            } else {
                fs::create_dir_all(dir)?;
                Ok((dir.to_path_buf(), false))
            }
        }
        None => {
            let dir = tempfile::Builder::new()
                .prefix("google-cloud-sdk-driver-")
                .keep(true)
                .tempdir()?;
            Ok((dir.path().to_path_buf(), false))
        }
    }
}

async fn run_installer(
    root_dir: &Path,
    sdk_dir: &Path,
    snapshot_url: Option<&str>,
    components: &[String],
) -> Result<()> {
    let mut command = Command::new("./install.sh");
    command
        .arg("--disable-installation-options")
        .arg("--bash-completion=false")
        .arg("--path-update=false")
        .arg("--usage-reporting=false")
        .arg(format!("--rc-path={}/.bashrc", root_dir.display()))
        .current_dir(sdk_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if !components.is_empty() {
        command.arg("--additional-components").args(components);
    }
    if let Some(snapshot_url) = snapshot_url {
        command.env(keys::SNAPSHOT_ENV, snapshot_url);
    }

    debug!("Running SDK installer in {}", sdk_dir.display());
    let output = command
        .output()
        .await
        .map_err(|source| DriverError::Launch {
            program: "./install.sh".to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(DriverError::Installer {
            exit_code: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    info!("SDK installer finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    /// Installer stub that records its arguments and environment.
    const INSTALL_SCRIPT: &str = "#!/bin/sh\n\
         printf '%s\\n' \"$@\" > install-args.txt\n\
         printf '%s' \"$CLOUDSDK_COMPONENT_MANAGER_SNAPSHOT_URL\" > snapshot-url.txt\n\
         exit 0\n";

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    fn make_sdk_tar(tar_path: &Path, install_script: &str) {
        let file = fs::File::create(tar_path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);

        let entries: &[(&str, &[u8], u32)] = &[
            ("google-cloud-sdk/install.sh", install_script.as_bytes(), 0o755),
            ("google-cloud-sdk/bin/gcloud", b"#!/bin/sh\nexit 0\n", 0o755),
        ];
        for (path, data, mode) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_path(path).unwrap();
            header.set_size(data.len() as u64);
            header.set_mode(*mode);
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.finish().unwrap();
    }

    fn options(tar: &Path, root: &Path) -> InitOptions {
        InitOptions {
            tar_location: Some(tar.to_str().unwrap().to_string()),
            root_directory: Some(root.to_path_buf()),
            ..InitOptions::default()
        }
    }

    #[tokio::test]
    #[serial]
    async fn test_init_from_local_tar_and_destroy() {
        init_tracing();
        let base = TempDir::new().unwrap();
        let tar = base.path().join("sdk.tar.gz");
        make_sdk_tar(&tar, INSTALL_SCRIPT);
        let root = base.path().join("root");

        let installation = Installation::init(options(&tar, &root)).await.unwrap();

        assert!(installation.is_active());
        assert_eq!(installation.sdk_dir(), root.join(SDK_DIR));
        assert!(installation.gcloud_path().is_file());

        let args = fs::read_to_string(installation.sdk_dir().join("install-args.txt")).unwrap();
        for flag in [
            "--disable-installation-options",
            "--bash-completion=false",
            "--path-update=false",
            "--usage-reporting=false",
        ] {
            assert!(args.contains(flag), "missing {flag} in: {args}");
        }
        assert!(args.contains(&format!("--rc-path={}/.bashrc", root.display())));
        assert!(!args.contains("--additional-components"));

        installation.destroy().unwrap();
        assert!(!installation.is_active());
        assert!(!root.exists());

        let err = installation.destroy().unwrap_err();
        assert!(matches!(err, DriverError::NotInitialized));
    }

    #[tokio::test]
    #[serial]
    async fn test_init_twice_requires_destroy() {
        let base = TempDir::new().unwrap();
        let tar = base.path().join("sdk.tar.gz");
        make_sdk_tar(&tar, INSTALL_SCRIPT);

        let first = Installation::init(options(&tar, &base.path().join("root1")))
            .await
            .unwrap();

        let err = Installation::init(options(&tar, &base.path().join("root2")))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::AlreadyInitialized));

        first.destroy().unwrap();

        let second = Installation::init(options(&tar, &base.path().join("root3")))
            .await
            .unwrap();
        second.destroy().unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_failed_init_cleans_up_and_releases_guard() {
        let base = TempDir::new().unwrap();
        let missing_tar = base.path().join("nope.tar.gz");
        let root = base.path().join("root");

        let err = Installation::init(options(&missing_tar, &root))
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::MissingTar { .. }));
        assert!(!root.exists(), "failed init left its root behind");

        // The process guard was released, so a fresh init works.
        let tar = base.path().join("sdk.tar.gz");
        make_sdk_tar(&tar, INSTALL_SCRIPT);
        let installation = Installation::init(options(&tar, &root)).await.unwrap();
        installation.destroy().unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_installer_failure_reports_stderr() {
        let base = TempDir::new().unwrap();
        let tar = base.path().join("sdk.tar.gz");
        make_sdk_tar(&tar, "#!/bin/sh\necho 'disk full' >&2\nexit 3\n");
        let root = base.path().join("root");

        let err = Installation::init(options(&tar, &root)).await.unwrap_err();
        match err {
            DriverError::Installer { exit_code, stderr } => {
                assert_eq!(exit_code, 3);
                assert!(stderr.contains("disk full"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!root.exists());
    }

    #[tokio::test]
    #[serial]
    async fn test_additional_components_forwarded() {
        let base = TempDir::new().unwrap();
        let tar = base.path().join("sdk.tar.gz");
        make_sdk_tar(&tar, INSTALL_SCRIPT);
        let root = base.path().join("root");

        let mut opts = options(&tar, &root);
        opts.additional_components = vec!["alpha".to_string(), "beta".to_string()];
        let installation = Installation::init(opts).await.unwrap();

        let args = fs::read_to_string(installation.sdk_dir().join("install-args.txt")).unwrap();
        assert!(args.contains("--additional-components\nalpha\nbeta"));
        assert_eq!(installation.components(), ["alpha", "beta"]);

        installation.destroy().unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_pre_existing_root_survives_destroy() {
        let base = TempDir::new().unwrap();
        let tar = base.path().join("sdk.tar.gz");
        make_sdk_tar(&tar, INSTALL_SCRIPT);
        let root = base.path().join("root");
        fs::create_dir_all(&root).unwrap();

        let installation = Installation::init(options(&tar, &root)).await.unwrap();
        installation.destroy().unwrap();

        assert!(root.is_dir(), "caller-owned root was deleted");
        assert!(root.join(SDK_DIR).is_dir());
    }

    #[tokio::test]
    #[serial]
    async fn test_snapshot_url_reaches_installer() {
        let base = TempDir::new().unwrap();
        let tar = base.path().join("sdk.tar.gz");
        make_sdk_tar(&tar, INSTALL_SCRIPT);
        // A components file next to a local tar becomes the snapshot.
        fs::write(base.path().join(tarball::COMPONENTS_FILE), b"{}").unwrap();
        let root = base.path().join("root");

        let installation = Installation::init(options(&tar, &root)).await.unwrap();

        let snapshot =
            fs::read_to_string(installation.sdk_dir().join("snapshot-url.txt")).unwrap();
        assert!(snapshot.starts_with("file://"), "snapshot: {snapshot}");
        assert!(snapshot.ends_with(tarball::COMPONENTS_FILE));

        installation.destroy().unwrap();
    }

    #[tokio::test]
    #[serial]
    async fn test_guard_destroys_on_drop() {
        let base = TempDir::new().unwrap();
        let tar = base.path().join("sdk.tar.gz");
        make_sdk_tar(&tar, INSTALL_SCRIPT);
        let root = base.path().join("root");

        let guard = InstallationGuard::init(options(&tar, &root)).await.unwrap();
        assert!(guard.installation().is_active());
        drop(guard);

        assert!(!root.exists(), "guard drop did not remove the root");

        // The lifecycle slot is free again.
        let installation = Installation::init(options(&tar, &root)).await.unwrap();
        installation.destroy().unwrap();
    }
}
