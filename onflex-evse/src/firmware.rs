//! Firmware update flow
//!
//! Triggered by UpdateFirmware. Every step is reported with a
//! FirmwareStatusNotification (best-effort) and the unit reboots at the end,
//! whether or not the update succeeded:
//!
//! ```text
//! Downloading -> Downloaded | DownloadFailed
//!   -> Installing -> Installed | InstallationFailed
//!   -> delete image -> reboot
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use crate::config::FirmwareSettings;
use crate::error::ErrorKind;
use crate::hal::Rebooter;
use crate::ocpp::{Call, FirmwareStatus, OcppClient};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("Download failed: {0}")]
    Download(#[from] reqwest::Error),

    #[error("Download failed with HTTP {0}")]
    HttpStatus(u16),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("No image to install")]
    MissingImage,

    #[error("Extraction failed: {0}")]
    Extract(String),
}

impl FirmwareError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::CollaboratorFault
    }
}

/// Unpacks a (password protected) firmware archive; blocking
pub trait ArchiveExtractor: Send + Sync {
    fn extract(&self, archive: &Path, destination: &Path, password: Option<&str>) -> Result<(), FirmwareError>;
}

/// Extraction through the `7z` command line tool
#[derive(Debug, Clone)]
pub struct SevenZipCommand {
    program: PathBuf,
}

impl Default for SevenZipCommand {
    fn default() -> Self {
        Self {
            program: PathBuf::from("7z"),
        }
    }
}

impl SevenZipCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }
}

impl ArchiveExtractor for SevenZipCommand {
    fn extract(&self, archive: &Path, destination: &Path, password: Option<&str>) -> Result<(), FirmwareError> {
        let mut command = std::process::Command::new(&self.program);
        command
            .arg("x")
            .arg("-y")
            .arg(format!("-o{}", destination.display()));
        if let Some(password) = password {
            command.arg(format!("-p{}", password));
        }
        command.arg(archive);

        let output = command.output()?;
        if output.status.success() {
            Ok(())
        } else {
            Err(FirmwareError::Extract(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

/// Runs one firmware update; cheap to clone into a task
#[derive(Clone)]
pub struct FirmwareUpdater {
    client: OcppClient,
    settings: FirmwareSettings,
    extractor: Arc<dyn ArchiveExtractor>,
    rebooter: Arc<dyn Rebooter>,
    reboot_delay: Duration,
}

impl FirmwareUpdater {
    pub fn new(
        client: OcppClient,
        settings: FirmwareSettings,
        extractor: Arc<dyn ArchiveExtractor>,
        rebooter: Arc<dyn Rebooter>,
        reboot_delay: Duration,
    ) -> Self {
        Self {
            client,
            settings,
            extractor,
            rebooter,
            reboot_delay,
        }
    }

    /// Download, install and reboot. Never returns early: failures are
    /// reported and the reboot still happens.
    pub async fn run(&self, location: &str) {
        info!("Firmware update from {}", location);

        self.notify(FirmwareStatus::Downloading).await;
        let image = match self.download(location).await {
            Ok(image) => {
                self.notify(FirmwareStatus::Downloaded).await;
                Some(image)
            }
            Err(e) => {
                error!("Firmware download failed: {}", e);
                self.notify(FirmwareStatus::DownloadFailed).await;
                None
            }
        };

        self.notify(FirmwareStatus::Installing).await;
        let installed = match &image {
            Some(image) => self.install(image.path()).await,
            None => Err(FirmwareError::MissingImage),
        };
        match installed {
            Ok(()) => {
                info!("Firmware installed");
                self.notify(FirmwareStatus::Installed).await;
            }
            Err(e) => {
                error!("Firmware installation failed: {}", e);
                self.notify(FirmwareStatus::InstallationFailed).await;
            }
        }

        if let Some(image) = image {
            if let Err(e) = image.close() {
                warn!("Failed to delete firmware image: {}", e);
            }
        }

        info!("Rebooting in {:?}", self.reboot_delay);
        tokio::time::sleep(self.reboot_delay).await;
        if let Err(e) = self.rebooter.reboot() {
            error!("Reboot failed: {}", e);
        }
    }

    async fn download(&self, location: &str) -> Result<NamedTempFile, FirmwareError> {
        let http = reqwest::Client::builder().timeout(DOWNLOAD_TIMEOUT).build()?;
        let mut response = http.get(location).send().await?;
        if !response.status().is_success() {
            return Err(FirmwareError::HttpStatus(response.status().as_u16()));
        }

        tokio::fs::create_dir_all(&self.settings.directory).await?;
        let image = tempfile::Builder::new()
            .prefix("firmware-")
            .suffix(".bin")
            .tempfile_in(&self.settings.directory)?;

        let mut file = tokio::fs::File::from_std(image.reopen()?);
        let mut size = 0;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            size += chunk.len();
        }
        file.flush().await?;

        info!("Downloaded {} bytes to {}", size, image.path().display());
        Ok(image)
    }

    async fn install(&self, archive: &Path) -> Result<(), FirmwareError> {
        let extractor = self.extractor.clone();
        let archive = archive.to_path_buf();
        let destination = self.settings.install_dir.clone();
        let password = self.settings.archive_password.clone();

        tokio::task::spawn_blocking(move || extractor.extract(&archive, &destination, password.as_deref()))
            .await
            .map_err(|e| FirmwareError::Extract(e.to_string()))?
    }

    async fn notify(&self, status: FirmwareStatus) {
        let result = match Call::firmware_status(status) {
            Ok(call) => self.client.call(call).await.map(drop),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!("FirmwareStatusNotification({:?}) not delivered: {}", status, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_7z_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = SevenZipCommand::new(dir.path().join("no-such-7z"));
        let result = extractor.extract(&dir.path().join("a.bin"), dir.path(), Some("pw"));
        assert!(matches!(result, Err(FirmwareError::Io(_))));
    }

    #[test]
    fn test_error_kind() {
        assert_eq!(FirmwareError::MissingImage.kind(), ErrorKind::CollaboratorFault);
    }
}
