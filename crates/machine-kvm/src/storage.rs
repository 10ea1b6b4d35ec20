//! Backing storage of a machine: boot media, SSH keys and the raw disk.
//!
//! Producing the boot image, the key pair and the initial disk contents is
//! delegated to collaborators supplied by the orchestrator. This module owns
//! what happens around them: sizing the disk, refusing to clobber existing
//! storage, relocating images to the persistent host path and removing them.

use crate::config::MachineSpec;
use crate::error::{DriverError, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Produces the boot image.
#[async_trait]
pub trait BootMediaSource: Send + Sync {
    /// Write the boot image identified by `source` (or the default image
    /// when `None`) to `dest`.
    async fn fetch(&self, source: Option<&str>, dest: &Path) -> Result<()>;
}

/// Produces an SSH key pair.
#[async_trait]
pub trait KeyPairGenerator: Send + Sync {
    /// Write a private key to `private_key` and its public half next to it
    /// with a `.pub` suffix.
    async fn generate(&self, private_key: &Path) -> Result<()>;
}

/// Produces the initial raw disk image.
#[async_trait]
pub trait DiskImageBuilder: Send + Sync {
    /// Write a raw disk image to `dest` that authorizes `public_key` and is
    /// meant to hold `size_mb` MB. The driver fixes the final length itself.
    async fn build(&self, public_key: &Path, dest: &Path, size_mb: u64) -> Result<()>;
}

/// The collaborators a machine needs to create its storage.
#[derive(Clone)]
pub struct Provisioners {
    pub boot_media: Arc<dyn BootMediaSource>,
    pub keys: Arc<dyn KeyPairGenerator>,
    pub disk: Arc<dyn DiskImageBuilder>,
}

/// Paths of the images after relocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocatedImages {
    pub dir: PathBuf,
    pub boot_image_path: PathBuf,
    pub disk_path: PathBuf,
}

/// Create boot media, key pair and disk image for `spec`.
///
/// An existing disk image of exactly the requested size is reused.
///
/// # Errors
/// Returns [`DriverError::StorageConflict`] if the disk path holds anything
/// else, or the collaborator's error unchanged.
pub async fn prepare(spec: &MachineSpec, provisioners: &Provisioners) -> Result<()> {
    let name = &spec.machine_name;

    tracing::info!(machine = %name, "Preparing boot media");
    provisioners
        .boot_media
        .fetch(spec.boot_image_source.as_deref(), &spec.boot_image_path)
        .await
        .map_err(|e| {
            tracing::error!(machine = %name, error = %e, "Boot media preparation failed");
            e
        })?;

    tracing::info!(machine = %name, "Creating SSH key");
    provisioners
        .keys
        .generate(&spec.ssh_key_path())
        .await
        .map_err(|e| {
            tracing::error!(machine = %name, error = %e, "SSH key generation failed");
            e
        })?;

    if disk_is_reusable(&spec.disk_path, spec.disk_size_bytes()).await? {
        tracing::info!(
            machine = %name,
            path = %spec.disk_path.display(),
            "Reusing existing disk image"
        );
        return Ok(());
    }

    tracing::info!(machine = %name, size_mb = spec.disk_size_mb, "Creating raw disk image");
    provisioners
        .disk
        .build(&spec.public_key_path(), &spec.disk_path, spec.disk_size_mb)
        .await
        .map_err(|e| {
            tracing::error!(machine = %name, error = %e, "Disk image construction failed");
            e
        })?;
    set_disk_size(&spec.disk_path, spec.disk_size_bytes()).await
}

/// Whether `path` already holds a disk image that can be used as is.
///
/// `Ok(false)` means nothing is there yet.
async fn disk_is_reusable(path: &Path, size_bytes: u64) -> Result<bool> {
    let meta = match tokio::fs::metadata(path).await {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e.into()),
    };
    if !meta.is_file() {
        return Err(DriverError::StorageConflict {
            path: path.to_path_buf(),
            reason: "disk path exists and is not a regular file".into(),
        });
    }
    if meta.len() != size_bytes {
        return Err(DriverError::StorageConflict {
            path: path.to_path_buf(),
            reason: format!(
                "existing disk image is {} bytes, expected {size_bytes}",
                meta.len()
            ),
        });
    }
    Ok(true)
}

/// Truncate or extend the image at `path` to exactly `size_bytes`.
///
/// Extending leaves a hole, so the file stays sparse where the filesystem
/// supports it.
pub async fn set_disk_size(path: &Path, size_bytes: u64) -> Result<()> {
    let file = tokio::fs::OpenOptions::new().write(true).open(path).await?;
    file.set_len(size_bytes).await?;
    tracing::debug!(path = %path.display(), size_bytes, "Disk image sized");
    Ok(())
}

/// Move the boot and disk images into `<host_path>/<machine>_persistent/`.
///
/// Files are renamed, not copied. Returns `None` if no host path is set.
///
/// # Errors
/// Returns [`DriverError::StorageConflict`] if the persistent directory
/// already exists.
pub async fn relocate(spec: &MachineSpec) -> Result<Option<RelocatedImages>> {
    let Some(dir) = spec.persistent_dir() else {
        return Ok(None);
    };

    match tokio::fs::create_dir(&dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::AlreadyExists => {
            return Err(DriverError::StorageConflict {
                path: dir,
                reason: "persistent directory already exists".into(),
            });
        }
        Err(e) => return Err(e.into()),
    }

    let disk_name = spec
        .disk_path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("{}.img", spec.machine_name)));
    let relocated = RelocatedImages {
        boot_image_path: dir.join(crate::config::BOOT_IMAGE_FILENAME),
        disk_path: dir.join(disk_name),
        dir,
    };

    let moved = move_images(spec, &relocated).await;
    if let Err(e) = moved {
        if let Err(restore_err) = restore(spec, &relocated).await {
            tracing::warn!(
                machine = %spec.machine_name,
                error = %restore_err,
                "Failed to undo partial relocation"
            );
        }
        return Err(e);
    }
    tracing::info!(
        machine = %spec.machine_name,
        dir = %relocated.dir.display(),
        "Relocated images to persistent storage"
    );
    Ok(Some(relocated))
}

async fn move_images(spec: &MachineSpec, relocated: &RelocatedImages) -> Result<()> {
    tokio::fs::rename(&spec.disk_path, &relocated.disk_path).await?;
    tokio::fs::rename(&spec.boot_image_path, &relocated.boot_image_path).await?;
    Ok(())
}

/// Undo [`relocate`]: move the images back to the paths in `spec` and
/// delete the persistent directory.
///
/// Images that were never moved are skipped, so this also cleans up after a
/// relocation that failed halfway.
pub async fn restore(spec: &MachineSpec, relocated: &RelocatedImages) -> Result<()> {
    for (from, to) in [
        (&relocated.disk_path, &spec.disk_path),
        (&relocated.boot_image_path, &spec.boot_image_path),
    ] {
        match tokio::fs::rename(from, to).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    match tokio::fs::remove_dir(&relocated.dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tracing::debug!(
        machine = %spec.machine_name,
        dir = %relocated.dir.display(),
        "Moved images back from persistent storage"
    );
    Ok(())
}

/// Delete the persistent storage directory of `spec`, if there is one.
///
/// A directory that doesn't exist is not an error. Returns whether
/// anything was removed.
pub async fn remove_persistent(spec: &MachineSpec) -> Result<bool> {
    let Some(dir) = spec.persistent_dir() else {
        return Ok(false);
    };
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => {
            tracing::debug!(dir = %dir.display(), "Removed persistent storage");
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            tracing::debug!(dir = %dir.display(), "No persistent storage to remove");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}
