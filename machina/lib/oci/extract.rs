use std::{
    fs::{self, File, Permissions},
    io::{self, BufReader, Read, Seek, SeekFrom},
    os::unix::fs::PermissionsExt,
    path::{Component, Path, PathBuf},
};

use flate2::read::GzDecoder;
use futures::future;
use oci_spec::image::Platform;
use tar::{Archive, EntryType};

use crate::{MachinaError, MachinaResult};

use super::{Reference, RegistryClient, RegistryPull};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The two-byte magic prefix of a gzip stream.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// The mode applied to regular files whose tar header carries none.
const DEFAULT_FILE_MODE: u32 = 0o644;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Pulls `reference` from its registry and materializes its layers into
/// `dest_dir`, last layer winning at every path.
///
/// Layers are downloaded concurrently but applied strictly in manifest order.
/// Whiteout/opaque-directory markers are not interpreted; images that rely on
/// inter-layer deletion come out with the marker files extracted verbatim.
///
/// On any layer failure the extraction aborts with the wrapped cause and
/// `dest_dir` is left as-is for inspection; the caller must discard it.
pub async fn extract_from_image(
    reference: &Reference,
    dest_dir: impl AsRef<Path>,
) -> MachinaResult<()> {
    let registry = RegistryClient::for_reference(reference);
    extract_with_registry(&registry, reference, dest_dir).await
}

/// Extraction driver, generic over the registry seam.
pub async fn extract_with_registry(
    registry: &impl RegistryPull,
    reference: &Reference,
    dest_dir: impl AsRef<Path>,
) -> MachinaResult<()> {
    let dest_dir = dest_dir.as_ref().to_path_buf();
    let repository = reference.repository();

    let index = registry.fetch_index(repository, reference.tag()).await?;

    // Select the right manifest for the platform or fall back to the first.
    let platform = Platform::default();
    let descriptor = index
        .manifests()
        .iter()
        .find(|m| m.platform().as_ref().is_some_and(|p| p == &platform))
        .or_else(|| index.manifests().first())
        .ok_or(MachinaError::ManifestNotFound)?;

    let manifest = registry
        .fetch_manifest(repository, descriptor.digest())
        .await?;

    tracing::info!(
        "extracting {} ({} layers) into {}",
        reference,
        manifest.layers().len(),
        dest_dir.display()
    );

    let download_dir = tempfile::tempdir()?;

    // Download every layer blob concurrently.
    let download_futures: Vec<_> = manifest
        .layers()
        .iter()
        .map(|layer| {
            let layer_path = download_dir.path().join(layer.digest().to_string());
            registry.download_blob(repository, layer.digest(), layer.size(), layer_path)
        })
        .collect();

    for result in future::join_all(download_futures).await {
        result?;
    }

    // Apply in manifest order: a later layer supersedes earlier ones at the
    // same path.
    fs::create_dir_all(&dest_dir)?;
    for layer in manifest.layers() {
        let layer_digest = layer.digest().to_string();
        let layer_path = download_dir.path().join(&layer_digest);
        let dest = dest_dir.clone();

        tokio::task::spawn_blocking(move || apply_layer(&layer_path, &dest, &layer_digest))
            .await??;
    }

    Ok(())
}

/// Applies one layer archive onto `dest_dir`.
///
/// The stream is sniffed for the gzip magic so both compressed and raw tar
/// layers are accepted.
pub(crate) fn apply_layer(
    layer_path: &Path,
    dest_dir: &Path,
    layer_digest: &str,
) -> MachinaResult<()> {
    let wrap = |source: io::Error| MachinaError::Extraction {
        source,
        layer: layer_digest.to_string(),
    };

    let mut file = File::open(layer_path).map_err(wrap)?;
    let mut magic = [0u8; 2];
    let sniffed = file.read(&mut magic).map_err(wrap)?;
    file.seek(SeekFrom::Start(0)).map_err(wrap)?;

    let reader: Box<dyn Read> = if sniffed == 2 && magic == GZIP_MAGIC {
        Box::new(GzDecoder::new(BufReader::new(file)))
    } else {
        Box::new(BufReader::new(file))
    };

    let mut archive = Archive::new(reader);
    for entry in archive.entries().map_err(wrap)? {
        let mut entry = entry.map_err(wrap)?;
        let entry_path = entry.path().map_err(wrap)?.into_owned();
        let target = join_under_root(dest_dir, &entry_path).map_err(wrap)?;
        let mode = entry.header().mode().unwrap_or(DEFAULT_FILE_MODE) & 0o7777;

        match entry.header().entry_type() {
            EntryType::Directory => {
                // Intermediate components get default modes; only the named
                // directory takes the header's mode.
                fs::create_dir_all(&target).map_err(wrap)?;
                fs::set_permissions(&target, Permissions::from_mode(mode)).map_err(wrap)?;
            }
            EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(wrap)?;
                }
                let mut out = File::create(&target).map_err(wrap)?;
                io::copy(&mut entry, &mut out).map_err(wrap)?;
                drop(out);
                // The mode is applied after the content is fully written; it
                // cannot always be set atomically at creation.
                fs::set_permissions(&target, Permissions::from_mode(mode)).map_err(wrap)?;
            }
            EntryType::Symlink => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).map_err(wrap)?;
                }
                let link_target = entry
                    .link_name()
                    .map_err(wrap)?
                    .ok_or_else(|| {
                        wrap(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("symlink entry {} has no target", entry_path.display()),
                        ))
                    })?
                    .into_owned();

                // A later layer may replace a file (or directory) with a
                // symlink at the same path.
                if let Ok(meta) = fs::symlink_metadata(&target) {
                    if meta.is_dir() {
                        fs::remove_dir_all(&target).map_err(wrap)?;
                    } else {
                        fs::remove_file(&target).map_err(wrap)?;
                    }
                }

                std::os::unix::fs::symlink(&link_target, &target).map_err(wrap)?;
            }
            // Hard links, fifos, devices and anything else are skipped.
            _ => continue,
        }
    }

    Ok(())
}

/// Joins a tar entry path under the extraction root, rejecting entries that
/// would escape it.
fn join_under_root(root: &Path, entry_path: &Path) -> io::Result<PathBuf> {
    let mut target = root.to_path_buf();
    for component in entry_path.components() {
        match component {
            Component::Normal(part) => target.push(part),
            Component::CurDir => {}
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("entry path escapes extraction root: {}", entry_path.display()),
                ));
            }
        }
    }
    Ok(target)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
