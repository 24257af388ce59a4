use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
};

use tokio::process::Command;

use crate::{BuildStep, MachinaError, MachinaResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The capacity used when the source content size cannot be measured.
pub const DEFAULT_IMAGE_SIZE_MB: u64 = 1024;

/// The minimum capacity of an automatically sized image.
const MIN_IMAGE_SIZE_MB: u64 = 64;

/// Extra headroom granted on top of the measured content size, in percent.
const SIZE_HEADROOM_PERCENT: u64 = 20;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds a fixed-size ext4 block image at `output_image` containing the tree
/// under `source_dir`.
///
/// `size_mb == 0` requests automatic sizing from the source content plus
/// headroom; an explicit size smaller than the measured content fails before
/// anything is allocated or copied.
///
/// The dangerous operations are delegated to mature external tools (`dd`,
/// `mkfs.ext4`, `mount`, `cp`, `umount`); every invocation captures
/// stdout/stderr and the exit code, and a failed sub-operation is reported as
/// a [`MachinaError::Build`] tagged with the failing step. The mount taken in
/// the middle of the build is released on every exit path, and the
/// process-unique mount point directory is removed regardless of outcome.
pub async fn create_ext4_image(
    source_dir: impl AsRef<Path>,
    output_image: impl AsRef<Path>,
    size_mb: u64,
) -> MachinaResult<()> {
    let source_dir = source_dir.as_ref().to_path_buf();
    let output_image = output_image.as_ref();

    let content_mb = measure_content_mb(source_dir.clone()).await?;
    let size_mb = if size_mb == 0 {
        auto_image_size_mb(content_mb)
    } else {
        if size_mb < content_mb {
            return Err(MachinaError::Build {
                step: BuildStep::SizeCheck,
                message: format!(
                    "requested {} MB but {} holds {} MB of content",
                    size_mb,
                    source_dir.display(),
                    content_mb
                ),
            });
        }
        size_mb
    };

    tracing::info!(
        "building ext4 image {} ({} MB) from {}",
        output_image.display(),
        size_mb,
        source_dir.display()
    );

    run_step(
        BuildStep::Allocate,
        "dd",
        [
            OsStr::new("if=/dev/zero"),
            &format_os("of=", output_image),
            OsStr::new("bs=1M"),
            OsStr::new(&format!("count={}", size_mb)),
        ],
    )
    .await?;

    run_step(
        BuildStep::Format,
        "mkfs.ext4",
        [OsStr::new("-F"), output_image.as_os_str()],
    )
    .await?;

    // Fresh process-unique mount point; two builds never share one. The
    // directory itself is removed when `mount_dir` drops.
    let mount_dir = tempfile::Builder::new()
        .prefix("machina-mount-")
        .tempdir()?;
    let mount_point = mount_dir.path().to_path_buf();

    run_step(
        BuildStep::Mount,
        "mount",
        [
            OsStr::new("-o"),
            OsStr::new("loop"),
            output_image.as_os_str(),
            mount_point.as_os_str(),
        ],
    )
    .await?;

    // From here the mount must be released on every exit path, including a
    // failing copy; the guard performs a blocking best-effort unmount unless
    // the normal unmount step below defuses it first.
    let mount_guard = scopeguard::guard(mount_point.clone(), |mount_point| {
        if let Err(error) = std::process::Command::new("umount")
            .arg(&mount_point)
            .output()
        {
            tracing::warn!(
                "failed to release mount {}: {}",
                mount_point.display(),
                error
            );
        }
    });

    run_step(
        BuildStep::Copy,
        "cp",
        [
            OsStr::new("-a"),
            &format_os("", &source_dir.join(".")),
            mount_point.as_os_str(),
        ],
    )
    .await?;

    let mount_point = scopeguard::ScopeGuard::into_inner(mount_guard);
    run_step(BuildStep::Unmount, "umount", [mount_point.as_os_str()]).await?;

    drop(mount_dir);
    Ok(())
}

/// Computes the automatic image capacity for the measured content size.
pub fn auto_image_size_mb(content_mb: u64) -> u64 {
    if content_mb == 0 {
        return DEFAULT_IMAGE_SIZE_MB;
    }
    let with_headroom = content_mb + content_mb * SIZE_HEADROOM_PERCENT / 100;
    with_headroom.max(MIN_IMAGE_SIZE_MB)
}

/// Measures the content under `source_dir` in whole megabytes, rounded up.
///
/// Unreadable entries are skipped rather than failing the walk; a missing
/// source directory is an error.
async fn measure_content_mb(source_dir: PathBuf) -> MachinaResult<u64> {
    if !source_dir.is_dir() {
        return Err(MachinaError::Build {
            step: BuildStep::SizeCheck,
            message: format!("source directory does not exist: {}", source_dir.display()),
        });
    }

    let bytes = tokio::task::spawn_blocking(move || {
        walkdir::WalkDir::new(&source_dir)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|meta| meta.len())
            .sum::<u64>()
    })
    .await?;

    Ok(bytes.div_ceil(1024 * 1024))
}

/// Runs one delegated build step, capturing its output and exit code.
async fn run_step<const N: usize>(
    step: BuildStep,
    program: &str,
    args: [&OsStr; N],
) -> MachinaResult<()> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| MachinaError::Build {
            step,
            message: format!("failed to run {}: {}", program, e),
        })?;

    if !output.status.success() {
        return Err(MachinaError::Build {
            step,
            message: format!(
                "{} exited with {}: {}",
                program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }

    tracing::debug!("{} step completed: {} {:?}", step, program, args);
    Ok(())
}

/// Builds an `OsString` from a prefix and a path, for `key=value` style args.
fn format_os(prefix: &str, path: &Path) -> std::ffi::OsString {
    let mut os = std::ffi::OsString::from(prefix);
    os.push(path.as_os_str());
    os
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_auto_image_size_has_floor_headroom_and_fallback() {
        assert_eq!(auto_image_size_mb(0), DEFAULT_IMAGE_SIZE_MB);
        assert_eq!(auto_image_size_mb(10), MIN_IMAGE_SIZE_MB);
        assert_eq!(auto_image_size_mb(1000), 1200);
    }

    #[test_log::test(tokio::test)]
    async fn test_undersized_request_fails_before_allocation() -> anyhow::Result<()> {
        let src = TempDir::new()?;
        fs::write(src.path().join("blob.bin"), vec![0u8; 3 * 1024 * 1024])?;

        let out_dir = TempDir::new()?;
        let out = out_dir.path().join("rootfs.ext4");

        let result = create_ext4_image(src.path(), &out, 1).await;

        assert!(matches!(
            result,
            Err(MachinaError::Build {
                step: BuildStep::SizeCheck,
                ..
            })
        ));
        // Nothing was allocated.
        assert!(!out.exists());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_missing_source_directory_fails_size_check() -> anyhow::Result<()> {
        let out_dir = TempDir::new()?;

        let result = create_ext4_image(
            out_dir.path().join("no-such-dir"),
            out_dir.path().join("rootfs.ext4"),
            0,
        )
        .await;

        assert!(matches!(
            result,
            Err(MachinaError::Build {
                step: BuildStep::SizeCheck,
                ..
            })
        ));

        Ok(())
    }

    #[ignore = "requires root for mkfs.ext4 and loop mounts"]
    #[test_log::test(tokio::test)]
    async fn test_build_round_trip() -> anyhow::Result<()> {
        let src = TempDir::new()?;
        fs::write(src.path().join("hello.txt"), b"hello")?;

        let out_dir = TempDir::new()?;
        let out = out_dir.path().join("rootfs.ext4");

        create_ext4_image(src.path(), &out, 0).await?;

        let metadata = fs::metadata(&out)?;
        assert_eq!(metadata.len(), DEFAULT_IMAGE_SIZE_MB * 1024 * 1024);

        Ok(())
    }
}
