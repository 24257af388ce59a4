use std::path::Path;

use oci_spec::image::DigestAlgorithm;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tokio::{fs::File, io::AsyncReadExt};

use crate::{MachinaError, MachinaResult};

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Copies a single file from `src` to `dst`, overwriting any existing file.
pub async fn copy_file(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> MachinaResult<u64> {
    let copied = tokio::fs::copy(src.as_ref(), dst.as_ref()).await?;
    Ok(copied)
}

/// Gets the hash of a file.
pub async fn get_file_hash(path: &Path, algorithm: &DigestAlgorithm) -> MachinaResult<Vec<u8>> {
    let mut file = File::open(path).await?;
    let mut buffer = Vec::new();
    file.read_to_end(&mut buffer).await?;

    let hash = match algorithm {
        DigestAlgorithm::Sha256 => Sha256::digest(&buffer).to_vec(),
        DigestAlgorithm::Sha384 => Sha384::digest(&buffer).to_vec(),
        DigestAlgorithm::Sha512 => Sha512::digest(&buffer).to_vec(),
        _ => {
            return Err(MachinaError::UnsupportedImageHashAlgorithm(format!(
                "Unsupported algorithm: {}",
                algorithm
            )));
        }
    };

    Ok(hash)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_copy_file_overwrites_destination() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");

        tokio::fs::write(&src, b"payload").await?;
        tokio::fs::write(&dst, b"stale").await?;

        let copied = copy_file(&src, &dst).await?;

        assert_eq!(copied, 7);
        assert_eq!(tokio::fs::read(&dst).await?, b"payload");

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_get_file_hash_sha256() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("data");
        tokio::fs::write(&path, b"hello").await?;

        let hash = get_file_hash(&path, &DigestAlgorithm::Sha256).await?;

        assert_eq!(
            hex::encode(hash),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );

        Ok(())
    }
}
