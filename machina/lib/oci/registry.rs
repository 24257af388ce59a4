use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream::BoxStream, StreamExt};
use oci_spec::image::{Digest, ImageConfiguration, ImageIndex, ImageManifest};
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    fs::{self, OpenOptions},
    io::AsyncWriteExt,
};

use crate::{utils, MachinaError, MachinaResult};

use super::{Reference, DEFAULT_REGISTRY};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Base URL for the Docker Hub registry API; `docker.io` is an alias that does
/// not serve the distribution protocol itself.
const DOCKER_REGISTRY_URL: &str = "https://registry-1.docker.io";

/// The service name used during Docker Hub token authentication.
const DOCKER_AUTH_SERVICE: &str = "registry.docker.io";

/// Endpoint for acquiring Docker Hub pull tokens.
const DOCKER_AUTH_REALM: &str = "https://auth.docker.io/token";

/// Accept header offered when fetching an image index.
const MANIFEST_INDEX_MIME_TYPES: &str = "application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.index.v1+json";

/// Accept header offered when fetching a single manifest.
const MANIFEST_MIME_TYPES: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.oci.image.manifest.v1+json";

/// Accept header offered when fetching image layer blobs.
const IMAGE_BLOB_MIME_TYPE: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Accept header offered when fetching image configuration blobs.
const CONFIG_MIME_TYPE: &str = "application/vnd.docker.container.image.v1+json";

/// Number of transient-failure retries applied to every registry request.
const MAX_REGISTRY_RETRIES: u32 = 3;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A client for the subset of the Docker Registry HTTP API v2 that machina
/// needs: resolve a reference, list its layers, and stream blobs.
///
/// [See the OCI distribution specification for the manifest schema][OCI Distribution Spec]
///
/// [OCI Distribution Spec]: https://distribution.github.io/distribution/spec/api/#introduction
#[derive(Debug)]
pub struct RegistryClient {
    /// The HTTP client used to make requests to the registry.
    client: ClientWithMiddleware,

    /// Base URL of the registry's v2 endpoint.
    base_url: String,

    /// Whether pull tokens must be fetched from the Docker Hub auth service.
    docker_auth: bool,
}

/// A pull token issued by the registry's token service.
#[derive(Debug, Serialize, Deserialize)]
pub struct RegistryToken {
    /// The bearer token used to authenticate pull requests.
    token: String,
}

/// Represents a response from the registry, either successful (`Ok`) or an error (`Error`).
#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegistryResponse<T> {
    /// A successful response body.
    Ok(T),

    /// An error response body.
    Error(RegistryResponseError),
}

/// An error response returned by the registry, including detailed error messages.
#[derive(Debug, Serialize, Deserialize, Error)]
#[error("registry response error: {errors}")]
pub struct RegistryResponseError {
    /// The errors returned by the registry.
    errors: serde_json::Value,
}

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// The registry operations the provisioning pipeline needs: resolve a
/// reference to its manifest and fetch its layer blobs. Implemented by
/// [`RegistryClient`]; the seam exists so layer iteration can be driven
/// against a stub in tests.
#[async_trait]
pub trait RegistryPull {
    /// Fetches the image index (manifest list) for multi-platform images.
    async fn fetch_index(&self, repository: &str, tag: &str) -> MachinaResult<ImageIndex>;

    /// Fetches an image manifest by digest.
    async fn fetch_manifest(&self, repository: &str, digest: &Digest)
        -> MachinaResult<ImageManifest>;

    /// Fetches the image configuration by digest.
    async fn fetch_config(
        &self,
        repository: &str,
        digest: &Digest,
    ) -> MachinaResult<ImageConfiguration>;

    /// Downloads a blob to `destination`, verifying its digest.
    async fn download_blob(
        &self,
        repository: &str,
        digest: &Digest,
        download_size: u64,
        destination: PathBuf,
    ) -> MachinaResult<()>;
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RegistryClient {
    /// Creates a client for the registry a reference points at, with transient
    /// failures retried with exponential backoff.
    ///
    /// Docker Hub gets its token-auth flow; other registries are addressed
    /// directly and queried with ambient (anonymous) credentials.
    pub fn for_reference(reference: &Reference) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(MAX_REGISTRY_RETRIES);
        let client = ClientBuilder::new(Client::new())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        let (base_url, docker_auth) = if reference.registry() == DEFAULT_REGISTRY {
            (DOCKER_REGISTRY_URL.to_string(), true)
        } else {
            (format!("https://{}", reference.registry()), false)
        };

        Self {
            client,
            base_url,
            docker_auth,
        }
    }

    /// Gets a pull token for the given repository, if the registry requires one.
    async fn get_pull_token(&self, repository: &str) -> MachinaResult<Option<String>> {
        if !self.docker_auth {
            return Ok(None);
        }

        let request = self
            .client
            .get(DOCKER_AUTH_REALM)
            .query(&[
                ("service", DOCKER_AUTH_SERVICE),
                ("scope", format!("repository:{}:pull", repository).as_str()),
            ])
            .build()?;

        let response = self.client.execute(request).await?;
        let token = response.json::<RegistryToken>().await?;

        Ok(Some(token.token))
    }

    /// Gets the size of a previously downloaded file, or 0 if it does not exist.
    fn get_downloaded_file_size(&self, path: &Path) -> u64 {
        path.metadata().map(|meta| meta.len()).unwrap_or(0)
    }

    /// Fetches a blob from the registry as a byte stream starting at `offset`.
    async fn fetch_blob_stream(
        &self,
        repository: &str,
        digest: &Digest,
        offset: u64,
    ) -> MachinaResult<BoxStream<'static, MachinaResult<Bytes>>> {
        tracing::info!("fetching blob: {repository} {digest} from offset {offset}");

        let mut request = self
            .client
            .get(format!(
                "{}/v2/{}/blobs/{}",
                self.base_url, repository, digest
            ))
            .header("Accept", IMAGE_BLOB_MIME_TYPE)
            .header("Range", format!("bytes={}-", offset));

        if let Some(token) = self.get_pull_token(repository).await? {
            request = request.bearer_auth(token);
        }

        let response = self.client.execute(request.build()?).await?;
        let stream = response
            .bytes_stream()
            .map(|item| item.map_err(|e| e.into()));

        Ok(stream.boxed())
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl RegistryPull for RegistryClient {
    async fn fetch_index(&self, repository: &str, tag: &str) -> MachinaResult<ImageIndex> {
        let mut request = self
            .client
            .get(format!(
                "{}/v2/{}/manifests/{}",
                self.base_url, repository, tag
            ))
            .header("Accept", MANIFEST_INDEX_MIME_TYPES);

        if let Some(token) = self.get_pull_token(repository).await? {
            request = request.bearer_auth(token);
        }

        let response = self.client.execute(request.build()?).await?;
        let index = response.json::<RegistryResponse<ImageIndex>>().await?;

        match index {
            RegistryResponse::Ok(index) => Ok(index),
            RegistryResponse::Error(err) => Err(err.into()),
        }
    }

    async fn fetch_manifest(
        &self,
        repository: &str,
        digest: &Digest,
    ) -> MachinaResult<ImageManifest> {
        let mut request = self
            .client
            .get(format!(
                "{}/v2/{}/manifests/{}",
                self.base_url, repository, digest
            ))
            .header("Accept", MANIFEST_MIME_TYPES);

        if let Some(token) = self.get_pull_token(repository).await? {
            request = request.bearer_auth(token);
        }

        let response = self.client.execute(request.build()?).await?;
        let manifest = response.json::<RegistryResponse<ImageManifest>>().await?;

        match manifest {
            RegistryResponse::Ok(manifest) => Ok(manifest),
            RegistryResponse::Error(err) => Err(err.into()),
        }
    }

    async fn fetch_config(
        &self,
        repository: &str,
        digest: &Digest,
    ) -> MachinaResult<ImageConfiguration> {
        let mut request = self
            .client
            .get(format!(
                "{}/v2/{}/blobs/{}",
                self.base_url, repository, digest
            ))
            .header("Accept", CONFIG_MIME_TYPE);

        if let Some(token) = self.get_pull_token(repository).await? {
            request = request.bearer_auth(token);
        }

        let response = self.client.execute(request.build()?).await?;
        let config = response
            .json::<RegistryResponse<ImageConfiguration>>()
            .await?;

        match config {
            RegistryResponse::Ok(config) => Ok(config),
            RegistryResponse::Error(err) => Err(err.into()),
        }
    }

    async fn download_blob(
        &self,
        repository: &str,
        digest: &Digest,
        download_size: u64,
        destination: PathBuf,
    ) -> MachinaResult<()> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Resume a partial download if one is present.
        let downloaded_size = self.get_downloaded_file_size(&destination);

        let mut file = if downloaded_size == 0 {
            OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&destination)
                .await?
        } else if downloaded_size < download_size {
            OpenOptions::new().append(true).open(&destination).await?
        } else {
            tracing::info!(
                "blob already downloaded, skipping: {}",
                destination.display()
            );
            return Ok(());
        };

        let mut stream = self
            .fetch_blob_stream(repository, digest, downloaded_size)
            .await?;

        while let Some(chunk) = stream.next().await {
            let bytes = chunk?;
            file.write_all(&bytes).await?;
        }
        file.flush().await?;

        let algorithm = digest.algorithm();
        let expected_hash = digest.digest();
        let actual_hash = hex::encode(utils::get_file_hash(&destination, algorithm).await?);

        // A mismatched file cannot be resumed; drop it so the next attempt
        // starts clean.
        if actual_hash != expected_hash {
            fs::remove_file(destination).await?;
            return Err(MachinaError::LayerDownloadFailed(format!(
                "({repository}:{digest}) file hash {actual_hash} does not match expected hash {expected_hash}",
            )));
        }

        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn docker_client() -> RegistryClient {
        RegistryClient::for_reference(&"alpine:latest".parse().unwrap())
    }

    #[test]
    fn test_registry_client_base_url_selection() -> anyhow::Result<()> {
        let hub = RegistryClient::for_reference(&"alpine".parse()?);
        assert_eq!(hub.base_url, DOCKER_REGISTRY_URL);
        assert!(hub.docker_auth);

        let ghcr = RegistryClient::for_reference(&"ghcr.io/acme/widget".parse()?);
        assert_eq!(ghcr.base_url, "https://ghcr.io");
        assert!(!ghcr.docker_auth);

        Ok(())
    }

    #[ignore = "requires network access to Docker Hub"]
    #[test_log::test(tokio::test)]
    async fn test_fetch_index() -> anyhow::Result<()> {
        let registry = docker_client();

        let index = registry.fetch_index("library/alpine", "latest").await?;

        tracing::info!("index: {:?}", index);

        assert!(!index.manifests().is_empty());

        Ok(())
    }

    #[ignore = "requires network access to Docker Hub"]
    #[test_log::test(tokio::test)]
    async fn test_fetch_manifest_and_config() -> anyhow::Result<()> {
        let registry = docker_client();

        let index = registry.fetch_index("library/alpine", "latest").await?;
        let manifest = registry
            .fetch_manifest("library/alpine", index.manifests()[0].digest())
            .await?;

        tracing::info!("manifest: {:?}", manifest);

        assert!(!manifest.layers().is_empty());

        let config = registry
            .fetch_config("library/alpine", manifest.config().digest())
            .await?;

        assert!(config.config().is_some());

        Ok(())
    }
}
