use std::{
    error::Error,
    fmt::{self, Display},
};

use thiserror::Error;

use crate::oci::RegistryResponseError;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a machina-related operation.
pub type MachinaResult<T> = Result<T, MachinaError>;

/// An error that occurred while provisioning or operating a machine.
#[derive(pretty_error_debug::Debug, Error)]
pub enum MachinaError {
    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON serialization or deserialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// An error that occurred during an HTTP request.
    #[error("http request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    /// An error that occurred during an HTTP middleware operation.
    #[error("http middleware error: {0}")]
    HttpMiddleware(#[from] reqwest_middleware::Error),

    /// An error response returned by the container registry.
    #[error("registry error: {0}")]
    RegistryResponse(#[from] RegistryResponseError),

    /// An error that occurred when no usable manifest was found for an image.
    #[error("manifest not found")]
    ManifestNotFound,

    /// An error that occurred when an unsupported image hash algorithm was used.
    #[error("unsupported image hash algorithm: {0}")]
    UnsupportedImageHashAlgorithm(String),

    /// An error that occurred when an image layer download failed.
    #[error("image layer download failed: {0}")]
    LayerDownloadFailed(String),

    /// An error that occurred when an image reference could not be parsed.
    #[error("invalid image reference: {0}")]
    ImageReference(String),

    /// An error that occurred when a machine spec failed validation.
    #[error("invalid machine spec: {0}")]
    InvalidMachineSpec(String),

    /// An error that occurred while applying an image layer to a directory.
    #[error("failed to extract layer {layer}: {source}")]
    Extraction {
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,

        /// The layer digest or file being applied.
        layer: String,
    },

    /// An error that occurred while assembling a filesystem image, tagged by
    /// the failing sub-operation.
    #[error("filesystem image build failed at {step}: {message}")]
    Build {
        /// The build step that failed.
        step: BuildStep,

        /// Captured detail from the failing operation.
        message: String,
    },

    /// An error that occurred while rendering or encoding the hypervisor configuration.
    #[error("hypervisor config error: {0}")]
    Config(String),

    /// An error that occurred while spawning the hypervisor process.
    #[error("failed to spawn hypervisor: {0}")]
    Spawn(String),

    /// An error that occurred when the guest control endpoint could not be reached.
    #[error("guest connect error: {0}")]
    Connect(String),

    /// An error that occurred when the guest control protocol was violated.
    #[error("guest protocol error: {0}")]
    Protocol(String),

    /// An error that occurred when a machine was not yet ready for guest operations.
    #[error("machine {id} is not ready: {state}")]
    NotReady {
        /// The machine identifier.
        id: String,

        /// The machine's current state.
        state: String,
    },

    /// An error that occurred when a machine was not found.
    #[error("machine not found: {0}")]
    NotFound(String),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),
}

/// The sub-operations of a filesystem image build, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStep {
    /// Verifying the requested capacity against the source content size.
    SizeCheck,

    /// Allocating the zero-filled image file.
    Allocate,

    /// Formatting the image with a journaling filesystem.
    Format,

    /// Mounting the image at a fresh mount point.
    Mount,

    /// Copying the source tree into the mount.
    Copy,

    /// Releasing the mount.
    Unmount,
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MachinaError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> MachinaError {
        MachinaError::Custom(AnyError {
            error: error.into(),
        })
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `MachinaResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> MachinaResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            BuildStep::SizeCheck => "size-check",
            BuildStep::Allocate => "allocate",
            BuildStep::Format => "format",
            BuildStep::Mount => "mount",
            BuildStep::Copy => "copy",
            BuildStep::Unmount => "unmount",
        };
        write!(f, "{}", step)
    }
}

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}
