//! Job artifacts: packaging, object storage, retention and download links.

pub mod archive;
pub mod backend;
pub mod manager;
pub mod presign;

/// Object name of a job's packaged output, relative to the job prefix.
pub const ARCHIVE_NAME: &str = "artifacts.zip";

pub use archive::package_directory;
pub use backend::{ArtifactBackend, ArtifactError, ObjectEntry, ObjectStoreBackend};
pub use manager::{
    sweep_local, sweep_local_at, ArtifactFile, ArtifactManager, ArtifactManagerConfig,
    SweepReport, UploadOutcome,
};
pub use presign::{validate_relative_path, DownloadLink, PresignError, PresignResolver};
