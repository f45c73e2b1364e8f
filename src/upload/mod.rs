pub mod blob;
pub mod pipeline;
pub mod record;

pub use blob::{read_artifact, BlobStore, LocalBlobStore};
pub use pipeline::{CommitError, CommitPipeline, CommitReceipt, CommitSettings};
pub use record::{artifact_path, MetadataLayout, ReactionTestRecord, StructuredStore};
