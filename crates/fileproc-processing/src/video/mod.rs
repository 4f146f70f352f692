pub mod metadata;
pub mod transcode;

pub use metadata::{
    parse_probe_output, write_metadata_file, MetadataError, VideoMetadata,
    VideoMetadataExtractor,
};
pub use transcode::{TranscodeError, TranscodeRequest, VideoTranscoder};
