//! fileproc media processing library
//!
//! Engines that turn a stored upload into a processed output: image resizing
//! in-process, video probing and transcoding through external tools.

pub mod command;

#[cfg(feature = "image")]
pub mod image;

#[cfg(feature = "video")]
pub mod video;

pub use crate::command::{CommandError, CommandOutput, CommandRunner, ProcessRunner};

#[cfg(feature = "image")]
pub use crate::image::{ImageResizer, ResizeError};

#[cfg(feature = "video")]
pub use crate::video::{
    parse_probe_output, write_metadata_file, MetadataError, TranscodeError, TranscodeRequest,
    VideoMetadata, VideoMetadataExtractor, VideoTranscoder,
};
