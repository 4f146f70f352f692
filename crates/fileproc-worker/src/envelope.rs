//! Consumer side of the task envelope: turning a delivery back into a typed task.

use fileproc_core::models::{
    ImageResizePayload, TaskKind, VideoMetadataPayload, VideoTranscodePayload,
};

use crate::broker::Delivery;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    ImageResize(ImageResizePayload),
    VideoExtractMetadata(VideoMetadataPayload),
    VideoTranscode(VideoTranscodePayload),
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::ImageResize(_) => TaskKind::ImageResize,
            Task::VideoExtractMetadata(_) => TaskKind::VideoExtractMetadata,
            Task::VideoTranscode(_) => TaskKind::VideoTranscode,
        }
    }
}

/// Neither variant can succeed on a later attempt.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unknown task kind '{0}'")]
    UnknownKind(String),

    #[error("malformed {kind} payload: {source}")]
    Malformed {
        kind: TaskKind,
        #[source]
        source: serde_json::Error,
    },
}

pub fn decode(delivery: &Delivery) -> Result<Task, DecodeError> {
    let kind: TaskKind = delivery
        .kind
        .parse()
        .map_err(|_| DecodeError::UnknownKind(delivery.kind.clone()))?;
    let malformed = |source| DecodeError::Malformed { kind, source };

    let task = match kind {
        TaskKind::ImageResize => {
            Task::ImageResize(serde_json::from_slice(&delivery.payload).map_err(malformed)?)
        }
        TaskKind::VideoExtractMetadata => Task::VideoExtractMetadata(
            serde_json::from_slice(&delivery.payload).map_err(malformed)?,
        ),
        TaskKind::VideoTranscode => {
            Task::VideoTranscode(serde_json::from_slice(&delivery.payload).map_err(malformed)?)
        }
    };
    Ok(task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::AckToken;
    use std::time::Duration;
    use uuid::Uuid;

    fn delivery(kind: &str, payload: &[u8]) -> Delivery {
        Delivery {
            kind: kind.to_string(),
            payload: payload.to_vec(),
            token: AckToken {
                task_id: Uuid::new_v4(),
                claim: Uuid::new_v4(),
            },
            retry_count: 0,
            max_retry: 3,
            timeout: Duration::from_secs(60),
        }
    }

    #[test]
    fn decodes_transcode_with_default_quality() {
        let id = Uuid::new_v4();
        let body = format!(
            r#"{{"file_id":"{}","storage_path":"/srv","filename":"a.mp4","format":"webm","resolution":"640x360"}}"#,
            id
        );
        let task = decode(&delivery("video:transcode", body.as_bytes())).unwrap();
        assert_eq!(task.kind(), TaskKind::VideoTranscode);
        match task {
            Task::VideoTranscode(payload) => {
                assert_eq!(payload.file_id, id);
                assert_eq!(payload.quality, "medium");
            }
            other => panic!("unexpected task {:?}", other),
        }
    }

    #[test]
    fn unknown_kind_is_reported() {
        let err = decode(&delivery("image:crop", b"{}")).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownKind(kind) if kind == "image:crop"));
    }

    #[test]
    fn malformed_payload_is_reported() {
        let err = decode(&delivery("image:resize", b"{\"file_id\":42}")).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::Malformed {
                kind: TaskKind::ImageResize,
                ..
            }
        ));
    }
}
