use std::fmt;
use std::path::PathBuf;

use crate::studio::slot::SlotId;

/// Classified reason a single theme failed to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenerationErrorKind {
    CredentialMissing,
    QuotaExhausted,
    PermissionDenied,
    ContentSafetyBlocked,
    EmptyResponse,
    TimedOut,
    TransportError,
}

impl GenerationErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            GenerationErrorKind::CredentialMissing => "credential_missing",
            GenerationErrorKind::QuotaExhausted => "quota_exhausted",
            GenerationErrorKind::PermissionDenied => "permission_denied",
            GenerationErrorKind::ContentSafetyBlocked => "content_safety_blocked",
            GenerationErrorKind::EmptyResponse => "empty_response",
            GenerationErrorKind::TimedOut => "timed_out",
            GenerationErrorKind::TransportError => "transport_error",
        }
    }

    /// What the user can do about it.
    pub fn guidance(self) -> &'static str {
        match self {
            GenerationErrorKind::CredentialMissing => {
                "No API key is configured for this mode. Set GEMINI_API_KEY, or select a personal key for high-quality mode."
            }
            GenerationErrorKind::QuotaExhausted => {
                "The shared quota is used up. Select a personal API key and re-run in high-quality mode."
            }
            GenerationErrorKind::PermissionDenied => {
                "The API key was rejected or lacks access to this model. Check the key and its project."
            }
            GenerationErrorKind::ContentSafetyBlocked => {
                "The provider refused this rendering. Try a different photo."
            }
            GenerationErrorKind::EmptyResponse => {
                "The model answered without an image. Retrying this theme usually helps."
            }
            GenerationErrorKind::TimedOut => {
                "The request took too long. Retry this theme or raise STUDIO_REQUEST_TIMEOUT_SECONDS."
            }
            GenerationErrorKind::TransportError => {
                "The request did not go through. Check the network and retry."
            }
        }
    }

    /// Failures that a credential/mode upgrade can plausibly fix.
    pub fn suggests_upgrade(self) -> bool {
        matches!(
            self,
            GenerationErrorKind::QuotaExhausted | GenerationErrorKind::CredentialMissing
        )
    }
}

impl fmt::Display for GenerationErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {detail}")]
pub struct GenerationError {
    pub kind: GenerationErrorKind,
    pub detail: String,
}

impl GenerationError {
    pub fn new(kind: GenerationErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Misuse of the orchestrator or local I/O trouble; never produced by a remote call.
#[derive(Debug, thiserror::Error)]
pub enum StudioError {
    #[error("source image is empty")]
    EmptyImage,
    #[error("unsupported image type: {0}")]
    UnsupportedMimeType(String),
    #[error("source image could not be decoded: {0}")]
    UndecodableImage(String),
    #[error("no source image has been uploaded yet")]
    NoSourceImage,
    #[error("no slot with id {0} in the current batch")]
    UnknownSlot(SlotId),
    #[error("slot {0} is still pending")]
    SlotPending(SlotId),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
