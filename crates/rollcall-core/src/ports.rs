//! Capability ports for the hardware and speech services the pipeline
//! consumes. Implementations live outside this crate (the daemon wires
//! command-backed adapters; tests use fakes).

use crate::types::Embedding;
use std::time::Duration;
use thiserror::Error;

/// A captured camera image.
pub type Frame = image::DynamicImage;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("camera error: {0}")]
    Device(String),
    #[error("face encoder error: {0}")]
    Encoder(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SpeechError {
    #[error("no speech heard within {0:?}")]
    Timeout(Duration),
    #[error("speech could not be understood")]
    Unintelligible,
    #[error("speech backend error: {0}")]
    Backend(String),
}

/// Source of camera frames. Only one capture may be in flight at a time;
/// the pipeline guarantees that by holding the device lock.
pub trait FrameSource: Send {
    fn capture_frame(&mut self) -> Result<Frame, CaptureError>;
}

/// Face detection and embedding extraction.
pub trait FaceEncoder: Send {
    /// Embedding of the first detected face, or `None` if no face is found.
    fn detect_and_encode(&mut self, frame: &Frame) -> Result<Option<Embedding>, CaptureError>;
}

/// Speech-to-text for spoken names.
pub trait SpeechInput: Send {
    fn listen_for_text(&mut self, timeout: Duration) -> Result<String, SpeechError>;
}

/// Status announcements. Fire-and-forget: implementations must return
/// without waiting for playback.
pub trait Announcer: Send + Sync {
    fn speak(&self, text: &str);
}

/// Announcer that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAnnouncer;

impl Announcer for LogAnnouncer {
    fn speak(&self, text: &str) {
        tracing::info!(text, "announce");
    }
}
