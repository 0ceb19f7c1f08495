//! Capability adapters backed by external programs.
//!
//! Each capability is a shell command so the daemon can drive whatever
//! camera grabber, face encoder, speech recognizer and TTS engine the
//! host provides.

use rollcall_core::{Announcer, CaptureError, Embedding, FaceEncoder, Frame, FrameSource, SpeechError, SpeechInput};
use std::io::{Cursor, Read, Write};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::Duration;

/// Extra time given to the listen command beyond the requested timeout.
const LISTEN_GRACE: Duration = Duration::from_millis(500);
/// Bytes of stderr kept in error messages.
const STDERR_TAIL: usize = 200;

fn shell(cmd: &str) -> Command {
    let mut c = Command::new("sh");
    c.arg("-c").arg(cmd);
    c
}

fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let start = text
        .char_indices()
        .rev()
        .nth(STDERR_TAIL)
        .map(|(i, _)| i)
        .unwrap_or(0);
    text[start..].to_string()
}

/// Runs a command that writes one encoded image (PNG, JPEG, ...) to stdout.
pub struct CommandCamera {
    cmd: String,
}

impl CommandCamera {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self { cmd: cmd.into() }
    }
}

impl FrameSource for CommandCamera {
    fn capture_frame(&mut self) -> Result<Frame, CaptureError> {
        let output = shell(&self.cmd)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| CaptureError::Device(format!("cannot run capture command: {e}")))?;

        if !output.status.success() {
            return Err(CaptureError::Device(format!(
                "capture command failed ({}): {}",
                output.status,
                stderr_tail(&output.stderr)
            )));
        }

        image::load_from_memory(&output.stdout)
            .map_err(|e| CaptureError::Device(format!("captured image unreadable: {e}")))
    }
}

/// Pipes the frame as PNG into a command that prints a JSON list of
/// embeddings, one per detected face.
pub struct CommandEncoder {
    cmd: String,
}

impl CommandEncoder {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self { cmd: cmd.into() }
    }
}

impl FaceEncoder for CommandEncoder {
    fn detect_and_encode(&mut self, frame: &Frame) -> Result<Option<Embedding>, CaptureError> {
        let mut png = Vec::new();
        frame
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .map_err(|e| CaptureError::Encoder(format!("PNG encode failed: {e}")))?;

        let mut child = shell(&self.cmd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CaptureError::Encoder(format!("cannot run encoder command: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CaptureError::Encoder("encoder stdin unavailable".into()))?;
        // Feed stdin from a helper thread so a chatty encoder cannot deadlock us.
        let writer = std::thread::spawn(move || stdin.write_all(&png));

        let output = child
            .wait_with_output()
            .map_err(|e| CaptureError::Encoder(format!("encoder command failed: {e}")))?;
        if let Ok(Err(e)) = writer.join() {
            tracing::debug!(error = %e, "encoder closed stdin early");
        }

        if !output.status.success() {
            return Err(CaptureError::Encoder(format!(
                "encoder command failed ({}): {}",
                output.status,
                stderr_tail(&output.stderr)
            )));
        }

        parse_embeddings(&output.stdout)
    }
}

/// First embedding of the encoder's JSON output (`[[f32, ...], ...]`).
pub fn parse_embeddings(stdout: &[u8]) -> Result<Option<Embedding>, CaptureError> {
    let faces: Vec<Vec<f32>> = serde_json::from_slice(stdout)
        .map_err(|e| CaptureError::Encoder(format!("encoder output is not a list of embeddings: {e}")))?;
    if faces.len() > 1 {
        tracing::debug!(faces = faces.len(), "multiple faces detected; using the first");
    }
    Ok(faces.into_iter().next().map(Embedding::new))
}

/// Runs a speech recognizer that prints the transcription to stdout.
pub struct CommandListener {
    cmd: String,
}

impl CommandListener {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self { cmd: cmd.into() }
    }
}

impl SpeechInput for CommandListener {
    fn listen_for_text(&mut self, timeout: Duration) -> Result<String, SpeechError> {
        let mut child = shell(&self.cmd)
            .env("ROLLCALL_LISTEN_TIMEOUT_SECS", timeout.as_secs().to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SpeechError::Backend(format!("cannot run listen command: {e}")))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpeechError::Backend("listen stdout unavailable".into()))?;
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut text = String::new();
            let _ = tx.send(stdout.read_to_string(&mut text).map(|_| text));
        });

        match rx.recv_timeout(timeout + LISTEN_GRACE) {
            Ok(Ok(text)) => {
                let status = child
                    .wait()
                    .map_err(|e| SpeechError::Backend(format!("listen command wait failed: {e}")))?;
                if status.success() {
                    Ok(text)
                } else {
                    // Recognizers exit non-zero when nothing intelligible was heard.
                    Err(SpeechError::Unintelligible)
                }
            }
            Ok(Err(e)) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(SpeechError::Backend(format!("reading transcription failed: {e}")))
            }
            Err(_) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(SpeechError::Timeout(timeout))
            }
        }
    }
}

/// Used when no listen command is configured: only typed names work.
pub struct NoSpeech;

impl SpeechInput for NoSpeech {
    fn listen_for_text(&mut self, _timeout: Duration) -> Result<String, SpeechError> {
        Err(SpeechError::Backend(
            "no listen command configured (set ROLLCALL_LISTEN_CMD or pass a name)".into(),
        ))
    }
}

/// Speaks announcements on a dedicated thread, one at a time.
pub struct CommandAnnouncer {
    tx: mpsc::Sender<String>,
}

impl CommandAnnouncer {
    pub fn spawn(cmd: String) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel::<String>();
        std::thread::Builder::new()
            .name("rollcall-speech".into())
            .spawn(move || {
                while let Ok(text) = rx.recv() {
                    speak_once(&cmd, &text);
                }
            })?;
        Ok(Self { tx })
    }
}

fn speak_once(cmd: &str, text: &str) {
    let child = shell(cmd)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn();
    let mut child = match child {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "cannot run speak command");
            return;
        }
    };
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(text.as_bytes());
    }
    match child.wait() {
        Ok(status) if !status.success() => tracing::warn!(%status, "speak command failed"),
        Err(e) => tracing::warn!(error = %e, "speak command wait failed"),
        Ok(_) => {}
    }
}

impl Announcer for CommandAnnouncer {
    fn speak(&self, text: &str) {
        tracing::info!(text, "announce");
        if self.tx.send(text.to_string()).is_err() {
            tracing::warn!("speech thread gone; announcement dropped");
        }
    }
}
