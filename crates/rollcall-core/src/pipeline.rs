//! Enrollment and recognition pipelines.
//!
//! [`AttendanceSystem`] wires the roster, the ledger and the capability
//! ports together. Device access (camera, encoder, microphone) is
//! serialized by one lock that is released before the roster retrains.

use crate::classifier::ClassifierError;
use crate::ledger::{AttendanceLedger, LedgerError};
use crate::ports::{Announcer, CaptureError, FaceEncoder, FrameSource, SpeechError, SpeechInput};
use crate::roster::{MatchError, Roster, RosterStatus};
use crate::store::StoreError;
use crate::types::{clean_label, normalize_spoken_label, Embedding, Prediction, SummaryRow};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

/// Default time to wait for a spoken name.
pub const DEFAULT_LISTEN_TIMEOUT: Duration = Duration::from_secs(8);

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("could not acquire a name: {0}")]
    LabelAcquisition(#[from] SpeechError),
    #[error("no identities enrolled")]
    NoEnrolledIdentities,
    #[error("recognition model not trained, enroll at least two different people")]
    ModelNotReady,
    #[error("embedding rejected: {0}")]
    InvalidEmbedding(String),
    #[error("best match {label} below confidence threshold ({confidence:.3} < {threshold:.3})")]
    Unrecognized {
        label: String,
        confidence: f32,
        threshold: f32,
    },
    #[error("embedding store: {0}")]
    Store(#[from] StoreError),
    #[error("attendance ledger: {0}")]
    Ledger(#[from] LedgerError),
}

impl AttendanceError {
    /// Sentence spoken to the user when the operation fails.
    pub fn announcement(&self) -> &'static str {
        match self {
            Self::Capture(_) => "Camera error. Try again.",
            Self::NoFaceDetected => "No face detected. Try again.",
            Self::LabelAcquisition(_) => "Could not understand your name.",
            Self::NoEnrolledIdentities => "No registered users found.",
            Self::ModelNotReady => "Model not trained yet.",
            Self::InvalidEmbedding(_) => "Face data could not be used. Try again.",
            Self::Unrecognized { .. } => "Face not recognized.",
            Self::Store(_) | Self::Ledger(_) => "Could not save the record.",
        }
    }
}

impl From<MatchError> for AttendanceError {
    fn from(e: MatchError) -> Self {
        match e {
            MatchError::NoEnrolledIdentities => Self::NoEnrolledIdentities,
            MatchError::Classifier(ClassifierError::ModelNotReady) => Self::ModelNotReady,
            MatchError::Classifier(
                e @ (ClassifierError::DimensionMismatch { .. } | ClassifierError::MalformedEmbedding),
            ) => Self::InvalidEmbedding(e.to_string()),
        }
    }
}

/// Result of a successful enrollment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Enrollment {
    pub label: String,
    pub roster: RosterStatus,
}

/// Combined roster and ledger state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    #[serde(flatten)]
    pub roster: RosterStatus,
    pub attendance_rows: u64,
}

/// Pipeline tuning.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub listen_timeout: Duration,
    /// Reject predictions whose class probability falls below this value.
    /// `None` keeps closed-set behaviour: the best match is always accepted.
    pub min_confidence: Option<f32>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            listen_timeout: DEFAULT_LISTEN_TIMEOUT,
            min_confidence: None,
        }
    }
}

/// Exclusive hardware bundle.
pub struct Devices {
    pub camera: Box<dyn FrameSource>,
    pub encoder: Box<dyn FaceEncoder>,
    pub speech: Box<dyn SpeechInput>,
}

/// Where an enrollment label comes from.
enum LabelSource<'a> {
    Speech,
    Typed(&'a str),
}

pub struct AttendanceSystem {
    roster: Roster,
    ledger: Mutex<AttendanceLedger>,
    devices: Mutex<Devices>,
    announcer: Arc<dyn Announcer>,
    options: PipelineOptions,
}

impl AttendanceSystem {
    pub fn new(
        roster: Roster,
        ledger: AttendanceLedger,
        devices: Devices,
        announcer: Arc<dyn Announcer>,
        options: PipelineOptions,
    ) -> Self {
        Self {
            roster,
            ledger: Mutex::new(ledger),
            devices: Mutex::new(devices),
            announcer,
            options,
        }
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Capture a face and a spoken name, store them, and retrain.
    pub fn enroll(&self) -> Result<Enrollment, AttendanceError> {
        let result = self.run_enroll(LabelSource::Speech);
        self.announce_outcome(result, |e| format!("{} enrolled successfully!", e.label))
    }

    /// Like [`enroll`](Self::enroll), with the name supplied as text.
    pub fn enroll_as(&self, name: &str) -> Result<Enrollment, AttendanceError> {
        let result = self.run_enroll(LabelSource::Typed(name));
        self.announce_outcome(result, |e| format!("{} enrolled successfully!", e.label))
    }

    /// Identify the person in front of the camera and mark attendance.
    pub fn recognize(&self) -> Result<Prediction, AttendanceError> {
        let result = self.run_recognize();
        self.announce_outcome(result, |p| format!("Welcome {}. Attendance marked.", p.label))
    }

    /// Attendance counts per identity. An empty ledger is an empty vector.
    pub fn summarize(&self) -> Result<Vec<SummaryRow>, AttendanceError> {
        let result = self.ledger().summarize().map_err(AttendanceError::from);
        match &result {
            Ok(rows) if rows.is_empty() => self.announcer.speak("No attendance records found."),
            Ok(rows) => {
                let mut text = String::from("Attendance Summary:\n");
                for row in rows {
                    text.push_str(&format!("{}: {} times\n", row.label, row.count));
                }
                self.announcer.speak(&text);
            }
            Err(e) => {
                tracing::error!(error = %e, "attendance summary failed");
                self.announcer.speak(e.announcement());
            }
        }
        result
    }

    pub fn status(&self) -> Result<SystemStatus, AttendanceError> {
        Ok(SystemStatus {
            roster: self.roster.status(),
            attendance_rows: self.ledger().len()?,
        })
    }

    fn run_enroll(&self, source: LabelSource<'_>) -> Result<Enrollment, AttendanceError> {
        let (embedding, label) = {
            let mut devices = self.devices();
            self.announcer.speak("Please look at the camera for enrollment.");
            let embedding = acquire_embedding(&mut devices)?;

            let label = match source {
                LabelSource::Typed(name) => clean_label(name).ok_or(SpeechError::Unintelligible)?,
                LabelSource::Speech => {
                    self.announcer.speak("Say your name now.");
                    let heard = devices.speech.listen_for_text(self.options.listen_timeout)?;
                    tracing::debug!(heard = %heard, "speech transcribed");
                    normalize_spoken_label(&heard).ok_or(SpeechError::Unintelligible)?
                }
            };
            (embedding, label)
        };

        let roster = self.roster.enroll(embedding, &label).map_err(|e| match e {
            StoreError::DimensionMismatch { .. } | StoreError::MalformedEmbedding => {
                AttendanceError::InvalidEmbedding(e.to_string())
            }
            other => AttendanceError::Store(other),
        })?;

        tracing::info!(
            label = %label,
            embeddings = roster.embeddings,
            identities = roster.identities,
            trained = roster.trained,
            "identity enrolled"
        );
        Ok(Enrollment { label, roster })
    }

    fn run_recognize(&self) -> Result<Prediction, AttendanceError> {
        let embedding = {
            let mut devices = self.devices();
            self.announcer.speak("Recognizing face. Please look at the camera.");
            acquire_embedding(&mut devices)?
        };

        let prediction = self.roster.predict(&embedding)?;

        if let Some(threshold) = self.options.min_confidence {
            if prediction.confidence < threshold {
                return Err(AttendanceError::Unrecognized {
                    label: prediction.label,
                    confidence: prediction.confidence,
                    threshold,
                });
            }
        }

        let event = self.ledger().record_now(&prediction.label)?;
        tracing::info!(
            label = %prediction.label,
            confidence = prediction.confidence,
            timestamp = %event.timestamp,
            "attendance marked"
        );
        Ok(prediction)
    }

    fn announce_outcome<T>(
        &self,
        result: Result<T, AttendanceError>,
        success: impl FnOnce(&T) -> String,
    ) -> Result<T, AttendanceError> {
        match &result {
            Ok(value) => self.announcer.speak(&success(value)),
            Err(e) => {
                tracing::warn!(error = %e, "operation rejected");
                self.announcer.speak(e.announcement());
            }
        }
        result
    }

    fn devices(&self) -> MutexGuard<'_, Devices> {
        self.devices
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ledger(&self) -> MutexGuard<'_, AttendanceLedger> {
        self.ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Capture one frame and encode the first face in it.
fn acquire_embedding(devices: &mut Devices) -> Result<Embedding, AttendanceError> {
    let frame = devices.camera.capture_frame()?;
    tracing::debug!(width = frame.width(), height = frame.height(), "frame captured");
    devices
        .encoder
        .detect_and_encode(&frame)?
        .ok_or(AttendanceError::NoFaceDetected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::Frame;
    use std::collections::VecDeque;
    use tempfile::TempDir;

    /// Queued outcomes shared between the test and the fake devices.
    #[derive(Default)]
    struct Script {
        frames: VecDeque<Result<(), CaptureError>>,
        faces: VecDeque<Option<Vec<f32>>>,
        names: VecDeque<Result<String, SpeechError>>,
    }

    type Shared = Arc<Mutex<Script>>;

    struct FakeCamera(Shared);
    struct FakeEncoder(Shared);
    struct FakeSpeech(Shared);

    impl FrameSource for FakeCamera {
        fn capture_frame(&mut self) -> Result<Frame, CaptureError> {
            let next = self.0.lock().unwrap().frames.pop_front().unwrap_or(Ok(()));
            next.map(|()| Frame::new_luma8(8, 8))
        }
    }

    impl FaceEncoder for FakeEncoder {
        fn detect_and_encode(&mut self, _frame: &Frame) -> Result<Option<Embedding>, CaptureError> {
            let face = self.0.lock().unwrap().faces.pop_front().expect("unscripted capture");
            Ok(face.map(Embedding::new))
        }
    }

    impl SpeechInput for FakeSpeech {
        fn listen_for_text(&mut self, _timeout: Duration) -> Result<String, SpeechError> {
            self.0.lock().unwrap().names.pop_front().expect("unscripted listen")
        }
    }

    #[derive(Default)]
    struct RecordingAnnouncer(Mutex<Vec<String>>);

    impl Announcer for RecordingAnnouncer {
        fn speak(&self, text: &str) {
            self.0.lock().unwrap().push(text.to_string());
        }
    }

    impl RecordingAnnouncer {
        fn last(&self) -> String {
            self.0.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    struct Harness {
        _tmp: TempDir,
        script: Shared,
        announcer: Arc<RecordingAnnouncer>,
        system: AttendanceSystem,
    }

    fn harness(options: PipelineOptions) -> Harness {
        let tmp = TempDir::new().unwrap();
        let script: Shared = Arc::default();
        let announcer = Arc::new(RecordingAnnouncer::default());
        let system = AttendanceSystem::new(
            Roster::open(tmp.path().join("faces.json")).unwrap(),
            AttendanceLedger::open_in_memory().unwrap(),
            Devices {
                camera: Box::new(FakeCamera(script.clone())),
                encoder: Box::new(FakeEncoder(script.clone())),
                speech: Box::new(FakeSpeech(script.clone())),
            },
            announcer.clone(),
            options,
        );
        Harness { _tmp: tmp, script, announcer, system }
    }

    impl Harness {
        fn face(&self, values: &[f32]) {
            self.script.lock().unwrap().faces.push_back(Some(values.to_vec()));
        }
        fn no_face(&self) {
            self.script.lock().unwrap().faces.push_back(None);
        }
        fn camera_fails(&self) {
            self.script
                .lock()
                .unwrap()
                .frames
                .push_back(Err(CaptureError::Device("unplugged".into())));
        }
        fn says(&self, name: Result<&str, SpeechError>) {
            self.script.lock().unwrap().names.push_back(name.map(str::to_string));
        }
        fn rows(&self) -> u64 {
            self.system.status().unwrap().attendance_rows
        }
    }

    const ALICE: [f32; 4] = [0.9, 0.1, 0.2, 0.4];
    const BOB: [f32; 4] = [0.1, 0.8, 0.3, 0.4];

    #[test]
    fn test_alice_bob_end_to_end() {
        let h = harness(PipelineOptions::default());

        h.face(&ALICE);
        h.says(Ok("alice"));
        let e = h.system.enroll().unwrap();
        assert_eq!(e.label, "Alice");
        assert_eq!(e.roster.embeddings, 1);
        assert!(!e.roster.trained);
        assert_eq!(h.announcer.last(), "Alice enrolled successfully!");

        h.face(&BOB);
        h.says(Ok("Bob"));
        let e = h.system.enroll().unwrap();
        assert_eq!(e.roster.embeddings, 2);
        assert!(e.roster.trained);

        h.face(&ALICE);
        assert_eq!(h.system.recognize().unwrap().label, "Alice");
        assert_eq!(h.rows(), 1);
        assert_eq!(h.announcer.last(), "Welcome Alice. Attendance marked.");

        h.face(&ALICE);
        assert_eq!(h.system.recognize().unwrap().label, "Alice");
        assert_eq!(h.rows(), 2);

        let summary = h.system.summarize().unwrap();
        assert_eq!(summary, vec![SummaryRow { label: "Alice".into(), count: 2 }]);
        assert_eq!(h.announcer.last(), "Attendance Summary:\nAlice: 2 times\n");

        let events = h.system.ledger().events().unwrap();
        assert!(events.iter().all(|ev| ev.label == "Alice"));
        assert!(events[0].timestamp <= events[1].timestamp);
    }

    #[test]
    fn test_label_failure_leaves_store_untouched() {
        let h = harness(PipelineOptions::default());
        h.face(&ALICE);
        h.says(Err(SpeechError::Timeout(Duration::from_secs(8))));
        let err = h.system.enroll().unwrap_err();
        assert!(matches!(err, AttendanceError::LabelAcquisition(SpeechError::Timeout(_))));
        assert_eq!(h.system.roster().len(), 0);
        assert_eq!(h.announcer.last(), "Could not understand your name.");

        h.face(&ALICE);
        h.says(Ok("   "));
        assert!(matches!(
            h.system.enroll(),
            Err(AttendanceError::LabelAcquisition(SpeechError::Unintelligible))
        ));
        assert_eq!(h.system.roster().len(), 0);
    }

    #[test]
    fn test_no_face_and_camera_error_do_not_mutate() {
        let h = harness(PipelineOptions::default());
        h.no_face();
        assert!(matches!(h.system.enroll(), Err(AttendanceError::NoFaceDetected)));
        assert_eq!(h.announcer.last(), "No face detected. Try again.");

        h.camera_fails();
        assert!(matches!(h.system.enroll_as("Alice"), Err(AttendanceError::Capture(_))));
        assert_eq!(h.announcer.last(), "Camera error. Try again.");
        assert_eq!(h.system.roster().len(), 0);

        // Speech is never consulted when capture fails.
        assert!(h.script.lock().unwrap().names.is_empty());
    }

    #[test]
    fn test_recognize_empty_store_fails_without_ledger_write() {
        let h = harness(PipelineOptions::default());
        h.face(&ALICE);
        assert!(matches!(h.system.recognize(), Err(AttendanceError::NoEnrolledIdentities)));
        assert_eq!(h.rows(), 0);
        assert_eq!(h.announcer.last(), "No registered users found.");
    }

    #[test]
    fn test_recognize_single_identity_not_ready() {
        let h = harness(PipelineOptions::default());
        h.face(&ALICE);
        h.system.enroll_as("Alice").unwrap();
        h.face(&[0.85, 0.15, 0.2, 0.4]);
        h.system.enroll_as("Alice").unwrap();

        h.face(&ALICE);
        assert!(matches!(h.system.recognize(), Err(AttendanceError::ModelNotReady)));
        assert_eq!(h.rows(), 0);
        assert_eq!(h.announcer.last(), "Model not trained yet.");
    }

    #[test]
    fn test_recognition_returns_enrolled_label_and_records_it() {
        let h = harness(PipelineOptions::default());
        h.face(&ALICE);
        h.system.enroll_as("Alice").unwrap();
        h.face(&BOB);
        h.system.enroll_as("Bob").unwrap();

        for (i, probe) in [[0.2, 0.7, 0.3, 0.4], [3.0, -1.0, 0.0, 9.0], BOB].iter().enumerate() {
            h.face(probe);
            let p = h.system.recognize().unwrap();
            assert!(p.label == "Alice" || p.label == "Bob");
            let events = h.system.ledger().events().unwrap();
            assert_eq!(events.len(), i + 1);
            assert_eq!(events[i].label, p.label);
        }
    }

    #[test]
    fn test_confidence_threshold_rejects_without_write() {
        let h = harness(PipelineOptions {
            min_confidence: Some(0.999_999),
            ..PipelineOptions::default()
        });
        h.face(&ALICE);
        h.system.enroll_as("Alice").unwrap();
        h.face(&BOB);
        h.system.enroll_as("Bob").unwrap();

        // Halfway between the two enrolled faces.
        h.face(&[0.5, 0.45, 0.25, 0.4]);
        match h.system.recognize() {
            Err(AttendanceError::Unrecognized { confidence, threshold, .. }) => {
                assert!(confidence < threshold);
            }
            other => panic!("expected Unrecognized, got {other:?}"),
        }
        assert_eq!(h.rows(), 0);
    }

    #[test]
    fn test_dimension_change_is_rejected() {
        let h = harness(PipelineOptions::default());
        h.face(&ALICE);
        h.system.enroll_as("Alice").unwrap();
        h.face(&[0.1, 0.2]);
        assert!(matches!(h.system.enroll_as("Bob"), Err(AttendanceError::InvalidEmbedding(_))));
        assert_eq!(h.system.roster().len(), 1);
    }

    #[test]
    fn test_non_finite_face_not_recorded() {
        let h = harness(PipelineOptions::default());
        h.face(&ALICE);
        h.system.enroll_as("Alice").unwrap();
        h.face(&BOB);
        h.system.enroll_as("Bob").unwrap();

        h.face(&[f32::NAN; 4]);
        assert!(matches!(h.system.recognize(), Err(AttendanceError::InvalidEmbedding(_))));
        assert_eq!(h.announcer.last(), "Face data could not be used. Try again.");
        h.face(&[f32::INFINITY, 0.0, 0.0, 0.0]);
        assert!(matches!(h.system.recognize(), Err(AttendanceError::InvalidEmbedding(_))));
        assert_eq!(h.rows(), 0);
    }

    #[test]
    fn test_typed_label_is_trimmed_not_recased() {
        let h = harness(PipelineOptions::default());
        h.face(&ALICE);
        assert_eq!(h.system.enroll_as("  McKay ").unwrap().label, "McKay");
    }

    #[test]
    fn test_empty_summary_announced() {
        let h = harness(PipelineOptions::default());
        assert!(h.system.summarize().unwrap().is_empty());
        assert_eq!(h.announcer.last(), "No attendance records found.");
    }
}
