//! rollcall-core: face-based attendance engine.
//!
//! Keeps a durable store of labeled face embeddings, retrains a linear
//! identity classifier whenever the store changes, and records each
//! recognition in an append-only SQLite ledger.

pub mod classifier;
pub mod ledger;
pub mod pipeline;
pub mod ports;
pub mod roster;
pub mod store;
pub mod types;

pub use classifier::{ClassifierError, ClassifierState};
pub use ledger::{AttendanceLedger, LedgerError};
pub use pipeline::{AttendanceError, AttendanceSystem, Devices, Enrollment, PipelineOptions, SystemStatus};
pub use ports::{Announcer, CaptureError, FaceEncoder, Frame, FrameSource, LogAnnouncer, SpeechError, SpeechInput};
pub use roster::{MatchError, Roster, RosterStatus};
pub use store::{EmbeddingStore, StoreError};
pub use types::{AttendanceEvent, Embedding, Prediction, SummaryRow};
