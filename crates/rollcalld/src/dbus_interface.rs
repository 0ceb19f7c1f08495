use crate::engine::{EngineError, EngineHandle};
use rollcall_core::AttendanceError;
use zbus::interface;

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus errors, one name per failure kind.
#[derive(Debug, zbus::DBusError)]
#[zbus(prefix = "org.rollcall.Attendance1.Error")]
pub enum ServiceError {
    #[zbus(error)]
    ZBus(zbus::Error),
    CaptureFailed(String),
    NoFaceDetected(String),
    LabelAcquisitionFailed(String),
    NoEnrolledIdentities(String),
    ModelNotReady(String),
    Unrecognized(String),
    InvalidEmbedding(String),
    StorageFailed(String),
    EngineUnavailable(String),
}

impl From<EngineError> for ServiceError {
    fn from(e: EngineError) -> Self {
        let msg = e.to_string();
        match e {
            EngineError::Attendance(a) => match a {
                AttendanceError::Capture(_) => Self::CaptureFailed(msg),
                AttendanceError::NoFaceDetected => Self::NoFaceDetected(msg),
                AttendanceError::LabelAcquisition(_) => Self::LabelAcquisitionFailed(msg),
                AttendanceError::NoEnrolledIdentities => Self::NoEnrolledIdentities(msg),
                AttendanceError::ModelNotReady => Self::ModelNotReady(msg),
                AttendanceError::Unrecognized { .. } => Self::Unrecognized(msg),
                AttendanceError::InvalidEmbedding(_) => Self::InvalidEmbedding(msg),
                AttendanceError::Store(_) | AttendanceError::Ledger(_) => Self::StorageFailed(msg),
            },
            EngineError::Spawn(_) | EngineError::ChannelClosed => Self::EngineUnavailable(msg),
        }
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, ServiceError> {
    serde_json::to_string(value).map_err(|e| ServiceError::StorageFailed(format!("encode reply: {e}")))
}

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    pub engine: EngineHandle,
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Enroll the face in front of the camera. An empty `name` asks for a
    /// spoken name. Returns the stored label.
    async fn enroll(&self, name: &str) -> Result<String, ServiceError> {
        tracing::info!(name, "enroll requested");
        let name = (!name.trim().is_empty()).then(|| name.to_string());
        let enrollment = self.engine.enroll(name).await?;
        Ok(enrollment.label)
    }

    /// Identify the face in front of the camera and mark attendance.
    /// Returns `{"label": .., "confidence": ..}`.
    async fn recognize(&self) -> Result<String, ServiceError> {
        tracing::info!("recognize requested");
        let prediction = self.engine.recognize().await?;
        to_json(&prediction)
    }

    /// Attendance counts per identity: `[{"label": .., "count": ..}, ..]`.
    async fn summary(&self) -> Result<String, ServiceError> {
        tracing::info!("summary requested");
        let rows = self.engine.summary().await?;
        to_json(&rows)
    }

    /// Return daemon status information.
    async fn status(&self) -> Result<String, ServiceError> {
        let status = self.engine.status().await?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "embeddings": status.roster.embeddings,
            "identities": status.roster.identities,
            "dimension": status.roster.dimension,
            "trained": status.roster.trained,
            "attendance_rows": status.attendance_rows,
        })
        .to_string())
    }
}
