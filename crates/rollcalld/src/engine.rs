use rollcall_core::{AttendanceError, AttendanceSystem, Enrollment, Prediction, SummaryRow, SystemStatus};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Attendance(#[from] AttendanceError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        /// Typed name; `None` asks the speech listener.
        name: Option<String>,
        reply: oneshot::Sender<Result<Enrollment, AttendanceError>>,
    },
    Recognize {
        reply: oneshot::Sender<Result<Prediction, AttendanceError>>,
    },
    Summary {
        reply: oneshot::Sender<Result<Vec<SummaryRow>, AttendanceError>>,
    },
    Status {
        reply: oneshot::Sender<Result<SystemStatus, AttendanceError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Capture a face, acquire the name (typed or spoken), store and retrain.
    pub async fn enroll(&self, name: Option<String>) -> Result<Enrollment, EngineError> {
        self.call(|reply| EngineRequest::Enroll { name, reply }).await
    }

    /// Capture a face, identify it, and mark attendance.
    pub async fn recognize(&self) -> Result<Prediction, EngineError> {
        self.call(|reply| EngineRequest::Recognize { reply }).await
    }

    pub async fn summary(&self) -> Result<Vec<SummaryRow>, EngineError> {
        self.call(|reply| EngineRequest::Summary { reply }).await
    }

    pub async fn status(&self) -> Result<SystemStatus, EngineError> {
        self.call(|reply| EngineRequest::Status { reply }).await
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, AttendanceError>>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The thread owns the attendance system, so every capture, store write
/// and ledger write runs off the async runtime and one request at a time.
pub fn spawn_engine(system: AttendanceSystem) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(4);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Enroll { name, reply } => {
                        let result = match name.as_deref() {
                            Some(name) => system.enroll_as(name),
                            None => system.enroll(),
                        };
                        let _ = reply.send(result);
                    }
                    EngineRequest::Recognize { reply } => {
                        let _ = reply.send(system.recognize());
                    }
                    EngineRequest::Summary { reply } => {
                        let _ = reply.send(system.summarize());
                    }
                    EngineRequest::Status { reply } => {
                        let _ = reply.send(system.status());
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })?;

    Ok(EngineHandle { tx })
}
