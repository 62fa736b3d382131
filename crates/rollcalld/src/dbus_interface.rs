use crate::engine::{PipelineHandle, RecognitionStatus, SourceMode};
use crate::enroll::{EnrollError, EnrollmentController};
use rollcall_core::IdentityMetadata;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use zbus::fdo;
use zbus::interface;
use zbus::object_server::SignalEmitter;

pub const BUS_NAME: &str = "org.rollcall.Rollcall1";
pub const OBJECT_PATH: &str = "/org/rollcall/Rollcall1";

/// D-Bus interface for the Rollcall daemon.
///
/// Bus name: org.rollcall.Rollcall1
/// Object path: /org/rollcall/Rollcall1
pub struct RollcallService {
    controller: Arc<EnrollmentController>,
    pipeline: PipelineHandle,
    status: watch::Receiver<RecognitionStatus>,
    mode: watch::Receiver<SourceMode>,
    camera_device: String,
}

/// Public part of an identity; embeddings never leave the daemon.
#[derive(Serialize)]
struct IdentitySummary<'a> {
    name: &'a str,
    id: &'a str,
    department: &'a str,
    section: &'a str,
}

impl RollcallService {
    pub fn new(
        controller: Arc<EnrollmentController>,
        pipeline: PipelineHandle,
        status: watch::Receiver<RecognitionStatus>,
        mode: watch::Receiver<SourceMode>,
        camera_device: String,
    ) -> Self {
        Self {
            controller,
            pipeline,
            status,
            mode,
            camera_device,
        }
    }

    /// Run blocking roster work off the async executor.
    async fn blocking<T, F>(&self, work: F) -> fdo::Result<T>
    where
        F: FnOnce(&EnrollmentController) -> Result<T, EnrollError> + Send + 'static,
        T: Send + 'static,
    {
        let controller = Arc::clone(&self.controller);
        tokio::task::spawn_blocking(move || work(&controller))
            .await
            .map_err(|e| fdo::Error::Failed(format!("worker failed: {e}")))?
            .map_err(to_fdo)
    }
}

#[interface(name = "org.rollcall.Rollcall1")]
impl RollcallService {
    /// Enroll the face currently in view. Returns the identity as JSON.
    async fn enroll(
        &self,
        name: &str,
        id: &str,
        department: &str,
        section: &str,
    ) -> fdo::Result<String> {
        tracing::info!(name, id, "enroll requested");
        let metadata = IdentityMetadata {
            name: name.to_string(),
            id: id.to_string(),
            department: department.to_string(),
            section: section.to_string(),
        };
        let identity = self.blocking(move |c| c.enroll(metadata)).await?;
        to_json(&summary(&identity))
    }

    /// Remove an enrolled identity and its thumbnail.
    async fn delete(&self, name: &str) -> fdo::Result<bool> {
        tracing::info!(name, "delete requested");
        let name = name.to_string();
        self.blocking(move |c| c.delete(&name)).await?;
        Ok(true)
    }

    /// Enrolled identities as a JSON array, in roster order.
    async fn list_identities(&self) -> fdo::Result<String> {
        let roster = self.controller.roster().snapshot();
        let summaries: Vec<_> = roster.iter().map(summary).collect();
        to_json(&summaries)
    }

    /// PNG thumbnail for an enrolled identity.
    async fn thumbnail(&self, name: &str) -> fdo::Result<Vec<u8>> {
        let key = name.to_string();
        let bytes = self
            .blocking(move |c| Ok(c.roster().thumbnail(&key)?))
            .await?;
        bytes.ok_or_else(|| fdo::Error::UnknownObject(format!("no thumbnail for {name:?}")))
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let recognition = self.status.borrow().clone();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "camera": self.camera_device,
            "source": *self.mode.borrow(),
            "pipeline": self.pipeline.state(),
            "enrolled": self.controller.roster().len(),
            "last": recognition,
        })
        .to_string())
    }

    /// Re-read the roster from storage. Returns the number of identities.
    async fn reload(&self) -> fdo::Result<u32> {
        tracing::info!("reload requested");
        let count = self.blocking(|c| Ok(c.roster().load()?)).await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    /// Emitted once per debounced recognition; the payload is the event as JSON.
    #[zbus(signal)]
    pub async fn recognized(emitter: &SignalEmitter<'_>, event: &str) -> zbus::Result<()>;
}

fn summary(identity: &rollcall_core::Identity) -> IdentitySummary<'_> {
    IdentitySummary {
        name: &identity.name,
        id: &identity.id,
        department: &identity.department,
        section: &identity.section,
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(e.to_string()))
}

fn to_fdo(error: EnrollError) -> fdo::Error {
    let message = error.to_string();
    match error {
        EnrollError::Validation { .. } => fdo::Error::InvalidArgs(message),
        EnrollError::NotFound(_) => fdo::Error::UnknownObject(message),
        EnrollError::Persistence(_) => fdo::Error::IOError(message),
        EnrollError::NoFaceCaptured | EnrollError::Thumbnail(_) => fdo::Error::Failed(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_store::StoreError;

    #[test]
    fn test_error_mapping() {
        assert!(matches!(
            to_fdo(EnrollError::Validation {
                field: "id",
                reason: "must not be empty"
            }),
            fdo::Error::InvalidArgs(m) if m == "invalid id: must not be empty"
        ));
        assert!(matches!(
            to_fdo(EnrollError::NotFound("zed".into())),
            fdo::Error::UnknownObject(_)
        ));
        assert!(matches!(
            to_fdo(EnrollError::Persistence(StoreError::Corrupt("x".into()))),
            fdo::Error::IOError(_)
        ));
        assert!(matches!(
            to_fdo(EnrollError::NoFaceCaptured),
            fdo::Error::Failed(_)
        ));
    }

    #[test]
    fn test_summary_omits_embedding() {
        let identity = crate::testing::identity("amy", &[0.5, 0.5]);
        let json = to_json(&[summary(&identity)]).unwrap();
        assert_eq!(
            json,
            r#"[{"name":"amy","id":"7","department":"CS","section":"A"}]"#
        );
    }
}
