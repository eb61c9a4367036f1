use crate::engine::{EngineError, EngineHandle};
use chrono::NaiveDate;
use rollcall_core::ExtractionError;
use rollcall_store::{CoordinatorError, StoreError};
use serde::Serialize;
use std::path::PathBuf;
use zbus::{fdo, interface, message::Header, Connection};

pub const BUS_NAME: &str = "org.freedesktop.Rollcall1";
pub const OBJECT_PATH: &str = "/org/freedesktop/Rollcall1";

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.freedesktop.Rollcall1
/// Object path: /org/freedesktop/Rollcall1
///
/// Structured replies are JSON strings. Enrollment and the clear
/// operations are reserved for callers whose unix uid is in
/// `operator_uids`.
pub struct RollcallService {
    engine: EngineHandle,
    operator_uids: Vec<u32>,
}

impl RollcallService {
    pub fn new(engine: EngineHandle, operator_uids: Vec<u32>) -> Self {
        Self { engine, operator_uids }
    }

    /// Resolve the caller's uid through the bus and check it against the
    /// operator list. Callers without a unique name are never operators.
    async fn caller_is_operator(&self, conn: &Connection, header: &Header<'_>) -> fdo::Result<bool> {
        let Some(sender) = header.sender() else {
            return Ok(false);
        };
        let dbus = fdo::DBusProxy::new(conn).await?;
        let uid = dbus.get_connection_unix_user(sender.clone().into()).await?;
        let allowed = is_operator(uid, &self.operator_uids);
        tracing::debug!(sender = %sender, uid, allowed, "resolved caller");
        Ok(allowed)
    }
}

#[interface(name = "org.freedesktop.Rollcall1")]
impl RollcallService {
    /// Enroll a pre-extracted embedding under `identity`.
    async fn enroll(
        &self,
        identity: &str,
        vector: Vec<f64>,
        #[zbus(connection)] conn: &Connection,
        #[zbus(header)] header: Header<'_>,
    ) -> fdo::Result<String> {
        tracing::info!(identity, dimension = vector.len(), "enroll requested");
        let authorized = self.caller_is_operator(conn, &header).await?;
        let receipt = self
            .engine
            .enroll(identity.to_string(), vector, authorized)
            .await
            .map_err(to_fdo)?;
        to_json(&receipt)
    }

    /// Extract an embedding from the image at `image_path` and enroll it.
    async fn enroll_image(
        &self,
        identity: &str,
        image_path: &str,
        #[zbus(connection)] conn: &Connection,
        #[zbus(header)] header: Header<'_>,
    ) -> fdo::Result<String> {
        tracing::info!(identity, image = image_path, "enroll_image requested");
        let authorized = self.caller_is_operator(conn, &header).await?;
        let receipt = self
            .engine
            .enroll_image(identity.to_string(), PathBuf::from(image_path), authorized)
            .await
            .map_err(to_fdo)?;
        to_json(&receipt)
    }

    /// Match a probe embedding; a match marks the identity present today.
    async fn recognize(&self, vector: Vec<f64>) -> fdo::Result<String> {
        tracing::debug!(dimension = vector.len(), "recognize requested");
        let outcome = self.engine.recognize(vector).await.map_err(to_fdo)?;
        to_json(&outcome)
    }

    /// Extract a probe from the image at `image_path` and recognize it.
    async fn recognize_image(&self, image_path: &str) -> fdo::Result<String> {
        tracing::debug!(image = image_path, "recognize_image requested");
        let outcome = self
            .engine
            .recognize_image(PathBuf::from(image_path))
            .await
            .map_err(to_fdo)?;
        to_json(&outcome)
    }

    /// Enrolled identities with their embedding counts.
    async fn list_identities(&self) -> fdo::Result<String> {
        let identities = self.engine.list_identities().await.map_err(to_fdo)?;
        to_json(&identities)
    }

    /// Delete every enrolled embedding. Returns the number removed.
    async fn clear_gallery(
        &self,
        #[zbus(connection)] conn: &Connection,
        #[zbus(header)] header: Header<'_>,
    ) -> fdo::Result<u32> {
        tracing::info!("clear_gallery requested");
        let authorized = self.caller_is_operator(conn, &header).await?;
        let removed = self.engine.clear_gallery(authorized).await.map_err(to_fdo)?;
        Ok(u32::try_from(removed).unwrap_or(u32::MAX))
    }

    /// Discard today's attendance ledger. Returns whether one existed.
    async fn clear_today(
        &self,
        #[zbus(connection)] conn: &Connection,
        #[zbus(header)] header: Header<'_>,
    ) -> fdo::Result<bool> {
        tracing::info!("clear_today requested");
        let authorized = self.caller_is_operator(conn, &header).await?;
        self.engine.clear_today(authorized).await.map_err(to_fdo)
    }

    /// CSV export of the ledger for `day` (`YYYY-MM-DD`, empty for today).
    async fn export_ledger(&self, day: &str) -> fdo::Result<Vec<u8>> {
        let day = parse_day(day)?;
        self.engine.export(day).await.map_err(to_fdo)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        to_json(&status)
    }
}

pub fn is_operator(uid: u32, operator_uids: &[u32]) -> bool {
    operator_uids.contains(&uid)
}

fn parse_day(raw: &str) -> fdo::Result<Option<NaiveDate>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(Some)
        .map_err(|e| fdo::Error::InvalidArgs(format!("day '{raw}': {e}")))
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(e.to_string()))
}

fn to_fdo(err: EngineError) -> fdo::Error {
    let message = err.to_string();
    match err {
        EngineError::Coordinator(CoordinatorError::Unauthorized) => fdo::Error::AccessDenied(message),
        EngineError::Coordinator(CoordinatorError::Invalid(_))
        | EngineError::Coordinator(CoordinatorError::Store(StoreError::Invalid(_)))
        | EngineError::Store(StoreError::Invalid(_)) => fdo::Error::InvalidArgs(message),
        EngineError::Coordinator(CoordinatorError::Extraction(ExtractionError::NoFaceDetected(_))) => {
            fdo::Error::InvalidArgs(message)
        }
        EngineError::NoExtractor => fdo::Error::NotSupported(message),
        other => {
            tracing::error!(error = %other, "request failed");
            fdo::Error::Failed(message)
        }
    }
}
