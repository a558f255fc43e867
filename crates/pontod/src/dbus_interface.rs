use zbus::interface;

use crate::engine::{EngineError, EngineHandle};

/// D-Bus interface for the Ponto time-clock daemon.
///
/// Bus name: br.com.Ponto1
/// Object path: /br/com/Ponto1
pub struct PontoService {
    engine: EngineHandle,
}

impl PontoService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

fn to_fdo(e: EngineError) -> zbus::fdo::Error {
    match e {
        EngineError::Busy => zbus::fdo::Error::LimitsExceeded("a scan is already running".into()),
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

#[interface(name = "br.com.Ponto1")]
impl PontoService {
    /// Run a full clock operation: scan, identify, decide, register.
    /// An empty `site_id` uses the device's configured site. Returns a
    /// JSON summary of the committed action(s).
    async fn clock_in(&self, site_id: &str) -> zbus::fdo::Result<String> {
        tracing::info!(site_id, "clock_in requested");
        let site = if site_id.is_empty() {
            None
        } else {
            Some(site_id.to_string())
        };
        let summary = self.engine.clock_in(site).await.map_err(to_fdo)?;
        serde_json::to_string(&summary)
            .map_err(|e| zbus::fdo::Error::Failed(format!("summary encode: {e}")))
    }

    /// Cooperatively cancel the running scan, if any.
    async fn cancel(&self) -> zbus::fdo::Result<()> {
        tracing::info!("cancel requested");
        self.engine.cancel();
        Ok(())
    }

    /// Current scan phase and user-facing status text, as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "phase": format!("{:?}", status.phase),
            "message": status.message,
        })
        .to_string())
    }
}
