use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod api;
mod capture;
mod config;
mod dbus_interface;
mod engine;
mod flow;
mod geo;
mod model;
mod registrar;
mod scan;

use api::HttpApi;
use config::{Config, DeviceIdentity};
use dbus_interface::PontoService;
use engine::{CameraScanDriver, Engine};
use flow::RegistrationFlow;
use geo::FixedGeolocator;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("pontod starting");

    let config = Config::from_env();
    let identity = DeviceIdentity::load(&config.identity_path).with_context(|| {
        format!(
            "failed to load device identity from {}",
            config.identity_path.display()
        )
    })?;
    tracing::info!(site = %identity.site_id, api = %identity.api_base_url, "device identity loaded");

    let api = Arc::new(HttpApi::new(
        &identity.api_base_url,
        &identity.api_token,
        config.register_timeout,
    )?);

    let flow = RegistrationFlow::new(api.clone(), config.register_timeout, config.settle_delay);
    let geolocator = Arc::new(FixedGeolocator::new(identity.coords()));
    let driver = CameraScanDriver::from_config(&config);

    let handle = Engine::new(
        driver,
        api,
        geolocator,
        flow,
        identity.site_id.clone(),
        config.geo_timeout,
    )
    .spawn();

    let _conn = zbus::connection::Builder::system()
        .context("failed to connect to system bus")?
        .name("br.com.Ponto1")?
        .serve_at("/br/com/Ponto1", PontoService::new(handle))?
        .build()
        .await
        .context("failed to claim bus name")?;

    tracing::info!("pontod ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("pontod shutting down");

    Ok(())
}
