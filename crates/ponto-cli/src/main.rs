use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ponto_hw::{CameraSession, DisplayTransform, Orientation};

#[derive(Parser)]
#[command(name = "ponto", about = "Ponto time-clock CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan your face and register an entrada/saida
    Clock {
        /// Site to register against (defaults to the device's site)
        #[arg(short, long)]
        site: Option<String>,
    },
    /// Cancel the running scan
    Cancel,
    /// Show daemon status
    Status,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        /// V4L2 device path
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Negotiate for a portrait-mounted display
        #[arg(long)]
        portrait: bool,
    },
}

#[zbus::proxy(
    interface = "br.com.Ponto1",
    default_service = "br.com.Ponto1",
    default_path = "/br/com/Ponto1"
)]
trait Ponto {
    async fn clock_in(&self, site_id: &str) -> zbus::Result<String>;
    async fn cancel(&self) -> zbus::Result<()>;
    async fn status(&self) -> zbus::Result<String>;
}

async fn proxy() -> Result<PontoProxy<'static>> {
    let conn = zbus::Connection::system()
        .await
        .context("failed to connect to system bus; is pontod running?")?;
    PontoProxy::new(&conn).await.context("failed to create proxy")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Clock { site } => {
            let raw = proxy()
                .await?
                .clock_in(site.as_deref().unwrap_or(""))
                .await
                .context("clock operation failed")?;
            let summary: serde_json::Value = serde_json::from_str(&raw)?;
            let name = summary["user_name"].as_str().unwrap_or("?");
            println!("Identified: {name}");
            if let Some(actions) = summary["actions"].as_array() {
                for action in actions {
                    println!(
                        "  {} @ {}",
                        action["action"].as_str().unwrap_or("?"),
                        action["site_id"].as_str().unwrap_or("?")
                    );
                }
            }
            if summary["via_fallback"].as_bool() == Some(true) {
                println!("  (decided locally; auto-decision endpoint unavailable)");
            }
        }
        Commands::Cancel => {
            proxy().await?.cancel().await?;
            println!("Cancelled");
        }
        Commands::Status => {
            let raw = proxy().await?.status().await?;
            let status: serde_json::Value = serde_json::from_str(&raw)?;
            println!(
                "pontod {}: {} — {}",
                status["version"].as_str().unwrap_or("?"),
                status["phase"].as_str().unwrap_or("?"),
                status["message"].as_str().unwrap_or(""),
            );
        }
        Commands::Test { device, portrait } => {
            println!("Opening {device}...");
            let orientation = if portrait {
                Orientation::Portrait
            } else {
                Orientation::Landscape
            };
            let mut session = CameraSession::new(&device);
            session.set_orientation(orientation)?;
            session.acquire()?;
            let frame = session.next_frame()?;
            println!(
                "Captured {}x{} frame, avg brightness {:.1}",
                frame.width,
                frame.height,
                frame.avg_brightness()
            );
            match session.display_transform() {
                DisplayTransform::None => println!("Display transform: none"),
                DisplayTransform::Rotate90 => {
                    println!("Display transform: rotate 90 (stream disagrees with mount)")
                }
            }
            session.release();
            println!("Camera OK");
        }
    }

    Ok(())
}
