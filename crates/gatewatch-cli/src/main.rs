use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use gatewatch_hw::frame::{avg_brightness, is_dark_frame};
use gatewatch_hw::Camera;
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.gatewatch.Gatewatch1",
    default_service = "org.gatewatch.Gatewatch1",
    default_path = "/org/gatewatch/Gatewatch1"
)]
trait Gatewatch {
    async fn status(&self) -> zbus::Result<String>;
    async fn snapshots(&self, include_images: bool) -> zbus::Result<String>;
    async fn check_in(&self) -> zbus::Result<String>;
    async fn check_out(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "gatewatch", about = "gatewatch visitor tracking CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check in the visitor in front of the camera
    CheckIn,
    /// Check out the visitor in front of the camera
    CheckOut,
    /// List recent face snapshots and their labels
    Snapshots {
        /// Include base64 JPEG crops in the output
        #[arg(long)]
        images: bool,
    },
    /// Show daemon status
    Status,
    /// Capture one frame directly from the camera, bypassing the daemon
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Where to write the captured frame
        #[arg(short, long, default_value = "gatewatch-test.png")]
        output: PathBuf,
    },
}

/// Prefer the daemon's own wording for method errors.
fn describe(err: zbus::Error) -> anyhow::Error {
    match err {
        zbus::Error::MethodError(_, Some(msg), _) => anyhow!(msg),
        other => anyhow!(other),
    }
}

async fn proxy() -> Result<GatewatchProxy<'static>> {
    let conn = zbus::connection::Builder::system()?
        .method_timeout(std::time::Duration::from_secs(30))
        .build()
        .await
        .context("connecting to the system bus")?;
    Ok(GatewatchProxy::new(&conn).await?)
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn print_attendance(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    match value["message"].as_str() {
        Some(message) => println!("{message}"),
        None => println!("{}", serde_json::to_string_pretty(&value)?),
    }
    Ok(())
}

fn camera_test(device: &str, output: &Path) -> Result<()> {
    for info in Camera::list_devices() {
        println!("{}: {} ({}, {})", info.path, info.name, info.driver, info.bus);
    }

    let camera = Camera::open(device, 640, 480)?;
    println!(
        "opened {} at {}x{} ({:?})",
        camera.device_path,
        camera.width,
        camera.height,
        camera.pixel_format()
    );
    camera.warm_up(4)?;
    let frame = camera.capture_frame()?;
    println!(
        "frame #{}: brightness {:.1}, dark: {}",
        frame.sequence,
        avg_brightness(&frame),
        is_dark_frame(&frame, 0.95)
    );

    let image = frame
        .to_image()
        .ok_or_else(|| anyhow!("captured frame has no usable pixels"))?;
    image
        .save(output)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("saved {}", output.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::CheckIn => {
            let reply = proxy().await?.check_in().await.map_err(describe)?;
            print_attendance(&reply)?;
        }
        Commands::CheckOut => {
            let reply = proxy().await?.check_out().await.map_err(describe)?;
            print_attendance(&reply)?;
        }
        Commands::Snapshots { images } => {
            let reply = proxy().await?.snapshots(images).await.map_err(describe)?;
            print_json(&reply)?;
        }
        Commands::Status => {
            let reply = proxy().await?.status().await.map_err(describe)?;
            print_json(&reply)?;
        }
        Commands::Test { device, output } => {
            tracing::debug!(%device, "direct camera test");
            camera_test(&device, &output)?;
        }
    }

    Ok(())
}
