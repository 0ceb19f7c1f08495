use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

// `#[zbus::proxy]` generates `AttendanceProxy` (async) and a blocking variant.
#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    async fn enroll(&self, name: &str) -> zbus::Result<String>;
    async fn recognize(&self) -> zbus::Result<String>;
    async fn summary(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll the face in front of the camera
    Enroll {
        /// Name to store; omit to say it aloud
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Recognize the face in front of the camera and mark attendance
    Recognize,
    /// Show attendance counts per person
    Summary,
    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let conn = if cli.system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("connecting to D-Bus")?;
    tracing::debug!(system = cli.system, "connected to D-Bus");
    let proxy = AttendanceProxy::new(&conn)
        .await
        .context("rollcalld not reachable")?;

    match cli.command {
        Commands::Enroll { name } => {
            match &name {
                Some(n) => println!("Enrolling {n}, look at the camera"),
                None => println!("Enrolling, look at the camera, then say your name"),
            }
            let label = proxy.enroll(name.as_deref().unwrap_or("")).await?;
            println!("Enrolled: {label}");
        }
        Commands::Recognize => {
            println!("Recognizing, look at the camera");
            let reply: serde_json::Value = serde_json::from_str(&proxy.recognize().await?)?;
            println!(
                "Welcome {} (confidence {:.2})",
                reply["label"].as_str().unwrap_or("?"),
                reply["confidence"].as_f64().unwrap_or(0.0)
            );
        }
        Commands::Summary => {
            let rows: Vec<serde_json::Value> = serde_json::from_str(&proxy.summary().await?)?;
            if rows.is_empty() {
                println!("No attendance records found.");
            } else {
                println!("Attendance Summary:");
                for row in rows {
                    println!(
                        "  {}: {} times",
                        row["label"].as_str().unwrap_or("?"),
                        row["count"].as_u64().unwrap_or(0)
                    );
                }
            }
        }
        Commands::Status => {
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }

    Ok(())
}
