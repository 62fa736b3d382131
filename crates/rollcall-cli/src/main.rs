use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use zbus::proxy;

#[proxy(
    interface = "org.rollcall.Rollcall1",
    default_service = "org.rollcall.Rollcall1",
    default_path = "/org/rollcall/Rollcall1"
)]
trait Rollcall {
    fn enroll(&self, name: &str, id: &str, department: &str, section: &str)
        -> zbus::Result<String>;
    fn delete(&self, name: &str) -> zbus::Result<bool>;
    fn list_identities(&self) -> zbus::Result<String>;
    fn thumbnail(&self, name: &str) -> zbus::Result<Vec<u8>>;
    fn status(&self) -> zbus::Result<String>;
    fn reload(&self) -> zbus::Result<u32>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face recognition CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll the face currently in front of the camera
    Enroll {
        /// Unique display name (roster key)
        #[arg(short, long)]
        name: String,
        /// Student or employee ID
        #[arg(short, long)]
        id: String,
        #[arg(short, long)]
        department: String,
        #[arg(short, long)]
        section: String,
    },
    /// Delete an enrolled identity and its thumbnail
    Delete {
        name: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
    /// List enrolled identities
    List,
    /// Save an identity's enrollment thumbnail
    Thumbnail {
        name: String,
        /// Output file (default: <name>.png)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Show daemon status
    Status,
    /// Re-read the roster from storage
    Reload,
    /// List V4L2 capture devices (does not need the daemon)
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    match Cli::parse().command {
        Commands::Devices => list_devices(),
        command => run(command).await,
    }
}

async fn run(command: Commands) -> Result<()> {
    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    let proxy = RollcallProxy::new(&conn)
        .await
        .context("rollcalld is not reachable; is it running?")?;
    tracing::debug!(service = "org.rollcall.Rollcall1", "connected to rollcalld");

    match command {
        Commands::Enroll {
            name,
            id,
            department,
            section,
        } => {
            println!("Enrolling {name}; look at the camera...");
            let json = proxy.enroll(&name, &id, &department, &section).await?;
            let identity: serde_json::Value = serde_json::from_str(&json)?;
            println!("Enrolled {}", format_identity(&identity));
        }
        Commands::Delete { name, yes } => {
            if !yes && !confirm(&format!("Delete {name} and their thumbnail?"))? {
                println!("Aborted");
                return Ok(());
            }
            proxy.delete(&name).await?;
            println!("Deleted {name}");
        }
        Commands::List => {
            let json = proxy.list_identities().await?;
            let identities: Vec<serde_json::Value> = serde_json::from_str(&json)?;
            if identities.is_empty() {
                println!("No identities enrolled");
            }
            for identity in &identities {
                println!("{}", format_identity(identity));
            }
        }
        Commands::Thumbnail { name, out } => {
            let bytes = proxy.thumbnail(&name).await?;
            tracing::debug!(name = %name, bytes = bytes.len(), "thumbnail received");
            let path = out.unwrap_or_else(|| PathBuf::from(format!("{name}.png")));
            std::fs::write(&path, &bytes)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Wrote {} ({} bytes)", path.display(), bytes.len());
        }
        Commands::Status => {
            let json = proxy.status().await?;
            let status: serde_json::Value = serde_json::from_str(&json)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Reload => {
            let count = proxy.reload().await?;
            println!("Roster reloaded: {count} identities");
        }
        Commands::Devices => list_devices()?,
    }

    Ok(())
}

fn list_devices() -> Result<()> {
    let devices = rollcall_hw::Camera::list_devices();
    tracing::debug!(count = devices.len(), "probed V4L2 capture devices");
    if devices.is_empty() {
        bail!("no V4L2 capture devices found");
    }
    for device in devices {
        println!("{}\t{} ({}, {})", device.path, device.name, device.driver, device.bus);
    }
    Ok(())
}

fn confirm(question: &str) -> Result<bool> {
    print!("{question} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(is_yes(&answer))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

fn format_identity(identity: &serde_json::Value) -> String {
    let field = |key: &str| identity[key].as_str().unwrap_or("?").to_string();
    format!(
        "{}  id={}  department={}  section={}",
        field("name"),
        field("id"),
        field("department"),
        field("section")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_delete_yes_flag() {
        let cli = Cli::try_parse_from(["rollcall", "delete", "Alice", "--yes"]).unwrap();
        assert!(matches!(cli.command, Commands::Delete { ref name, yes: true } if name == "Alice"));
        let cli = Cli::try_parse_from(["rollcall", "delete", "Alice"]).unwrap();
        assert!(matches!(cli.command, Commands::Delete { yes: false, .. }));
    }

    #[test]
    fn test_enroll_requires_all_fields() {
        assert!(Cli::try_parse_from(["rollcall", "enroll", "-n", "Alice", "-i", "1"]).is_err());
        assert!(Cli::try_parse_from([
            "rollcall", "enroll", "-n", "Alice", "-i", "1", "-d", "CS", "-s", "A"
        ])
        .is_ok());
    }

    #[test]
    fn test_is_yes() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes("\n"));
        assert!(!is_yes("no"));
    }

    #[test]
    fn test_format_identity() {
        let identity = serde_json::json!({
            "name": "Alice", "id": "1", "department": "CS", "section": "A"
        });
        assert_eq!(
            format_identity(&identity),
            "Alice  id=1  department=CS  section=A"
        );
        assert_eq!(
            format_identity(&serde_json::json!({"name": "Bob"})),
            "Bob  id=?  department=?  section=?"
        );
    }
}
