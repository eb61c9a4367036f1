use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[zbus::proxy(
    interface = "org.freedesktop.Rollcall1",
    default_service = "org.freedesktop.Rollcall1",
    default_path = "/org/freedesktop/Rollcall1"
)]
trait Rollcall {
    async fn enroll(&self, identity: &str, vector: &[f64]) -> zbus::Result<String>;
    async fn enroll_image(&self, identity: &str, image_path: &str) -> zbus::Result<String>;
    async fn recognize(&self, vector: &[f64]) -> zbus::Result<String>;
    async fn recognize_image(&self, image_path: &str) -> zbus::Result<String>;
    async fn list_identities(&self) -> zbus::Result<String>;
    async fn clear_gallery(&self) -> zbus::Result<u32>;
    async fn clear_today(&self) -> zbus::Result<bool>;
    async fn export_ledger(&self, day: &str) -> zbus::Result<Vec<u8>>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face attendance CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll a face under an identity (operator only)
    Enroll {
        /// Identity (name) to enroll
        #[arg(short, long)]
        identity: String,
        #[command(flatten)]
        source: ProbeSource,
    },
    /// Recognize a face and mark the identity present today
    Recognize {
        #[command(flatten)]
        source: ProbeSource,
    },
    /// List enrolled identities
    List,
    /// Delete every enrolled embedding (operator only)
    ClearGallery {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
    /// Delete today's attendance ledger (operator only)
    ClearToday {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
    /// Export an attendance ledger as CSV
    Export {
        /// Day to export (YYYY-MM-DD); defaults to today
        #[arg(short, long)]
        day: Option<NaiveDate>,
        /// Output file; defaults to stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Show daemon status
    Status,
}

/// Where the face comes from: a JSON embedding file or an image for the
/// daemon's extractor.
#[derive(clap::Args)]
#[group(required = true, multiple = false)]
struct ProbeSource {
    /// JSON file holding the embedding (`-` for stdin)
    #[arg(long)]
    vector: Option<PathBuf>,
    /// Image file, embedded by the daemon's configured extractor
    #[arg(long)]
    image: Option<PathBuf>,
}

enum Probe {
    Vector(Vec<f64>),
    Image(String),
}

impl ProbeSource {
    fn resolve(self) -> Result<Probe> {
        match (self.vector, self.image) {
            (Some(path), _) => Ok(Probe::Vector(read_vector_file(&path)?)),
            (None, Some(image)) => {
                // The daemon resolves paths in its own working directory.
                let image = std::fs::canonicalize(&image)
                    .with_context(|| format!("cannot access {}", image.display()))?;
                Ok(Probe::Image(image.to_string_lossy().into_owned()))
            }
            (None, None) => bail!("either --vector or --image is required"),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum VectorFile {
    Bare(Vec<f64>),
    Wrapped { embedding: Vec<f64> },
}

fn read_vector_file(path: &Path) -> Result<Vec<f64>> {
    let raw = if path == Path::new("-") {
        let mut raw = String::new();
        std::io::stdin().read_to_string(&mut raw)?;
        raw
    } else {
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?
    };
    parse_vector(&raw).with_context(|| format!("invalid embedding in {}", path.display()))
}

fn parse_vector(raw: &str) -> Result<Vec<f64>> {
    let values = match serde_json::from_str::<VectorFile>(raw)? {
        VectorFile::Bare(values) => values,
        VectorFile::Wrapped { embedding } => embedding,
    };
    if values.is_empty() {
        bail!("embedding is empty");
    }
    Ok(values)
}

fn print_json(reply: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(reply).context("daemon returned invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let builder = if cli.session {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let conn = builder
        .method_timeout(Duration::from_secs(120))
        .build()
        .await
        .context("failed to connect to D-Bus")?;
    let proxy = RollcallProxy::new(&conn).await?;
    tracing::debug!(session = cli.session, "connected to rollcalld");

    match cli.command {
        Commands::Enroll { identity, source } => {
            let reply = match source.resolve()? {
                Probe::Vector(vector) => proxy.enroll(&identity, &vector).await?,
                Probe::Image(image) => proxy.enroll_image(&identity, &image).await?,
            };
            print_json(&reply)?;
        }
        Commands::Recognize { source } => {
            let reply = match source.resolve()? {
                Probe::Vector(vector) => proxy.recognize(&vector).await?,
                Probe::Image(image) => proxy.recognize_image(&image).await?,
            };
            print_json(&reply)?;
        }
        Commands::List => {
            print_json(&proxy.list_identities().await?)?;
        }
        Commands::ClearGallery { yes } => {
            if !yes {
                bail!("refusing to delete the gallery without --yes");
            }
            let removed = proxy.clear_gallery().await?;
            println!("removed {removed} embedding(s)");
        }
        Commands::ClearToday { yes } => {
            if !yes {
                bail!("refusing to delete today's ledger without --yes");
            }
            if proxy.clear_today().await? {
                println!("today's attendance ledger deleted");
            } else {
                println!("no attendance recorded today");
            }
        }
        Commands::Export { day, out } => {
            let day = day.map(|d| d.format("%Y-%m-%d").to_string()).unwrap_or_default();
            let csv = proxy.export_ledger(&day).await?;
            match out {
                Some(path) => {
                    std::fs::write(&path, &csv).with_context(|| format!("failed to write {}", path.display()))?;
                    eprintln!("wrote {}", path.display());
                }
                None => std::io::stdout().write_all(&csv)?,
            }
        }
        Commands::Status => {
            print_json(&proxy.status().await?)?;
        }
    }

    Ok(())
}
