use anyhow::{anyhow, bail, Context, Result};
use cardbooth_core::catalog::{default_base_stats, Catalog, Gender};
use cardbooth_core::{Attribute, CardCompositor, CommandRemover, CompositorConfig, PlayerSelector};
use cardbooth_hw::{Backend, Camera, DiscoveryConfig, V4lOpener};
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

#[zbus::proxy(
    interface = "org.cardbooth.Kiosk1",
    default_service = "org.cardbooth.Kiosk1",
    default_path = "/org/cardbooth/Kiosk1"
)]
trait Kiosk {
    async fn status(&self) -> zbus::Result<String>;
    async fn current_card(&self) -> zbus::Result<String>;
    async fn set_gender(&self, tag: &str) -> zbus::Result<()>;
    async fn compose_from_photo(&self, path: &str, tag: &str) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "cardbooth", about = "Photo kiosk card generator CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List V4L2 capture devices
    Devices,
    /// Walk the camera discovery ladder and report the selected device
    Probe {
        /// Probe indices 0..count
        #[arg(long, default_value_t = 2)]
        device_count: u32,
        /// Backend order, most preferred first
        #[arg(
            long,
            value_delimiter = ',',
            default_values_t = Backend::DEFAULT_ORDER.to_vec()
        )]
        backends: Vec<Backend>,
        #[arg(long, default_value_t = 1280)]
        width: u32,
        #[arg(long, default_value_t = 720)]
        height: u32,
        /// Warm-up reads per candidate
        #[arg(long, default_value_t = 15)]
        attempts: usize,
    },
    /// Pick a player and derive a stat block
    Select {
        #[command(flatten)]
        catalog: CatalogArg,
        /// Catalog partition (male or female); omit for both
        #[arg(short, long)]
        gender: Option<Gender>,
        /// Seed the random source for a reproducible pick
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Compose a card from a photo file without the daemon
    Compose {
        /// Input photo
        photo: PathBuf,
        #[command(flatten)]
        catalog: CatalogArg,
        #[arg(short, long)]
        gender: Option<Gender>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long, env = "CARDBOOTH_TEMPLATE")]
        template: PathBuf,
        #[arg(long, env = "CARDBOOTH_GARMENT")]
        garment: PathBuf,
        #[arg(long, env = "CARDBOOTH_WORK_DIR")]
        work_dir: PathBuf,
        #[arg(short, long, env = "CARDBOOTH_OUTPUT")]
        output: PathBuf,
        /// Background-removal command; empty disables it
        #[arg(long, env = "CARDBOOTH_BACKGROUND_COMMAND", default_value = "rembg i")]
        background_command: String,
    },
    /// Append a player to the catalog
    CatalogAdd {
        #[command(flatten)]
        catalog: CatalogArg,
        #[arg(short, long)]
        gender: Gender,
        #[arg(short, long)]
        name: String,
        #[arg(short, long, default_value = "ST")]
        position: String,
        /// Base attribute as CODE=VALUE (repeatable); defaults to a balanced outfield block
        #[arg(long = "stat", value_parser = parse_stat)]
        stats: Vec<(Attribute, u8)>,
    },
    /// Show daemon status
    Status,
    /// Print the path of the daemon's current card
    CurrentCard,
    /// Set the daemon's gender tag (empty for any)
    SetGender { tag: String },
    /// Ask the daemon to compose a card from an uploaded photo
    Upload {
        photo: PathBuf,
        #[arg(short, long, default_value = "")]
        gender: String,
    },
}

#[derive(Args)]
struct CatalogArg {
    /// Player catalog JSON
    #[arg(long = "catalog", env = "CARDBOOTH_CATALOG")]
    path: PathBuf,
}

fn parse_stat(s: &str) -> Result<(Attribute, u8), String> {
    let (code, value) = s.split_once('=').ok_or_else(|| format!("expected CODE=VALUE, got {s}"))?;
    let attr: Attribute = code.parse()?;
    let value: u8 = value
        .trim()
        .parse()
        .map_err(|e| format!("invalid value for {attr}: {e}"))?;
    Ok((attr, value))
}

fn selector(catalog: Catalog, seed: Option<u64>) -> PlayerSelector {
    match seed {
        Some(seed) => PlayerSelector::seeded(catalog, seed),
        None => PlayerSelector::new(catalog),
    }
}

async fn proxy(system: bool) -> Result<KioskProxy<'static>> {
    let builder = if system {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let conn = builder
        .method_timeout(Duration::from_secs(120))
        .build()
        .await
        .context("connecting to D-Bus")?;
    Ok(KioskProxy::new(&conn).await?)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for d in devices {
                println!("{}  {} [{}] {}", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Probe {
            device_count,
            backends,
            width,
            height,
            attempts,
        } => {
            let config = DiscoveryConfig {
                device_count,
                backends,
                width,
                height,
                warmup_attempts: attempts,
                ..DiscoveryConfig::default()
            };
            let (candidate, camera) = cardbooth_hw::discover(&mut V4lOpener, &config)?;
            println!(
                "selected /dev/video{} via {} ({}x{}, {})",
                candidate.index, candidate.backend, camera.width, camera.height, camera.fourcc
            );
        }
        Commands::Select { catalog, gender, seed } => {
            let mut selector = selector(Catalog::load(&catalog.path)?, seed);
            let profile = selector.select(gender)?;
            let stats = selector.derive_stats(&profile.base_stats);
            let picked = serde_json::json!({ "profile": profile, "stats": stats });
            println!("{}", serde_json::to_string_pretty(&picked)?);
        }
        Commands::Compose {
            photo,
            catalog,
            gender,
            seed,
            template,
            garment,
            work_dir,
            output,
            background_command,
        } => {
            let mut selector = selector(Catalog::load(&catalog.path)?, seed);
            let profile = selector.select(gender)?;
            let stats = selector.derive_stats(&profile.base_stats);

            let remover = CommandRemover::from_command_line(&background_command, &work_dir);
            let compositor = CardCompositor::new(
                CompositorConfig {
                    template_path: template,
                    garment_path: garment,
                    work_dir,
                    output_path: output,
                },
                remover,
            );
            let asset = compositor.compose(&photo, &profile, &stats)?;
            println!("{}", serde_json::to_string_pretty(&asset)?);
        }
        Commands::CatalogAdd {
            catalog,
            gender,
            name,
            position,
            stats,
        } => {
            let base: BTreeMap<Attribute, u8> = if stats.is_empty() {
                default_base_stats()
            } else {
                stats.into_iter().collect()
            };
            let mut c = if catalog.path.exists() {
                Catalog::load(&catalog.path)?
            } else {
                Catalog::default()
            };
            let added = c.append(gender, &name, &position, base)?;
            c.save(&catalog.path)
                .with_context(|| format!("writing {}", catalog.path.display()))?;
            println!("added {gender} player {} ({})", added.id, added.name);
        }
        Commands::Status => {
            let status = proxy(cli.system).await?.status().await?;
            let value: serde_json::Value = serde_json::from_str(&status)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::CurrentCard => {
            println!("{}", proxy(cli.system).await?.current_card().await?);
        }
        Commands::SetGender { tag } => {
            Gender::parse_tag(&tag).map_err(|e| anyhow!(e))?;
            proxy(cli.system).await?.set_gender(&tag).await?;
        }
        Commands::Upload { photo, gender } => {
            let photo = photo
                .canonicalize()
                .with_context(|| format!("reading {}", photo.display()))?;
            let Some(path) = photo.to_str() else {
                bail!("photo path is not valid UTF-8: {}", photo.display());
            };
            let kiosk = proxy(cli.system).await?;
            println!("{}", kiosk.compose_from_photo(path, &gender).await?);
        }
    }

    Ok(())
}
