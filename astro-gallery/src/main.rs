//! # Astro Gallery
//!
//! Reads a rover photo manifest and pages it through a fixed number of
//! display slots, the way a scrolling grid reuses its cells. Each page
//! rebinds every slot, which cancels fetches the previous page left
//! unfinished. Deliveries are applied on the main thread only.

mod gallery;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use astro_core::{AstroConfig, parse_manifest};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::gallery::Gallery;

#[derive(Parser, Debug)]
#[command(name = "astro-gallery")]
#[command(about = "Fetch and display rover photos through reusable slots")]
struct Cli {
    /// JSON manifest: `{"photos": [...]}` or a bare array of
    /// `{"id": .., "img_src": ..}` entries
    manifest: PathBuf,

    /// Configuration file (TOML, YAML or JSON); `ASTRO_*` variables override it
    #[arg(short, long, env = "ASTRO_CONFIG")]
    config: Option<PathBuf>,

    /// Number of display slots (overrides config)
    #[arg(long)]
    slots: Option<usize>,

    /// Milliseconds to wait on each page before scrolling on (overrides config)
    #[arg(long)]
    wait_ms: Option<u64>,

    /// Stop after this many pages
    #[arg(long)]
    pages: Option<usize>,
}

impl Cli {
    fn apply_overrides(&self, config: &mut AstroConfig) {
        if let Some(slots) = self.slots {
            config.gallery.slots = slots;
        }
        if let Some(wait_ms) = self.wait_ms {
            config.gallery.drain_wait_ms = wait_ms;
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,astro_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = AstroConfig::load(cli.config.as_deref())
        .context("failed to load configuration")?;
    cli.apply_overrides(&mut config);
    config.validate().context("invalid configuration")?;

    let manifest = std::fs::read_to_string(&cli.manifest).with_context(|| {
        format!("failed to read manifest {}", cli.manifest.display())
    })?;
    let photos = parse_manifest(&manifest).with_context(|| {
        format!("failed to parse manifest {}", cli.manifest.display())
    })?;
    info!(
        photos = photos.len(),
        slots = config.gallery.slots,
        workers = config.fetch.worker_threads,
        "starting gallery"
    );

    let mut gallery = Gallery::new(&config)?;
    let wait = Duration::from_millis(config.gallery.drain_wait_ms);
    let pages = gallery.pages(&photos, cli.pages);

    for (index, page) in pages.enumerate() {
        let summary = gallery.show_page(page, wait);
        info!(
            page = index,
            applied = summary.applied,
            failed = summary.failed,
            stale = summary.stale,
            "page settled"
        );
    }

    let report = gallery.finish();
    println!("{report}");
    Ok(())
}
