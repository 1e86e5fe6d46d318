//! ompspots CLI — command-line interface for OMP gene calling.

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

use ompspots::diagnostics::{write_spot_shape_png, SpotShapeDump};
use ompspots::{BackendKind, GeneCaller, InMemoryDataset, OmpConfig};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "ompspots")]
#[command(about = "Call gene spots in multiplexed fluorescence tiles with orthogonal matching pursuit")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run gene calling on an in-memory dataset.
    Run(CliRunArgs),

    /// Print the default configuration as JSON.
    DefaultConfig,

    /// Print code book statistics of a dataset.
    CodebookInfo {
        /// Path to the dataset JSON.
        #[arg(long)]
        dataset: PathBuf,
    },
}

#[derive(Debug, Clone, Args)]
struct CliRunArgs {
    /// Path to the dataset JSON (code book, geometry, colours).
    #[arg(long)]
    dataset: PathBuf,

    /// Path to a configuration JSON. Missing fields take defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to write the spot table (JSON).
    #[arg(long)]
    out: PathBuf,

    /// Path to write the calibrated spot shape (JSON).
    #[arg(long)]
    shape_json: Option<PathBuf>,

    /// Path to write a PNG rendering of the spot shape.
    #[arg(long)]
    shape_png: Option<PathBuf>,

    /// Force the single-threaded backend.
    #[arg(long)]
    serial: bool,

    /// Override the maximum number of genes per pixel.
    #[arg(long)]
    max_genes: Option<usize>,

    /// Override the minimum spot score.
    #[arg(long)]
    score_threshold: Option<f32>,
}

impl CliRunArgs {
    fn to_config(&self) -> CliResult<OmpConfig> {
        let mut config = match &self.config {
            Some(path) => OmpConfig::from_json_file(path)?,
            None => OmpConfig::default(),
        };
        if self.serial {
            config.backend = BackendKind::Serial;
        }
        if let Some(n) = self.max_genes {
            config.coefficients.maximum_iterations = n;
        }
        if let Some(t) = self.score_threshold {
            config.scoring.score_threshold = t;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_gene_calling(&args),
        Commands::DefaultConfig => run_default_config(),
        Commands::CodebookInfo { dataset } => run_codebook_info(&dataset),
    }
}

// ── run ────────────────────────────────────────────────────────────────

fn run_gene_calling(args: &CliRunArgs) -> CliResult<()> {
    tracing::info!("Loading dataset: {}", args.dataset.display());
    let dataset = InMemoryDataset::from_json_file(&args.dataset)?;
    let config = args.to_config()?;
    let caller = GeneCaller::for_dataset(&dataset, config)?;

    let result = caller.call(&dataset, &dataset.geometry)?;
    tracing::info!(
        "Detected {} spots over {} tiles",
        result.spots.len(),
        dataset.geometry.tiles.len()
    );

    let json = serde_json::to_string_pretty(&result.spots)?;
    std::fs::write(&args.out, json)?;
    tracing::info!("Spot table written to {}", args.out.display());

    if let Some(path) = &args.shape_json {
        SpotShapeDump::from_shape(&result.spot_shape).write_json(path)?;
        tracing::info!("Spot shape written to {}", path.display());
    }
    if let Some(path) = &args.shape_png {
        write_spot_shape_png(&result.spot_shape, path)?;
        tracing::info!("Spot shape image written to {}", path.display());
    }
    Ok(())
}

// ── default-config ─────────────────────────────────────────────────────

fn run_default_config() -> CliResult<()> {
    println!("{}", serde_json::to_string_pretty(&OmpConfig::default())?);
    Ok(())
}

// ── codebook-info ──────────────────────────────────────────────────────

fn run_codebook_info(path: &Path) -> CliResult<()> {
    let dataset = InMemoryDataset::from_json_file(path)?;
    let book = dataset.codebook()?;

    println!("ompspots code book");
    println!("  rounds:    {}", book.n_rounds());
    println!("  channels:  {}", book.n_channels());
    println!("  genes:     {}", book.n_genes());

    let mut best: Option<(usize, usize, f32)> = None;
    for a in 0..book.n_genes() {
        for b in (a + 1)..book.n_genes() {
            let dot: f32 = book
                .gene_code(a)
                .iter()
                .zip(book.gene_code(b))
                .map(|(x, y)| x * y)
                .sum();
            if best.map_or(true, |(_, _, d)| dot > d) {
                best = Some((a, b, dot));
            }
        }
    }
    if let Some((a, b, dot)) = best {
        let names = book.gene_names();
        println!(
            "  most similar pair: {} / {} (dot product {:.3})",
            names[a], names[b], dot
        );
    }
    Ok(())
}
