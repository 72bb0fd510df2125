use clap::{Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use variant_forge::imaging::{Dimensions, ImageBackend, Mode, Quality, RustBackend};
use variant_forge::processor::Processor;
use variant_forge::request::{self, SkipFormats, VariantRequest};
use variant_forge::{config, output, server};

#[derive(Parser)]
#[command(name = "variant-forge")]
#[command(about = "On-the-fly image variant server")]
#[command(long_about = "\
On-the-fly image variant server

Requests under /processed/ name an original plus the variant wanted:

  /processed/images/photo.w800h400m1q75.jpg
             └────┬─────┘ └────┬────┘ └┬┘
             original     w h m q     format

  w, h   target width/height (either may be omitted; the other side
         follows the original's aspect ratio)
  m      0 = cover (crop to fill, default), 1 = fit inside the box
  q      quality 1-100 (default 100)

The first request generates the variant plus AVIF and WebP siblings under
the cache root; later requests are served from disk. Append ?skipAvif=1 or
?skipWebP=1 to suppress a sibling.

Run 'variant-forge gen-config' to generate a documented config file.")]
#[command(version)]
struct Cli {
    /// Config file (missing file = stock defaults)
    #[arg(long, default_value = config::DEFAULT_CONFIG_FILE, global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Cover,
    Fit,
}

impl From<ModeArg> for Mode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Cover => Mode::Cover,
            ModeArg::Fit => Mode::Fit,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Serve /processed/ over HTTP
    Serve {
        /// Listen address (overrides server.bind)
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// Generate (or look up) one variant and report its artifacts
    Render {
        /// Variant URL, e.g. /processed/images/photo.w800.jpg?skipAvif=1
        url: String,
    },
    /// Print the variant URL for an original
    Url {
        /// Public path of the original, e.g. /images/photo.jpg
        original: String,
        #[arg(long, short = 'W', default_value_t = 0)]
        width: u32,
        #[arg(long, short = 'H', default_value_t = 0)]
        height: u32,
        #[arg(long, value_enum, default_value = "cover")]
        mode: ModeArg,
        #[arg(long, short, default_value_t = 100)]
        quality: u32,
        #[arg(long)]
        skip_webp: bool,
        #[arg(long)]
        skip_avif: bool,
        /// Print a 1x/2x srcset instead of a single URL
        #[arg(long)]
        srcset: bool,
    },
    /// Show file count and size of the variant cache
    Stats {
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },
    /// Delete every cached variant
    Purge,
    /// Print a stock config file with all options documented
    GenConfig,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing();

    let load = || config::load_config(&cli.config);

    match cli.command {
        Command::Serve { bind } => {
            let config = load()?;
            init_thread_pool(&config.processing);
            let addr = match bind {
                Some(addr) => addr,
                None => config.server.bind.parse()?,
            };
            let processor = Arc::new(Processor::from_config(&config)?);
            tracing::info!(
                public_root = %config.public_root.display(),
                cache_root = %config.cache_root.display(),
                "Starting server"
            );
            tokio::runtime::Runtime::new()?.block_on(server::serve(processor, addr))?;
        }
        Command::Render { url } => {
            let config = load()?;
            init_thread_pool(&config.processing);
            let processor = Processor::from_config(&config)?;
            let request = VariantRequest::parse_url(&url)?;
            let served = processor.handle(&request)?;
            let artifacts = processor.store().artifacts(&request);
            output::print_render_output(&request, &served, &artifacts);
        }
        Command::Url {
            original,
            width,
            height,
            mode,
            quality,
            skip_webp,
            skip_avif,
            srcset,
        } => {
            let config = load()?;
            let (width, height) = if width == 0 && height == 0 {
                natural_size(&config.public_root, &original)
                    .map_or((0, 0), |d| (d.width, d.height))
            } else {
                (width, height)
            };
            let quality = Quality::new(quality);
            if srcset {
                println!("{}", request::srcset(&original, width, height, mode.into(), quality));
            } else {
                let skip = SkipFormats {
                    webp: skip_webp,
                    avif: skip_avif,
                };
                println!(
                    "{}",
                    request::variant_url(&original, width, height, mode.into(), quality, skip)
                );
            }
        }
        Command::Stats { json } => {
            let config = load()?;
            let stats = variant_forge::store::VariantStore::new(&config.cache_root).stats()?;
            if json {
                println!("{}", output::format_stats_json(&stats)?);
            } else {
                output::print_stats_output(&config.cache_root, &stats);
            }
        }
        Command::Purge => {
            let config = load()?;
            let removed = variant_forge::store::VariantStore::new(&config.cache_root).purge()?;
            output::print_purge_output(&config.cache_root, &removed);
        }
        Command::GenConfig => {
            print!("{}", config::stock_config_toml());
        }
    }

    Ok(())
}

/// Log to stderr, filtered by `RUST_LOG` (default `info`).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Initialize the rayon thread pool based on processing config.
///
/// Caps at the number of available CPU cores; config can constrain down, not up.
fn init_thread_pool(processing: &config::ProcessingConfig) {
    let threads = config::effective_threads(processing);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok();
}

/// Natural size of an original, used when no target size is given.
fn natural_size(public_root: &std::path::Path, original: &str) -> Option<Dimensions> {
    let path = public_root.join(original.trim_start_matches('/'));
    RustBackend::new().identify(&path).ok()
}
