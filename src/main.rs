use std::{error::Error, path::PathBuf, process, sync::Arc};

use clap::{command, Parser, Subcommand, ValueHint};
use log::{debug, error, info, warn, LevelFilter};

use tgmusic::{api::ApiData, config::Config, http::Client, track::Track};

/// Profile to display when not built in release mode.
#[cfg(debug_assertions)]
const BUILD_PROFILE: &str = "debug";
/// Profile to display when not built release mode.
#[cfg(not(debug_assertions))]
const BUILD_PROFILE: &str = "release";

/// Group name for mutually exclusive logging options.
const ARGS_GROUP_LOGGING: &str = "logging";

/// Command line arguments as parsed by `clap`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file
    ///
    /// Keep this file private when it contains an API key. Without the file
    /// built-in defaults are used and the legacy API is disabled.
    #[arg(short, long, value_name = "FILE", value_hint = ValueHint::FilePath, default_value_t = String::from("config.toml"))]
    config: String,

    /// Directory for downloaded files
    ///
    /// [default: from configuration]
    #[arg(short, long, value_name = "DIR", value_hint = ValueHint::DirPath)]
    downloads_dir: Option<PathBuf>,

    /// Suppresses all output except warnings and errors.
    #[arg(short, long, default_value_t = false, group = ARGS_GROUP_LOGGING)]
    quiet: bool,

    /// Enable verbose logging
    ///
    /// Specify twice for trace logging.
    #[arg(short, long, action = clap::ArgAction::Count, group = ARGS_GROUP_LOGGING)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Subcommand)]
enum Command {
    /// Search for tracks by text or platform URL
    Search { query: String },

    /// Look up the tracks behind a platform URL
    Info {
        #[arg(value_hint = ValueHint::Url)]
        url: String,
    },

    /// Show the details of a single track
    Track { id: String },

    /// Show recommended tracks
    Recommend {
        #[arg(short, long, default_value_t = ApiData::<Client>::DEFAULT_RECOMMENDATIONS)]
        limit: usize,
    },

    /// Download the first track found for a query or URL
    Download { query: String },
}

/// Initializes the logger facade.
///
/// The logging level is determined as follows, in order of precedence from
/// highest to lowest:
/// 1. Command line arguments
/// 2. `RUST_LOG` environment variable
/// 3. Hard coded default
///
/// # Panics
///
/// Panics when a logger facade is already initialized.
fn init_logger(config: &Args) {
    let mut logger = env_logger::Builder::from_env(
        // Note: if you change the default logging level here, then you should
        // probably also change the verbosity levels below.
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    if config.quiet || config.verbose > 0 {
        let level = match config.verbose {
            0 => {
                // Quiet and verbose are mutually exclusive, and `verbose` is 0
                // by default. So this arm means: quiet mode.
                LevelFilter::Warn
            }
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        // Filter log messages of external crates.
        logger.filter_module(module_path!(), level);
    }

    logger.init();
}

/// Loads the configuration, falling back to defaults when the file does
/// not exist.
fn load_config(path: &str) -> Result<Config, Box<dyn Error>> {
    match Config::from_file(path) {
        Ok(config) => Ok(config),
        Err(e) if e.kind == tgmusic::error::ErrorKind::NotFound => {
            warn!("{path} not found, using defaults");
            Ok(Config::default())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_tracks(tracks: &[Track]) {
    for track in tracks {
        println!("{} [{}] {}", track.platform, track.id, track.name);
        if !track.artist.is_empty() {
            println!("    by {}", track.artist);
        }
    }
}

/// Runs one subcommand to completion.
async fn run(args: Args) -> Result<(), Box<dyn Error>> {
    let mut config = load_config(&args.config)?;
    if let Some(downloads_dir) = args.downloads_dir {
        config.downloads_dir = downloads_dir;
    }
    debug!("{config:#?}");

    let client = Arc::new(Client::new(&config)?);
    let api = ApiData::new(client, config);

    match args.command {
        Command::Search { query } => print_tracks(&api.search(&query).await?),
        Command::Info { url } => print_tracks(&api.get_info(&url).await?),
        Command::Track { id } => {
            let track = api.get_track(&id).await?;
            println!("{track}");
            println!("{track:#?}");
        }
        Command::Recommend { limit } => print_tracks(&api.recommendations(limit).await?),
        Command::Download { query } => {
            let tracks = api.search(&query).await?;
            let track = tracks
                .into_iter()
                .find(Track::is_downloadable)
                .ok_or("no downloadable track found")?;
            info!("downloading {track}");

            let downloaded = api.download_track(track).await?;
            for path in downloaded.paths() {
                println!("{}", path.display());
            }
        }
    }

    Ok(())
}

/// Main entry point of the application.
///
/// This function initializes the logger facade, parses the command line
/// arguments, and runs the requested command until it completes or is
/// interrupted.
#[tokio::main]
async fn main() {
    // `clap` handles our command line arguments and help text.
    let args = Args::parse();
    init_logger(&args);

    // Dump command line arguments before we do anything more.
    // This aids in debugging of whatever comes next.
    debug!("Command {:#?}", args);

    let cmd = command!();
    let name = cmd.get_name().to_string();
    let version = cmd.get_version().unwrap_or("UNKNOWN").to_string();

    info!("starting {name}/{version}; {BUILD_PROFILE}");

    let result = tokio::select! {
        // Prioritize shutdown signals.
        biased;

        _ = tokio::signal::ctrl_c() => {
            info!("shutting down gracefully");
            Ok(())
        }

        result = run(args) => result,
    };

    if let Err(e) = result {
        error!("{e}");
        process::exit(1);
    }
}
