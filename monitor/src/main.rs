use anyhow::{bail, Context, Result};
use chrono::{DateTime, Local};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use trainwatch::{
    collector::LinuxProcessCollector,
    config::{Config, FlushMode},
    controller::{ControllerSettings, SamplingController},
    export::{self, ExportFormat},
    history::{Database, HistorySink},
    locator::{Discovery, Locate, ManualLocator, ProcessLocator},
    sampler::ProcSampler,
    session::SessionState,
    sink::{ConsoleSink, Fanout, FileSink},
    socket::{FeedHandler, FeedSink, SocketServer},
};

#[derive(Parser)]
#[command(name = "trainwatch", version, about = "Log CPU and memory usage of a training process")]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Wait for a training process and log its resource usage
    Watch(WatchArgs),
    /// Run one discovery pass and print the target, if any
    Locate,
    /// Print the effective configuration
    Config {
        /// Write the default configuration to the config path
        #[arg(long)]
        init: bool,
        /// Overwrite an existing file with --init
        #[arg(long, requires = "init")]
        force: bool,
    },
    /// List recorded sessions or export one
    History {
        #[arg(long, default_value_t = 20)]
        limit: u32,
        /// Session to export
        #[arg(long, requires = "export_target")]
        session: Option<i64>,
        /// Destination CSV file for --session
        #[arg(long, value_name = "FILE", group = "export_target", requires = "session")]
        csv: Option<PathBuf>,
        /// Destination Excel file for --session
        #[arg(long, value_name = "FILE", group = "export_target", requires = "session")]
        xlsx: Option<PathBuf>,
        /// Delete sessions started more than DAYS days ago
        #[arg(long, value_name = "DAYS")]
        prune: Option<u32>,
    },
}

#[derive(Args, Default)]
struct WatchArgs {
    /// Sampling rate in seconds (0.1 to 10.0)
    #[arg(long)]
    rate: Option<f64>,
    #[arg(long, value_enum)]
    mode: Option<FlushMode>,
    /// Attach to this PID instead of discovering a target
    #[arg(long)]
    pid: Option<u32>,
    /// Keep waiting for new training processes after each one finishes
    #[arg(long)]
    rearm: bool,
    /// Hand-off marker file to watch for
    #[arg(long)]
    marker: Option<PathBuf>,
    /// Write a CSV file per finished session into the export directory
    #[arg(long)]
    csv: bool,
    /// Write an Excel workbook per finished session into the export directory
    #[arg(long)]
    xlsx: bool,
    /// Export directory (implies --csv unless --xlsx is given)
    #[arg(long, alias = "csv-dir", value_name = "DIR")]
    export_dir: Option<PathBuf>,
    /// Record sessions in the history database
    #[arg(long)]
    history: bool,
    /// Serve a live JSON feed on a Unix socket
    #[arg(long)]
    feed: bool,
}

fn load_config(path: Option<&Path>) -> Config {
    let config_path = path.map(Path::to_path_buf).unwrap_or_else(Config::config_path);
    if config_path.exists() {
        Config::load(&config_path).unwrap_or_else(|e| {
            warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        })
    } else {
        info!("No config file found, using defaults");
        Config::default()
    }
}

async fn watch(mut config: Config, args: WatchArgs) -> Result<()> {
    if let Some(rate) = args.rate {
        config.sampling.rate_seconds = rate;
    }
    if let Some(mode) = args.mode {
        config.flush.mode = mode;
    }
    if let Some(marker) = args.marker {
        config.discovery.marker_path = marker;
    }
    config.general.rearm |= args.rearm;
    let settings = ControllerSettings::try_from(&config)?;
    let rearm = settings.rearm;
    let auto_detect = settings.auto_detect;

    let mut sinks = Fanout::new().with(ConsoleSink::stdout());
    let export_dir = args.export_dir.clone().unwrap_or_else(|| config.export.directory.clone());
    if args.csv || (args.export_dir.is_some() && !args.xlsx) {
        sinks.push(Box::new(FileSink::csv(&export_dir)));
    }
    if args.xlsx {
        sinks.push(Box::new(FileSink::xlsx(&export_dir)));
    }
    if args.history {
        let db = Database::open_default().context("opening history database")?;
        db.init_schema()?;
        sinks.push(Box::new(HistorySink::new(db)));
    }
    let feed_server = if args.feed {
        let server = SocketServer::bind(&SocketServer::socket_path()).await?;
        sinks.push(Box::new(FeedSink::new(server.broadcast_sender())));
        Some(server)
    } else {
        None
    };

    let locator: Box<dyn Locate> = match args.pid {
        Some(pid) => Box::new(ManualLocator::new(LinuxProcessCollector::new(), pid)),
        None => Box::new(ProcessLocator::new(LinuxProcessCollector::new(), &config.discovery)),
    };
    let sampler = ProcSampler::new(LinuxProcessCollector::new());

    let (controller, handle) = SamplingController::new(settings, locator, sampler, sinks);
    let task = tokio::spawn(controller.run());

    if let Some(server) = feed_server {
        let handler = Arc::new(FeedHandler::new(handle.subscribe()));
        tokio::spawn(server.serve(handler));
    }
    if !auto_detect {
        handle.start().await?;
    }

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupted, finishing up");
        }
        result = handle.wait_for(|s| s.state == SessionState::Finished), if !rearm => {
            result?;
        }
    }

    if handle.shutdown().await.is_err() {
        warn!("Controller already stopped");
    }
    let session = task.await.context("controller task failed")?;
    info!("Session ended with {} rows", session.row_count());
    Ok(())
}

fn locate(config: &Config) -> Result<()> {
    let mut locator = ProcessLocator::new(LinuxProcessCollector::new(), &config.discovery);
    match locator.acquire() {
        Discovery::Found(target) => {
            println!("pid:    {}", target.pid);
            println!("origin: {}", target.origin);
            println!("label:  {}", target.label);
            Ok(())
        }
        Discovery::NotFound { skipped } => {
            bail!("no training process found ({} processes could not be read)", skipped)
        }
    }
}

fn show_config(config: &Config, path: Option<&Path>, init: bool, force: bool) -> Result<()> {
    if init {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Config::config_path);
        if path.exists() && !force {
            bail!("{} already exists (use --force to overwrite)", path.display());
        }
        Config::default().save(&path)?;
        println!("Wrote default config to {}", path.display());
        return Ok(());
    }
    config.validate()?;
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

fn history(limit: u32, session: Option<i64>, target: Option<(ExportFormat, PathBuf)>, prune: Option<u32>) -> Result<()> {
    let db = Database::open_default().context("opening history database")?;
    db.init_schema()?;

    if let Some(days) = prune {
        let removed = db.cleanup_old_sessions(days)?;
        info!("Pruned {} sessions older than {} days", removed, days);
    }

    if let (Some(id), Some((format, path))) = (session, target) {
        let Some(record) = db.get_session(id)? else {
            bail!("no session with id {}", id);
        };
        let rows = db.session_rows(id)?;
        export::write_file(&path, format, &rows, &record.label)?;
        println!("Saved {} rows to {}", rows.len(), path.display());
        return Ok(());
    }

    println!("{:<6} {:<20} {:<8} Source", "ID", "Started", "Rows");
    for record in db.list_sessions(limit)? {
        let started = DateTime::from_timestamp(record.started_at, 0)
            .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "?".to_string());
        let rows = if record.finished_at.is_some() {
            record.row_count.to_string()
        } else {
            format!("{}*", record.row_count)
        };
        println!("{:<6} {:<20} {:<8} {}", record.id, started, rows, record.label);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());

    match cli.command.unwrap_or(Commands::Watch(WatchArgs::default())) {
        Commands::Watch(args) => watch(config, args).await,
        Commands::Locate => locate(&config),
        Commands::Config { init, force } => show_config(&config, cli.config.as_deref(), init, force),
        Commands::History { limit, session, csv, xlsx, prune } => {
            let target = csv.map(|p| (ExportFormat::Csv, p)).or(xlsx.map(|p| (ExportFormat::Xlsx, p)));
            history(limit, session, target, prune)
        }
    }
}
