use anyhow::{ensure, Context, Result};
use ballpit::{BodyId, Orchestrator, PositionFeed, SimulationConfig};
use clap::Parser;
use log::{info, LevelFilter};
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use nalgebra::Vector2;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

/// Runs the bouncing-body simulation headless for a while, then shuts it down.
#[derive(Parser, Debug)]
struct Args {
    /// YAML simulation config; defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short = 'n', long, default_value_t = 10)]
    bodies: usize,

    #[arg(short, long, default_value_t = 5.0)]
    seconds: f64,

    /// Overrides `log.path` from the config.
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[arg(long)]
    arena_size: Option<f64>,

    /// Also write diagnostics (not events) to this file.
    #[arg(long)]
    diag_log: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

const LOG_PATTERN: &str = "{d(%H:%M:%S%.3f)} {h({l:5})} [{T}] {t} - {m}{n}";

fn init_logging(args: &Args) -> Result<()> {
    let stdout = ConsoleAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build();
    let mut config = Config::builder().appender(Appender::builder().build("stdout", Box::new(stdout)));
    let mut root = Root::builder().appender("stdout");
    if let Some(path) = &args.diag_log {
        let file = FileAppender::builder()
            .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
            .build(path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        config = config.appender(Appender::builder().build("file", Box::new(file)));
        root = root.appender("file");
    }
    let level = if args.verbose { LevelFilter::Debug } else { LevelFilter::Info };
    log4rs::init_config(config.build(root.build(level))?)?;
    Ok(())
}

const POLL_INTERVAL: Duration = Duration::from_millis(100);

struct FeedSummary {
    id: BodyId,
    feed: PositionFeed,
    updates: u64,
    last: Vector2<f64>,
}

impl FeedSummary {
    fn drain(&mut self) {
        for position in self.feed.try_iter() {
            self.updates += 1;
            self.last = position;
        }
    }
}

fn load_config(args: &Args) -> Result<SimulationConfig> {
    let mut config = match &args.config {
        Some(path) => SimulationConfig::from_yaml_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => SimulationConfig::default(),
    };
    if let Some(path) = &args.log_file {
        config.log.path = Some(path.clone());
    }
    if let Some(size) = args.arena_size {
        config.arena_size = size;
    }
    Ok(config)
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;
    ensure!(
        args.seconds.is_finite() && args.seconds >= 0.,
        "--seconds must be a non-negative number"
    );

    let orchestrator = Orchestrator::new(load_config(&args)?)?;
    let mut feeds = Vec::new();
    orchestrator.start(args.bodies, |position, body| {
        info!(
            "{} starts at ({:.1}, {:.1})",
            body.id(),
            position.x,
            position.y
        );
        feeds.push(FeedSummary {
            id: body.id(),
            feed: body.subscribe(),
            updates: 0,
            last: position,
        });
    })?;

    // Keep reading while the simulation runs so no feed sits full.
    let deadline = Instant::now() + Duration::from_secs_f64(args.seconds);
    loop {
        for summary in &mut feeds {
            summary.drain();
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(POLL_INTERVAL.min(deadline - now));
    }
    orchestrator.shutdown()?;

    for mut summary in feeds {
        summary.drain();
        info!(
            "{}: {} updates, last at ({:.1}, {:.1})",
            summary.id, summary.updates, summary.last.x, summary.last.y
        );
    }
    let dropped = orchestrator.logger().dropped();
    if dropped > 0 {
        info!("{dropped} events dropped by the event log");
    }
    Ok(())
}
