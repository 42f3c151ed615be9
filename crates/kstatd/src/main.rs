//! kstatd - kernel statistics collector daemon.
//!
//! Loads a kstat schema, scrapes the configured kstats at a fixed interval
//! and logs what each scrape produced. `--once` prints the samples of a
//! single scrape to stdout instead.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;
#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use clap::Parser;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[cfg(not(any(target_os = "illumos", target_os = "solaris")))]
use kstat_core::collector::MockKstat;
#[cfg(any(target_os = "illumos", target_os = "solaris"))]
use kstat_core::collector::RealKstat;
use kstat_core::collector::{CollectorRegistry, Gathered, KstatCollector};
use kstat_core::schema::Schema;

/// Kernel statistics collector daemon.
#[derive(Parser)]
#[command(name = "kstatd", about = "Kernel statistics collector daemon", version)]
struct Args {
    /// Path to the kstat schema.
    #[arg(short, long, default_value = "config/kstat.yml")]
    config: PathBuf,

    /// Scrape interval in seconds.
    #[arg(short, long, default_value = "15", value_parser = clap::value_parser!(u64).range(1..))]
    interval: u64,

    /// Prefix of every metric name.
    #[arg(long, default_value = kstat_core::collector::DEFAULT_NAMESPACE)]
    namespace: String,

    /// Scrape once, print the samples and exit.
    #[arg(long)]
    once: bool,

    /// Increase logging verbosity (-v for debug, -vv for trace). Default is info level.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long)]
    quiet: bool,
}

/// Initializes the tracing subscriber with the appropriate log level.
/// Default level is INFO. Use -q for quiet mode (errors only).
fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        Level::ERROR
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let mut filter = EnvFilter::from_default_env();
    for target in ["kstatd", "kstat_core"] {
        if let Ok(directive) = format!("{}={}", target, level).parse() {
            filter = filter.add_directive(directive);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Describes the result of a gather for logging.
fn describe_gathered(gathered: &Gathered) -> String {
    gathered
        .outcomes
        .iter()
        .map(|o| match &o.error {
            None => format!("{} ok in {:.1}ms", o.name, o.duration.as_secs_f64() * 1000.0),
            Some(e) => format!("{} failed ({})", o.name, e),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Writes samples as `name{label="value"} value` lines.
fn print_samples(out: &mut impl Write, gathered: &Gathered) -> std::io::Result<()> {
    for sample in &gathered.samples {
        writeln!(out, "{}", sample)?;
    }
    out.flush()
}

fn build_registry(args: &Args, schema: &Schema) -> CollectorRegistry {
    #[cfg(any(target_os = "illumos", target_os = "solaris"))]
    let source = RealKstat::new();
    #[cfg(not(any(target_os = "illumos", target_os = "solaris")))]
    let source = {
        warn!("kstat is not available on this platform, using the built-in mock system");
        MockKstat::typical_system()
    };

    let mut registry = CollectorRegistry::new(&args.namespace);
    if let Err(e) = registry.register(Box::new(KstatCollector::new(
        source,
        schema,
        args.namespace.as_str(),
    ))) {
        warn!("{}", e);
    }
    registry
}

fn main() -> ExitCode {
    let args = Args::parse();

    init_logging(args.verbose, args.quiet);

    info!("kstatd {} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Config: schema={}, interval={}s, namespace={}",
        args.config.display(),
        args.interval,
        args.namespace
    );

    let schema = match Schema::load(&args.config) {
        Ok(schema) => schema,
        Err(e) => {
            error!("{}: {}", args.config.display(), e);
            return ExitCode::FAILURE;
        }
    };
    info!(
        "Schema: {} modules, {} counters",
        schema.modules.len(),
        schema.counter_count()
    );

    let registry = build_registry(&args, &schema);
    if registry.is_empty() {
        error!("No collectors registered");
        return ExitCode::FAILURE;
    }
    info!("{} collector(s) registered", registry.len());

    if args.once {
        let gathered = registry.gather();
        info!("{}", describe_gathered(&gathered));
        if let Err(e) = print_samples(&mut std::io::stdout().lock(), &gathered) {
            error!("Failed to write samples: {}", e);
            return ExitCode::FAILURE;
        }
        return if gathered.outcomes.iter().all(|o| o.succeeded()) {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        };
    }

    let interval = Duration::from_secs(args.interval);

    // Setup graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    }) {
        warn!("Failed to set Ctrl-C handler: {}", e);
    }

    info!("Starting collection loop");
    let mut scrape_count: u64 = 0;

    while running.load(Ordering::SeqCst) {
        let gathered = registry.gather();
        scrape_count += 1;

        info!(
            "Scrape #{} at {}: {} samples, {}",
            scrape_count,
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            gathered.samples.len(),
            describe_gathered(&gathered)
        );
        for sample in &gathered.samples {
            debug!("{}", sample);
        }

        // Sleep with periodic checks for shutdown signal
        let sleep_interval = Duration::from_millis(100);
        let mut remaining = interval;
        while remaining > Duration::ZERO && running.load(Ordering::SeqCst) {
            let sleep_time = remaining.min(sleep_interval);
            std::thread::sleep(sleep_time);
            remaining = remaining.saturating_sub(sleep_time);
        }
    }

    info!("Shutdown complete");
    ExitCode::SUCCESS
}
