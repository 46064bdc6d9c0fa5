use anyhow::Context;
use clap::Parser;
use pg_apply::{Config, Replayer};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-apply")]
#[command(
    about = "Replays a logical replication stream through the row apply engine",
    long_about = None
)]
struct Args {
    /// Stream of JSON-lines messages; reads stdin when omitted
    #[arg(value_name = "STREAM")]
    input: Option<PathBuf>,

    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(short, long, help = "Print table contents after replay")]
    dump: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting pg-apply");

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {:?}", path);
            Config::from_file(path)
                .with_context(|| format!("failed to load configuration from {:?}", path))?
        }
        None => Config::default(),
    };

    info!(
        resolver = ?config.conflicts.resolver,
        multi_insert = config.apply.multi_insert,
        multi_insert_capacity = config.multi_insert_capacity(),
        node_origin = config.replay.node_origin,
        "Configuration summary"
    );

    let reader: Box<dyn BufRead> = match &args.input {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("failed to open stream {:?}", path))?,
        )),
        None => Box::new(BufReader::new(io::stdin())),
    };

    let mut replayer = Replayer::new(&config);
    let result = replayer.run(reader).cloned();

    let stats = match result {
        Ok(stats) => stats,
        Err(e) => {
            error!("Replay stopped: {}", e);
            return Err(e.into());
        }
    };

    println!("{}", serde_json::to_string_pretty(&stats)?);
    if args.dump {
        println!("{}", serde_json::to_string_pretty(&replayer.dump())?);
    }

    Ok(())
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_apply=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pg_apply=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(io::stderr)
            .boxed()
    };

    tracing_subscriber::registry().with(env_filter).with(fmt_layer).init();
}
