use std::{path::PathBuf, time::Duration};

use clap::Parser;
use locshare::{geo::Fix, init_log, load_env_vars, tasks};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Replay the track points of a GPX file as the local position
    #[arg(short, long, action = clap::ArgAction::Set)]
    gpx: Option<PathBuf>,

    /// Stationary local position as `lat,lng`
    #[arg(short, long, action = clap::ArgAction::Set, conflicts_with = "gpx")]
    position: Option<Fix>,

    /// Milliseconds between two reported positions
    #[arg(long, default_value_t = 5_000, value_parser = clap::value_parser!(u64).range(1..))]
    period_ms: u64,

    /// Start sharing right away
    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    share: bool,

    /// Turn debugging information on
    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    debug: bool,
}

macro_rules! print_err_and_exit {
    () => {
        |e| {
            log::error!("{e}");
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    if cli.debug && std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "debug");
    }
    init_log();

    let env = load_env_vars().unwrap_or_else(print_err_and_exit!());
    log::info!(
        "Sharing as `{}` through {}",
        env.participant_id,
        env.backend_url
    );

    let opts = tasks::Options {
        gpx: cli.gpx,
        position: cli.position,
        period: Duration::from_millis(cli.period_ms),
        share: cli.share,
    };

    tasks::run(&env, opts).await
}
