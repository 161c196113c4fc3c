use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use clap::Parser;

#[derive(Parser, Debug)]
struct Cli {
    /// Working directory, with config and data files.
    #[clap(short, long, default_value = "data")]
    dir: PathBuf,

    #[clap(subcommand)]
    cmd: Cmd,
}

#[derive(clap::Subcommand, Debug)]
enum Cmd {
    /// Run the aggregation service.
    Server,
    /// Run the privileged delivery relay over stdio.
    Relay,
    /// Mint an extension bearer token for local use.
    Jwt { uid: String, ttl_days: f64 },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    human_panic_setup();
    let cli = Cli::parse();
    set_current_dir(&cli.dir)?;
    co2ounter::tracing::init()?;
    tracing::debug!(?cli, "Starting.");
    match &cli.cmd {
        Cmd::Server => co2ounter::server::run().await,
        Cmd::Relay => co2ounter::relay::run().await,
        Cmd::Jwt { uid, ttl_days } => {
            let conf = co2ounter::conf::global();
            let ttl =
                Duration::from_secs_f64(ttl_days * 24.0 * 60.0 * 60.0);
            let claims = co2ounter::auth::Claims::extension(
                uid, None, ttl, &conf.jwt,
            )?;
            let encoded: String = claims.to_str(&conf.jwt)?;
            println!("{encoded}");
            Ok(())
        }
    }
}

fn set_current_dir(path: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(path)
        .context(format!("Failed to create directory path: {path:?}"))?;
    env::set_current_dir(path)
        .context(format!("Failed to set current directory to {path:?}"))?;
    Ok(())
}

fn human_panic_setup() {
    macro_rules! repo {
        () => {
            env!("CARGO_PKG_REPOSITORY")
        };
    }
    human_panic::setup_panic!(human_panic::Metadata::new(
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    )
    .authors(env!("CARGO_PKG_AUTHORS"))
    .homepage(repo!())
    .support(concat!("- Submit an issue at ", repo!(), "/issues")));
}
