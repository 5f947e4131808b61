use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Result};
use clap::Parser;
use tracing::Level;

use berthd::{serve, HookSettings};

/// Push-event listener that rebuilds the dashboard, one build at a time.
#[derive(Parser, Debug)]
#[command(name = "berthd", version, about)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "BERTHD_BIND", default_value = "0.0.0.0:9000")]
    bind: SocketAddr,

    /// Shared secret used to sign deliveries
    #[arg(long, env = "BERTH_HOOK_SECRET", hide_env_values = true)]
    secret: String,

    /// Ref whose pushes trigger a build
    #[arg(long = "ref", env = "BERTHD_REF", default_value = "refs/heads/main")]
    git_ref: String,

    /// Build script to run
    #[arg(
        long,
        env = "BERTHD_SCRIPT",
        default_value = "/usr/local/bin/berth-rebuild-dashboard"
    )]
    script: PathBuf,

    /// Lock file guarding the build
    #[arg(long, env = "BERTHD_LOCK", default_value = "/var/lib/berth/hook.lock")]
    lock: PathBuf,

    /// Age after which a leftover lock is broken
    #[arg(long, env = "BERTHD_STALE_AFTER_SECS", default_value_t = 3600)]
    stale_after_secs: u64,

    /// Emit logs as JSON
    #[arg(long, env = "BERTHD_JSON_LOGS")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    berth_core::init_tracing(args.json_logs, Level::INFO);

    if !berth_core::is_well_formed_secret(&args.secret) {
        bail!("--secret must be at least 32 characters of [A-Za-z0-9_-]");
    }
    if !args.script.exists() {
        tracing::warn!(script = %args.script.display(), "build script does not exist yet");
    }

    serve(
        HookSettings {
            secret: args.secret,
            git_ref: args.git_ref,
            script: args.script,
            lock: args.lock,
            stale_after: Duration::from_secs(args.stale_after_secs),
        },
        args.bind,
    )
    .await
}
