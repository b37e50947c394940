// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::path::PathBuf;

use clap::Parser;
use sandkern_daemon::{boot, console, settings, DaemonConfig};
use sandkern_logging::CliLoggingArgs;
use tokio::io::BufReader;
use tokio::sync::oneshot;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "sandkernd", version, about = "Boot a sandkern kernel on this terminal")]
struct Args {
    /// TOML settings file (default: <config dir>/sandkern/config.toml if present)
    #[arg(long, env = "SANDKERN_CONFIG")]
    config: Option<PathBuf>,

    /// Executable to run as the root process
    #[arg(long)]
    init: Option<String>,

    /// Seconds a new process has to complete its handshake
    #[arg(long)]
    handshake_timeout_secs: Option<u64>,

    /// Print the effective settings as TOML and exit
    #[arg(long)]
    print_config: bool,

    #[command(flatten)]
    logging: CliLoggingArgs,
}

impl Args {
    fn apply(&self, config: &mut DaemonConfig) {
        if let Some(init) = &self.init {
            config.init = init.clone();
        }
        if let Some(secs) = self.handshake_timeout_secs {
            config.kernel.handshake_timeout_secs = secs;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    args.logging.clone().init("sandkernd")?;

    let mut config = settings::load(args.config.as_deref())?;
    args.apply(&mut config);
    if args.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let mut system = boot(&config).await?;
    let (shutdown, stop) = oneshot::channel();
    let broker = system.serve(stop)?;

    let vfs = system.kernel.vfs().clone();
    let output = tokio::spawn(console::pump_output(
        vfs.clone(),
        system.console.output,
        tokio::io::stdout(),
    ));
    let input = tokio::spawn(console::pump_input(
        vfs,
        system.console.input,
        BufReader::new(tokio::io::stdin()),
    ));

    system.start_init(&config.init).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
        finished = input => match finished {
            Ok(Ok(())) => info!("console input closed"),
            Ok(Err(err)) => warn!(error = %err, "console input failed"),
            Err(err) => warn!(error = %err, "console input task panicked"),
        },
    }

    shutdown.send(()).ok();
    broker.await?;
    output.abort();
    info!(
        processes = system.kernel.processes().all_processes().len(),
        "sandkernd stopped"
    );
    // a blocking stdin read cannot be cancelled and would hold up runtime shutdown
    std::process::exit(0)
}
