pub mod client;
pub mod daemon_path;
pub mod process;
pub mod report;

use std::{env, net::SocketAddr, path::PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use daemon_path::to_daemon_path;
use process::{kill_running_daemons, restart_daemon};
use report::{
    process_analytics_command, process_goals_command, process_reset_command,
    process_sites_command, GoalUpdates,
};
use tracing::level_filters::LevelFilter;

use crate::{
    daemon::start_daemon,
    protocol::default_listen_addr,
    utils::{
        dir::create_application_default_path,
        logging::{enable_logging, CLI_PREFIX},
    },
};

#[derive(Parser, Debug)]
#[command(name = "Tabtally", version, long_about = None)]
#[command(about = "Daemon and cli for tracking time spent on websites", long_about = None)]
struct Args {
    #[command(subcommand)]
    commands: Commands,
    #[arg(long, help = "Enable logging")]
    log: bool,
}

#[derive(Subcommand, Debug)]
#[command(version, about, long_about = None)]
enum Commands {
    #[command(about = "Starts a daemon for the application")]
    Init {
        #[arg(
            long,
            help = "Application directory. By default tries to save into $XDG_STATE_HOME or $HOME/.local/state"
        )]
        dir: Option<PathBuf>,
        #[arg(long, help = "Address the daemon listens on. Defaults to 127.0.0.1:17788")]
        listen: Option<SocketAddr>,
    },
    #[command(
        about = "Run a daemon directly in current console. Used for creating a daemon internally and for debugging"
    )]
    Serve {
        #[arg(
            long,
            help = "Application directory. By default tries to save into $XDG_STATE_HOME or $HOME/.local/state"
        )]
        dir: Option<PathBuf>,
        #[arg(long, help = "Address the daemon listens on. Defaults to 127.0.0.1:17788")]
        listen: Option<SocketAddr>,
    },
    #[command(about = "Stop currently running daemon.")]
    Stop {},
    #[command(about = "Display time spent on each website, most used first")]
    Sites {
        #[arg(long, help = "Address of the daemon. Defaults to 127.0.0.1:17788")]
        listen: Option<SocketAddr>,
    },
    #[command(about = "Display productivity analytics: score, totals, top sites and goal progress")]
    Analytics {
        #[arg(long, help = "Address of the daemon. Defaults to 127.0.0.1:17788")]
        listen: Option<SocketAddr>,
        #[arg(long, help = "Application directory holding goals and timer stats")]
        dir: Option<PathBuf>,
    },
    #[command(about = "Show or update productivity goals")]
    Goals {
        #[arg(long, help = "Application directory holding goals")]
        dir: Option<PathBuf>,
        #[command(flatten)]
        updates: GoalUpdates,
    },
    #[command(about = "Clear all accumulated browsing time")]
    Reset {
        #[arg(long, help = "Address of the daemon. Defaults to 127.0.0.1:17788")]
        listen: Option<SocketAddr>,
    },
}

pub async fn run_cli() -> Result<()> {
    let args = Args::parse();

    let logging_level = if args.log {
        Some(LevelFilter::TRACE)
    } else {
        None
    };
    enable_logging(
        CLI_PREFIX,
        &create_application_default_path()?,
        logging_level,
        args.log,
    )?;

    match args.commands {
        Commands::Init { dir, listen } => {
            let daemon = to_daemon_path(env::current_exe().expect("Can't operate without an executable"));
            restart_daemon(&daemon, dir.as_deref(), listen)?;
            Ok(())
        }
        Commands::Stop {} => {
            let daemon = to_daemon_path(env::current_exe().unwrap());
            kill_running_daemons(&daemon);
            Ok(())
        }
        Commands::Serve { dir, listen } => {
            let dir = dir.map_or_else(create_application_default_path, Ok)?;
            start_daemon(dir, listen.unwrap_or_else(default_listen_addr)).await?;
            Ok(())
        }
        Commands::Sites { listen } => {
            process_sites_command(listen.unwrap_or_else(default_listen_addr)).await
        }
        Commands::Analytics { listen, dir } => {
            let dir = dir.map_or_else(create_application_default_path, Ok)?;
            process_analytics_command(listen.unwrap_or_else(default_listen_addr), &dir).await
        }
        Commands::Goals { dir, updates } => {
            let dir = dir.map_or_else(create_application_default_path, Ok)?;
            process_goals_command(&dir, updates).await
        }
        Commands::Reset { listen } => {
            process_reset_command(listen.unwrap_or_else(default_listen_addr)).await
        }
    }
}
