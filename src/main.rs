use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use jailwrap::config::Config;
use jailwrap::sandbox::{
    self, detect_capabilities, run_sandboxed, wrap_command_with_sandbox_freebsd,
};

/// jailwrap -- run shell commands inside throwaway FreeBSD jails.
#[derive(Parser, Debug)]
#[command(name = "jailwrap", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report whether jail sandboxing is available on this host
    Check {
        /// Print capabilities as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the wrapper script for a command without running it
    Wrap {
        /// Isolate the network and route traffic through the bridge sockets
        #[arg(long)]
        network: bool,

        /// Apply the [filesystem] policy from the config file
        #[arg(long)]
        filesystem: bool,

        /// Host-side socket of a running HTTP bridge
        #[arg(long, requires = "network")]
        http_socket: Option<PathBuf>,

        /// Host-side socket of a running SOCKS bridge
        #[arg(long, requires = "network")]
        socks_socket: Option<PathBuf>,

        /// Command to wrap; a single argument is taken as a shell string
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Run a command under the configured policy and print its output
    Run {
        /// Timeout in seconds (capped by sandbox.timeout_secs)
        #[arg(long)]
        timeout: Option<u64>,

        /// Command to run; a single argument is taken as a shell string
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Read or change config values
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Print a value by dotted key (e.g. network.restricted)
    Get { key: String },

    /// Set a value by dotted key and save the config file
    Set { key: String, value: String },

    /// Print the config file location
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Check { json } => {
            let caps = detect_capabilities();
            if json {
                println!("{}", serde_json::to_string_pretty(&caps)?);
            } else {
                for line in caps.status_lines() {
                    println!("{}", line);
                }
            }
            if !caps.is_available() {
                std::process::exit(1);
            }
        }
        Commands::Wrap {
            network,
            filesystem,
            http_socket,
            socks_socket,
            command,
        } => {
            let cwd = std::env::current_dir()?;
            config.sandbox.enabled = true;
            config.filesystem.restricted = filesystem;
            let mut params = sandbox::executor::sandbox_params(&shell_command(&command), &config, &cwd);
            params.has_network_restrictions = network;
            params.http_socket_path = http_socket;
            params.socks_socket_path = socks_socket;

            println!("{}", wrap_command_with_sandbox_freebsd(&params)?);
        }
        Commands::Run { timeout, command } => {
            let timeout_ms = timeout
                .unwrap_or(config.sandbox.timeout_secs)
                .saturating_mul(1000);
            let (output, code) = run_sandboxed(&shell_command(&command), &config, timeout_ms).await?;
            print!("{}", output);
            std::process::exit(code);
        }
        Commands::Config { action } => match action {
            ConfigCommands::Get { key } => println!("{}", config.get_value(&key)?),
            ConfigCommands::Set { key, value } => {
                config.set_value(&key, &value)?;
                config.save()?;
            }
            ConfigCommands::Path => println!("{}", Config::config_path()?.display()),
        },
    }

    Ok(())
}

/// One argument is already a shell string; several are quoted into one.
fn shell_command(args: &[String]) -> String {
    match args {
        [single] => single.clone(),
        _ => sandbox::quote::quote_args(args),
    }
}
