// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use tasktrail_core::IndexerConfig;
use tasktrail_indexer::{init_tracing, LogFormat};
use tasktrail_storage::{FileBackend, PersistenceBackend, RetryStore};

#[derive(Parser, Debug)]
#[command(author, version, about = "Tasktrail indexer operator tool", long_about = None)]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long, global = true, env = "TASKTRAIL_CONFIG")]
    config: Option<PathBuf>,

    /// Data directory of the file persistence backend (overrides config file)
    #[arg(long, global = true, env = "TASKTRAIL_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log output format: pretty or json
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Inspect or empty the durable retry queues
    Queues {
        #[command(subcommand)]
        action: QueuesAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Validate the configuration and print the effective values
    Check,
}

#[derive(Subcommand, Debug)]
enum QueuesAction {
    /// Print the size of the failed-bulk and overflow queues
    Stats,
    /// Drop every entry of both queues
    Reset {
        /// Required, the entries cannot be recovered
        #[arg(long)]
        yes: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let mut config = IndexerConfig::load(args.config).context("loading configuration")?;
    if let Some(data_dir) = args.data_dir {
        config.persistence.path = data_dir;
    }

    match args.command {
        Command::Config {
            action: ConfigAction::Check,
        } => {
            let rendered = toml::to_string_pretty(&config).context("rendering configuration")?;
            println!("{}", rendered);
            println!("# configuration is valid");
        }
        Command::Queues { action } => {
            let store = open_retry_store(&config)?;
            match action {
                QueuesAction::Stats => {
                    println!("data dir:       {}", config.persistence.path.display());
                    println!("failed bulks:   {}", store.failed_bulks_amount()?);
                    println!("overflow lists: {}", store.overflow_lists_amount()?);
                }
                QueuesAction::Reset { yes } => {
                    if !yes {
                        bail!("refusing to reset queues without --yes");
                    }
                    store.reset()?;
                    println!("queues reset");
                }
            }
            store.close()?;
        }
    }
    Ok(())
}

fn open_retry_store(config: &IndexerConfig) -> Result<RetryStore> {
    let path = &config.persistence.path;
    if !path.is_dir() {
        bail!("no persistence directory at {}", path.display());
    }
    let backend: Arc<dyn PersistenceBackend> = Arc::new(
        FileBackend::open(path).with_context(|| format!("opening {}", path.display()))?,
    );
    Ok(RetryStore::new(backend, &config.retry))
}
