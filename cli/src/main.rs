// Copyright 2024 The Dagkv Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! `dagkv`: serve a repository, or poke one from the shell.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use bstr::ByteSlice as _;
use clap::Parser;
use clap::Subcommand;
use dagkv_lib::backend::CommitInfo;
use dagkv_lib::backend::Contents;
use dagkv_lib::backend::Timestamp;
use dagkv_lib::client::Client;
use dagkv_lib::config::ClientConfig;
use dagkv_lib::config::ServerConfig;
use dagkv_lib::mem_backend::MemBackend;
use dagkv_lib::path::KeyPath;
use dagkv_lib::server::Server;
use tracing::debug;

type CliError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser)]
#[command(name = "dagkv", version, about = "Versioned key-value store over the network")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server over an in-memory repository
    Serve {
        /// Transport to bind, e.g. tcp://0.0.0.0:8888 or unix:///run/dagkv.sock
        #[arg(long)]
        uri: Option<String>,
        /// TOML config file; flags override it
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Check connectivity to a server
    Ping {
        #[arg(long)]
        uri: Option<String>,
    },
    /// Print the value stored at a path on the current branch
    Get {
        /// Slash-separated key path, e.g. a/b
        path: String,
        #[arg(long)]
        uri: Option<String>,
    },
    /// Store a value at a path on the current branch
    Set {
        /// Slash-separated key path, e.g. a/b
        path: String,
        value: String,
        /// Commit message
        #[arg(long, short)]
        message: Option<String>,
        /// Commit author
        #[arg(long)]
        author: Option<String>,
        #[arg(long)]
        uri: Option<String>,
    },
    /// List the branches of the repository
    Branches {
        #[arg(long)]
        uri: Option<String>,
    },
}

async fn connect(uri: Option<String>) -> Result<Client, CliError> {
    let mut config = ClientConfig::default();
    if let Some(uri) = uri {
        config.uri = uri;
    }
    debug!(uri = %config.uri, "connecting");
    Ok(Client::connect(config).await?)
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Serve { uri, config } => {
            let mut config = match config {
                Some(path) => ServerConfig::from_file(&path)?,
                None => ServerConfig::default(),
            };
            if let Some(uri) = uri {
                config.uri = uri;
            }
            let repo = Arc::new(MemBackend::new());
            let server = Server::bind(config, repo).await?;
            server.serve().await?;
            Ok(())
        }
        Command::Ping { uri } => {
            connect(uri).await?.ping().await?;
            println!("pong");
            Ok(())
        }
        Command::Get { path, uri } => {
            let path = KeyPath::parse(&path)?;
            match connect(uri).await?.find(path.clone()).await? {
                Some(value) => {
                    println!("{}", value.as_bytes().as_bstr());
                    Ok(())
                }
                None => Err(format!("no value at {path}").into()),
            }
        }
        Command::Set {
            path,
            value,
            message,
            author,
            uri,
        } => {
            let path = KeyPath::parse(&path)?;
            let info = CommitInfo {
                author: author.unwrap_or_else(|| "dagkv-cli".to_string()),
                message: message.unwrap_or_else(|| format!("set {path}")),
                date: Timestamp::now(),
            };
            let commit_id = connect(uri)
                .await?
                .set(path, info, Contents::from(value.as_str()))
                .await?;
            println!("{commit_id}");
            Ok(())
        }
        Command::Branches { uri } => {
            for branch in connect(uri).await?.branches().await? {
                println!("{branch}");
            }
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::FAILURE
        }
    }
}
