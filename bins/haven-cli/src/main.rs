use clap::{Parser, Subcommand};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Parser)]
#[command(name = "haven-cli")]
#[command(version)]
struct Cli {
    /// Daemon control API base url.
    #[arg(long, default_value = "http://127.0.0.1:9040")]
    api: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Cafe session management.
    #[command(subcommand)]
    Cafe(CafeCommand),
}

#[derive(Subcommand)]
enum CafeCommand {
    /// Register with a cafe.
    Add {
        cafe: String,
        #[arg(long)]
        token: String,
    },
    /// List active cafe sessions.
    Ls,
    /// Show one cafe session.
    Get { cafe: String },
    /// Deregister from a cafe.
    Rm { cafe: String },
    /// Trigger an inbox poll against every session-held cafe.
    Messages,
}

#[derive(Debug, Error)]
enum CliError {
    #[error("{0}")]
    Local(String),
    #[error("network: {0}")]
    Network(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            CliError::Local(_) => 1,
            CliError::Network(_) => 2,
            CliError::Unauthorized(_) => 3,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Cafe(command) => run_cafe(&cli.api, command).await,
    };
    if let Err(err) = result {
        eprintln!("{}", err);
        std::process::exit(err.exit_code());
    }
}

async fn run_cafe(api: &str, command: CafeCommand) -> Result<(), CliError> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|err| CliError::Local(err.to_string()))?;
    match command {
        CafeCommand::Add { cafe, token } => {
            let body = serde_json::json!({"id": cafe, "token": token});
            let response = client
                .post(format!("{}/api/v1/cafes", api))
                .json(&body)
                .send()
                .await
                .map_err(network)?;
            output(expect_json(response).await?);
        }
        CafeCommand::Ls => {
            let response = client
                .get(format!("{}/api/v1/cafes", api))
                .send()
                .await
                .map_err(network)?;
            output(expect_json(response).await?);
        }
        CafeCommand::Get { cafe } => {
            let response = client
                .get(format!("{}/api/v1/cafes/{}", api, cafe))
                .send()
                .await
                .map_err(network)?;
            output(expect_json(response).await?);
        }
        CafeCommand::Rm { cafe } => {
            let response = client
                .delete(format!("{}/api/v1/cafes/{}", api, cafe))
                .send()
                .await
                .map_err(network)?;
            output(expect_json(response).await?);
        }
        CafeCommand::Messages => {
            let response = client
                .post(format!("{}/api/v1/cafes/messages", api))
                .send()
                .await
                .map_err(network)?;
            output(expect_json(response).await?);
        }
    }
    Ok(())
}

fn network(err: reqwest::Error) -> CliError {
    CliError::Network(err.to_string())
}

async fn expect_json(response: reqwest::Response) -> Result<Value, CliError> {
    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|err| CliError::Network(err.to_string()))?;
    if status.is_success() {
        return Ok(body);
    }
    let message = body
        .get("error")
        .and_then(|v| v.as_str())
        .unwrap_or("request failed")
        .to_string();
    match status.as_u16() {
        401 | 403 => Err(CliError::Unauthorized(message)),
        502 | 504 => Err(CliError::Network(message)),
        _ => Err(CliError::Local(message)),
    }
}

fn output(value: Value) {
    match serde_json::to_string_pretty(&value) {
        Ok(pretty) => println!("{}", pretty),
        Err(_) => println!("{}", value),
    }
}
