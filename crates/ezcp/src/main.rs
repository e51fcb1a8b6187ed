use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use reqwest::{Client, Response, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::EnvFilter;

/// Upload read size for the client commands.
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "ezcp", about = "ezcp — one-shot file transfer tokens", version)]
struct Cli {
    /// ezcp server URL (default: http://localhost:8000 or $EZCP_SERVER)
    #[arg(long, env = "EZCP_SERVER", default_value = "http://localhost:8000")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the ezcp HTTP server
    Serve {
        /// Port to listen on (default: $EZCP_PORT or 8000)
        #[arg(long, env = "EZCP_PORT", default_value = "8000")]
        port: u16,
        /// Host to bind (default: $EZCP_HOST or 127.0.0.1)
        #[arg(long, env = "EZCP_HOST", default_value = "127.0.0.1")]
        host: String,
        /// Directory holding ezcp.db and storage/
        #[arg(long, env = "EZCP_DATA_DIR")]
        data_dir: Option<PathBuf>,
        /// Time between unused-token sweeps, e.g. 5m
        #[arg(long, value_parser = humantime::parse_duration)]
        sweep_interval: Option<Duration>,
        /// Age after which unused tokens are swept, e.g. 24h
        #[arg(long, value_parser = humantime::parse_duration)]
        token_max_age: Option<Duration>,
        /// Payment gateway request timeout, e.g. 10s
        #[arg(long, value_parser = humantime::parse_duration)]
        gateway_timeout: Option<Duration>,
    },
    /// Remove unused tokens older than the maximum age, then exit
    Purge {
        /// Directory holding ezcp.db and storage/
        #[arg(long, env = "EZCP_DATA_DIR")]
        data_dir: Option<PathBuf>,
        /// Age after which unused tokens are removed, e.g. 24h
        #[arg(long, value_parser = humantime::parse_duration)]
        token_max_age: Option<Duration>,
    },
    /// Request a new single-use token
    Token,
    /// Upload a file to a token
    Upload {
        token: String,
        file: PathBuf,
    },
    /// Download a token's file (to stdout unless --output is given)
    Download {
        token: String,
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Get the durable token paid for by a transaction
    Durable {
        /// Payment transaction id
        tx: String,
    },
    /// Print a fresh payment address
    Address,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let default_level = match cli.command {
        Commands::Serve { .. } | Commands::Purge { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("EZCP_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let server = cli.server.trim_end_matches('/').to_owned();

    match cli.command {
        Commands::Serve {
            port,
            host,
            data_dir,
            sweep_interval,
            token_max_age,
            gateway_timeout,
        } => {
            let defaults = ezcp_server::ServerConfig::default();
            let cfg = ezcp_server::ServerConfig {
                host,
                port,
                data_dir: data_dir.or(defaults.data_dir),
                sweep_interval: sweep_interval.unwrap_or(defaults.sweep_interval),
                token_max_age: token_max_age.unwrap_or(defaults.token_max_age),
                gateway_timeout: gateway_timeout.unwrap_or(defaults.gateway_timeout),
                ..defaults
            };
            ezcp_server::run(cfg).await
        }

        Commands::Purge {
            data_dir,
            token_max_age,
        } => {
            let defaults = ezcp_server::ServerConfig::default();
            let cfg = ezcp_server::ServerConfig {
                data_dir: data_dir.or(defaults.data_dir),
                token_max_age: token_max_age.unwrap_or(defaults.token_max_age),
                ..defaults
            };
            let removed = ezcp_server::purge(&cfg).await?;
            println!(
                "purged {removed} unused token(s) older than {}",
                humantime::format_duration(cfg.token_max_age)
            );
            Ok(())
        }

        Commands::Token => {
            let resp = post(&format!("{server}/token")).await?;
            println!("{}", expect_body(resp, StatusCode::CREATED).await?);
            Ok(())
        }

        Commands::Upload { token, file } => cmd_upload(&server, &token, &file).await,

        Commands::Download { token, output } => {
            cmd_download(&server, &token, output.as_deref()).await
        }

        Commands::Durable { tx } => {
            let resp = post(&format!("{server}/token/{tx}")).await?;
            let status = resp.status();
            let body = expect_success(resp).await?;
            if status == StatusCode::CREATED {
                println!("{body}");
            } else {
                println!("{body} (existing)");
            }
            Ok(())
        }

        Commands::Address => {
            let resp = post(&format!("{server}/bitcoin")).await?;
            println!("{}", expect_success(resp).await?);
            Ok(())
        }
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_upload(server: &str, token: &str, path: &Path) -> Result<()> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open {}", path.display()))?;
    let length = file.metadata().await.context("stat upload file")?.len();

    let chunks = futures::stream::try_unfold(file, |mut file| async move {
        let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok::<_, std::io::Error>(None);
        }
        buf.truncate(n);
        Ok(Some((buf, file)))
    });

    let resp = Client::new()
        .post(format!("{server}/upload/{token}"))
        .header(reqwest::header::CONTENT_LENGTH, length)
        .body(reqwest::Body::wrap_stream(chunks))
        .send()
        .await
        .context("HTTP request failed")?;

    expect_body(resp, StatusCode::CREATED).await?;
    eprintln!("✓ uploaded {length} bytes");
    Ok(())
}

async fn cmd_download(server: &str, token: &str, output: Option<&Path>) -> Result<()> {
    let resp = Client::new()
        .get(format!("{server}/download/{token}"))
        .send()
        .await
        .context("HTTP request failed")?;

    if resp.status() != StatusCode::OK {
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        anyhow::bail!("server returned {status}: {text}");
    }

    let mut sink: Box<dyn tokio::io::AsyncWrite + Unpin> = match output {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("create {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    let mut written: u64 = 0;
    let mut body = resp.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.context("download interrupted")?;
        sink.write_all(&chunk).await.context("write output")?;
        written += chunk.len() as u64;
    }
    sink.flush().await.context("flush output")?;

    if let Some(path) = output {
        eprintln!("✓ wrote {written} bytes to {}", path.display());
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

async fn post(url: &str) -> Result<Response> {
    Client::new()
        .post(url)
        .send()
        .await
        .context("HTTP request failed")
}

async fn expect_success(resp: Response) -> Result<String> {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if !status.is_success() {
        anyhow::bail!("server returned {status}: {text}");
    }
    Ok(text)
}

async fn expect_body(resp: Response, expected: StatusCode) -> Result<String> {
    let status = resp.status();
    let text = resp.text().await.unwrap_or_default();
    if status != expected {
        anyhow::bail!("server returned {status}: {text}");
    }
    Ok(text)
}
