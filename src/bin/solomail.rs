#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! solomail CLI: run the server, or generate and verify password hashes

use anyhow::Context;
use clap::{ArgAction, ArgGroup, Parser};
use solomail::{Config, Servers, pwhash};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "solomail")]
#[command(about = "Personal mail server: SMTP in, POP3 out, Maildir on disk")]
#[command(version, disable_version_flag = true)]
#[command(group(ArgGroup::new("mode").required(true)))]
struct Args {
    /// Run the mail server with this JSON configuration
    #[arg(
        short = 'c',
        long = "config",
        value_name = "CONFIG_PATH",
        group = "mode"
    )]
    config: Option<PathBuf>,

    /// Generate a password hash to add to the configuration; prompts
    /// when no password is given on the command line
    #[arg(
        short = 'g',
        long = "genpwhash",
        value_name = "PASSWORD",
        num_args = 0..=1,
        group = "mode"
    )]
    genpwhash: Option<Option<String>>,

    /// Check if a password matches a password hash
    #[arg(
        short = 'r',
        long = "pwverify",
        value_names = ["PASSWORD", "PWHASH"],
        num_args = 2,
        group = "mode"
    )]
    pwverify: Option<Vec<String>>,

    /// Show the password on screen when -g prompts for it
    #[arg(short = 'e', long = "echo_password")]
    echo_password: bool,

    /// Print version
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(password) = args.genpwhash {
        let password = match password {
            Some(password) => password,
            None => read_password(args.echo_password)?,
        };
        println!("{}", pwhash::gen_pwhash(&password));
        return Ok(());
    }

    if let Some(pair) = args.pwverify {
        let (password, encoded) = (&pair[0], &pair[1]);
        let matches = pwhash::parse_hash(encoded)
            .map(|info| pwhash::check_pass(password, &info))
            .unwrap_or(false);
        if matches {
            println!("✓ password and hash match");
        } else {
            println!("✗ password and hash do not match");
        }
        return Ok(());
    }

    if let Some(path) = args.config {
        run_server(&path).await?;
    }
    Ok(())
}

fn read_password(echo: bool) -> anyhow::Result<String> {
    if echo {
        print!("Enter password: ");
        std::io::stdout().flush()?;
        let mut password = String::new();
        std::io::stdin().read_line(&mut password)?;
        Ok(password.trim_end_matches(['\r', '\n']).to_string())
    } else {
        rpassword::prompt_password("Enter password: ").context("cannot read password")
    }
}

async fn run_server(path: &Path) -> anyhow::Result<()> {
    let cfg = Config::load(path).with_context(|| format!("loading {}", path.display()))?;
    setup_logging(&cfg)?;

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    tracing::info!(
        "Starting solomail {} config={}",
        env!("CARGO_PKG_VERSION"),
        path.display()
    );

    let servers = Servers::bind(&cfg).await?;
    servers.run().await?;
    Ok(())
}

fn setup_logging(cfg: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_new(cfg.logging.level.to_lowercase())
        .with_context(|| format!("invalid log level {:?}", cfg.logging.level))?;

    if cfg.logging.logfile == "CONSOLE" {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.logging.logfile)
            .with_context(|| format!("cannot open logfile {:?}", cfg.logging.logfile))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .init();
    }
    Ok(())
}
