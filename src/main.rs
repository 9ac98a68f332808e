//! llmsession sample driver
//!
//! Loads a session from a config file, streams one answer to stdout and
//! optionally prints the profile.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use llmsession::SessionConfig;

#[derive(Parser, Debug)]
#[command(name = "llmsession", version, about = "Stream one completion from a local model")]
struct Args {
    /// Path to the session config JSON
    config: PathBuf,

    /// Prompt to send
    #[arg(short, long, default_value = "Introduce yourself.")]
    prompt: String,

    /// Override sampler.max_length
    #[arg(long)]
    max_length: Option<u32>,

    /// Override sampler.temp
    #[arg(long)]
    temp: Option<f32>,

    /// Override sampler.top_k
    #[arg(long)]
    top_k: Option<u32>,

    /// Override sampler.top_p
    #[arg(long)]
    top_p: Option<f32>,

    /// Print the session profile as JSON after generation
    #[arg(long)]
    profile: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("llmsession=info")))
        .init();

    let args = Args::parse();
    info!("Starting llmsession v{}", env!("CARGO_PKG_VERSION"));

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(feature = "llama")]
fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    use llmsession::inference::LlamaEngine;
    use llmsession::{LibraryLocator, Session};
    use tracing::warn;

    let mut config = SessionConfig::load(&args.config)?;
    if let Some(max_length) = args.max_length {
        config.sampler.max_length = max_length;
    }
    if let Some(temp) = args.temp {
        config.sampler.temp = temp;
    }
    if let Some(top_k) = args.top_k {
        config.sampler.top_k = top_k;
    }
    if let Some(top_p) = args.top_p {
        config.sampler.top_p = top_p;
    }

    let locator = LibraryLocator::system();
    for dir in &config.library_dirs {
        locator.prepend(dir)?;
    }
    match locator.prepend_executable_dir() {
        Ok(dir) => info!("Library search path includes {}", dir.display()),
        Err(e) => warn!("Could not add executable directory to library path: {e}"),
    }

    let session = Session::from_config(&config, LlamaEngine::load)?;

    let mut stdout = std::io::stdout().lock();
    let reason = session.query(&args.prompt, |fragment| {
        // A closed stdout ends generation
        stdout.write_all(fragment.as_bytes()).and_then(|_| stdout.flush()).is_err()
    })?;
    writeln!(stdout)?;
    info!("Generation ended: {:?}", reason);

    if args.profile {
        let profile = session.profile()?;
        writeln!(stdout, "{}", profile.to_json()?)?;
    }

    session.release();
    Ok(())
}

#[cfg(not(feature = "llama"))]
fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let config = SessionConfig::load(&args.config)?;
    Err(format!(
        "{} is valid, but this build has no inference backend (enable the `llama` feature)",
        config.source.display()
    )
    .into())
}
