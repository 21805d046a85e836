use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::error;

use opentpt::app::{self, AppError, BootOptions};
use opentpt::render::output::{ConsoleDisplay, NullAudio, NullOled, NullStrip};

/// In-vehicle motorsport telemetry appliance.
#[derive(Parser, Debug)]
#[command(name = "opentpt", version)]
struct Cli {
    /// Run in a window instead of fullscreen.
    #[arg(long)]
    windowed: bool,

    /// Override the storage root (default: USB mount with home fallback).
    #[arg(long)]
    storage_root: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let opts = BootOptions { windowed: cli.windowed, storage_root: cli.storage_root };

    // The panel, LED strip, OLED and TTS drivers are platform integrations;
    // this binary runs against the console backend until they are attached.
    let result = app::run(
        &opts,
        ConsoleDisplay::new(),
        Box::new(NullAudio),
        Box::new(NullStrip),
        Box::new(NullOled),
    );

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(AppError::Init(e)) => {
            error!("fatal init failure: {e}");
            ExitCode::from(1)
        }
        Err(AppError::Render(e)) => {
            error!("render loop failed: {e}");
            ExitCode::from(2)
        }
    }
}
