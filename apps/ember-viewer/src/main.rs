//! Ember Engine Demo Viewer
//!
//! Opens a window and clears the swapchain image through the main render
//! pass every frame, cycling the clear color over time.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p ember-viewer -- [OPTIONS]
//! ```
//!
//! ## Options
//!
//! - `--frames-in-flight <N>`: Frames the CPU may record ahead (default: 3)
//! - `--fps <N>`: Frame rate cap (default: uncapped)
//! - `--no-validation`: Disable Vulkan validation layers
//! - `-h, --help`: Print help message
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;

use ember_app::{run_app, AppConfig};

use crate::app::{Viewer, ViewerArgs};

const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

fn main() -> anyhow::Result<()> {
    // Check for help flag before starting the app
    if std::env::args().any(|arg| arg == "-h" || arg == "--help") {
        print_help();
        return Ok(());
    }

    let args = ViewerArgs::from_args();
    let mut config = AppConfig::new("Ember Engine - Viewer")
        .with_size(WIDTH, HEIGHT)
        .with_frames_in_flight(args.frames_in_flight);
    if let Some(fps) = args.target_fps {
        config = config.with_target_fps(fps);
    }
    if args.no_validation {
        config = config.with_validation(false);
    }

    run_app::<Viewer>(config)
}

fn print_help() {
    eprintln!(
        "Ember Engine Demo Viewer

USAGE:
    cargo run -p ember-viewer -- [OPTIONS]

OPTIONS:
    --frames-in-flight <N>  Frames the CPU may record ahead (default: 3)
    --fps <N>               Frame rate cap (default: uncapped)
    --no-validation         Disable Vulkan validation layers
    -h, --help              Print this help message

ENVIRONMENT VARIABLES:
    RUST_LOG                Set log level (e.g., info, debug, trace)"
    );
}
