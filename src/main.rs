// SPDX-License-Identifier: GPL-3.0-only

use anyhow::{Context, Result};
use clap_lex::RawArgs;
use std::process;
use tracing::{error, info, warn};

use crate::{
    backend::{
        software::{SoftArbiter, SoftwareSink},
        Format, GraphicBuffer, PathCaps,
    },
    display::{layers::CompositionType, Display, HwcError},
    state::Common,
    utils::geometry::Rect,
};

pub mod backend;
pub mod config;
pub mod display;
pub mod fence;
pub mod hints;
mod logger;
pub mod state;
pub mod utils;

#[cfg(feature = "profile-with-tracy")]
#[global_allocator]
static GLOBAL: profiling::tracy_client::ProfiledAllocator<std::alloc::System> =
    profiling::tracy_client::ProfiledAllocator::new(std::alloc::System, 10);

fn main() {
    if let Err(err) = main_inner() {
        error!("Error occured in main(): {}", err);
        process::exit(1);
    }
}

fn main_inner() -> Result<()> {
    let raw_args = RawArgs::from_args();
    let mut cursor = raw_args.cursor();
    let git_hash = option_env!("GIT_HASH").unwrap_or("unknown");
    let mut frames = 60u64;

    while let Some(arg) = raw_args.next_os(&mut cursor) {
        match arg.to_str() {
            Some("--help") | Some("-h") => {
                print_help(env!("CARGO_PKG_VERSION"), git_hash);
                return Ok(());
            }
            Some("--version") | Some("-V") => {
                println!(
                    "dpu-comp {} (git commit {})",
                    env!("CARGO_PKG_VERSION"),
                    git_hash
                );
                return Ok(());
            }
            Some("--frames") | Some("-n") => {
                let value = raw_args
                    .next_os(&mut cursor)
                    .and_then(|v| v.to_str().map(str::to_owned))
                    .context("--frames needs a number")?;
                frames = value.parse().context("--frames needs a number")?;
            }
            _ => {}
        }
    }

    logger::init_logger()?;
    info!("dpu-comp starting up!");

    profiling::register_thread!("Main Thread");

    let config = config::load_config();
    let common = Common::new(config);
    let arbiter = SoftArbiter::new(&common.config.hardware);
    let mut display = Display::new(
        "primary",
        common.clone(),
        Box::new(SoftwareSink::new()),
        Box::new(arbiter),
    );

    run_simulation(&mut display, frames)?;

    common.hints.shutdown();
    Ok(())
}

/// Drive a small layer stack through the frame lifecycle without real
/// hardware: a fullscreen background, a scaled video layer and a status
/// bar that flips its buffer every frame.
fn run_simulation(display: &mut Display, frames: u64) -> Result<()> {
    let background = display.create_layer();
    let video = display.create_layer();
    let bar = display.create_layer();

    display.set_client_target(
        Some(GraphicBuffer::new(1, 1440, 3120, Format::Argb8888)),
        None,
        crate::backend::ColorSpace::Srgb,
    );

    {
        let layers = display.layers();
        let mut layers = layers.write();

        let layer = layers.by_id_mut(background).context("background layer")?;
        layer.set_z(0);
        layer.requested_type = CompositionType::Device;
        layer.supported_paths = PathCaps::OVERLAY | PathCaps::BLENDER;
        layer.set_display_frame(Rect::new(0, 0, 1440, 3120));
        layer.set_src_crop(Rect::new(0, 0, 1440, 3120));

        let layer = layers.by_id_mut(video).context("video layer")?;
        layer.set_z(1);
        layer.requested_type = CompositionType::Device;
        layer.supported_paths = PathCaps::OVERLAY | PathCaps::BLENDER;
        layer.set_display_frame(Rect::new(0, 500, 1440, 810));
        layer.set_src_crop(Rect::new(0, 0, 1920, 1080));

        let layer = layers.by_id_mut(bar).context("bar layer")?;
        layer.set_z(2);
        layer.requested_type = CompositionType::Device;
        layer.supported_paths = PathCaps::OVERLAY;
        layer.set_display_frame(Rect::new(0, 0, 1440, 120));
        layer.set_src_crop(Rect::new(0, 0, 1440, 120));
    }

    for frame in 0..frames {
        profiling::scope!("frame");
        {
            let layers = display.layers();
            let mut layers = layers.write();
            for (id, base) in [(background, 10u64), (video, 20), (bar, 30)] {
                let layer = layers.by_id_mut(id).context("simulated layer")?;
                let (w, h) = (layer.src_crop.w, layer.src_crop.h);
                layer.set_buffer(
                    Some(GraphicBuffer::new(base + frame % 2, w, h, Format::Argb8888)),
                    None,
                );
            }
        }

        let changes = display.validate()?;
        display.accept_display_changes()?;
        match display.present() {
            Ok(retire) => {
                let releases = display.take_release_fences();
                info!(
                    frame,
                    types_changed = changes.types_changed,
                    releases = releases.len(),
                    retired = retire.is_some(),
                    "presented"
                );
            }
            Err(HwcError::NotValidated) => warn!(frame, "frame needs a full validate"),
            Err(err) => return Err(err.into()),
        }
        profiling::finish_frame!();
    }

    let open = display
        .ledger
        .outstanding_of(crate::fence::FenceKind::SrcAcquire);
    if open != 0 {
        warn!(open, "acquire fences left open after simulation");
    }
    Ok(())
}

fn print_help(version: &str, git_rev: &str) {
    println!(
        r#"dpu-comp {version} (git commit {git_rev})

Per-frame layer composition engine for DPU-style display controllers,
driven here against a software commit sink.

Options:
  -h, --help        Show this message
  -V, --version     Show the version of dpu-comp
  -n, --frames <N>  Number of frames to simulate (default 60)"#
    );
}
