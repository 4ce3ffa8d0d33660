//! Viewer application: clears the screen with a slowly cycling color.

use std::f32::consts::TAU;

use ember_app::{AppContext, EmberApp, FrameContext};
use ember_gpu::{QueueCapability, MAX_FRAMES_IN_FLIGHT};
use tracing::info;

/// Seconds between stats log lines.
const STATS_INTERVAL: f32 = 5.0;

/// Radians per second of the clear color cycle.
const COLOR_SPEED: f32 = 0.5;

/// Command line options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewerArgs {
    pub frames_in_flight: usize,
    pub target_fps: Option<u32>,
    pub no_validation: bool,
}

impl Default for ViewerArgs {
    fn default() -> Self {
        Self {
            frames_in_flight: MAX_FRAMES_IN_FLIGHT,
            target_fps: None,
            no_validation: false,
        }
    }
}

impl ViewerArgs {
    /// Parse options from the process arguments.
    pub fn from_args() -> Self {
        let args: Vec<String> = std::env::args().skip(1).collect();
        Self::parse(&args)
    }

    /// Parse options, ignoring anything unrecognized or malformed.
    pub fn parse(args: &[String]) -> Self {
        let mut parsed = Self::default();
        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--frames-in-flight" => {
                    if let Some(n) = args.get(i + 1).and_then(|v| v.parse().ok()) {
                        if n > 0 {
                            parsed.frames_in_flight = n;
                        }
                        i += 1;
                    }
                }
                "--fps" => {
                    if let Some(fps) = args.get(i + 1).and_then(|v| v.parse().ok()) {
                        parsed.target_fps = Some(fps);
                        i += 1;
                    }
                }
                "--no-validation" => parsed.no_validation = true,
                _ => {}
            }
            i += 1;
        }
        parsed
    }
}

/// Clear color at `t` seconds: three phase-shifted sine waves.
pub fn clear_color(t: f32) -> [f32; 4] {
    let phase = t * COLOR_SPEED;
    let channel = |offset: f32| 0.5f32.mul_add((phase + offset).sin(), 0.5);
    [channel(0.0), channel(TAU / 3.0), channel(2.0 * TAU / 3.0), 1.0]
}

pub struct Viewer {
    elapsed: f32,
    stats_timer: f32,
}

impl EmberApp for Viewer {
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self> {
        let extent = ctx.extent();
        info!(
            "Viewer initialized at {}x{} ({:?})",
            extent.width,
            extent.height,
            ctx.graphics.swapchain().format()
        );
        Ok(Self {
            elapsed: 0.0,
            stats_timer: 0.0,
        })
    }

    fn update(&mut self, ctx: &AppContext, dt: f32) {
        self.elapsed += dt;
        self.stats_timer += dt;
        if self.stats_timer >= STATS_INTERVAL {
            self.stats_timer = 0.0;
            let stats = ctx.graphics.frame_stats();
            info!(
                frames = ctx.frame_count,
                command_buffers = stats.command_buffers,
                commands = stats.commands,
                recreates = ctx.graphics.swapchain().recreate_count(),
                "Viewer stats"
            );
        }
    }

    fn render(&mut self, ctx: &mut AppContext, frame: &FrameContext) -> anyhow::Result<()> {
        let graphics = &mut ctx.graphics;
        let render_pass = graphics.get_main_render_pass();
        let framebuffer = graphics.get_main_framebuffer();

        let pool = graphics.get_current_frame_command_pool(QueueCapability::Graphics, false);
        let mut command_buffer = pool.get_command_buffer()?;
        command_buffer.begin()?;
        command_buffer.begin_render_pass(
            render_pass,
            framebuffer,
            frame.extent(),
            clear_color(self.elapsed),
        );
        command_buffer.end_render_pass();
        command_buffer.end()?;

        graphics.submit_command_buffer(command_buffer);
        Ok(())
    }

    fn on_resize(&mut self, _ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        info!("Viewer surface is now {}x{}", width, height);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn parse_defaults() {
        assert_eq!(ViewerArgs::parse(&[]), ViewerArgs::default());
    }

    #[test]
    fn parse_all_options() {
        let parsed = ViewerArgs::parse(&args(&[
            "--frames-in-flight",
            "2",
            "--fps",
            "60",
            "--no-validation",
        ]));
        assert_eq!(
            parsed,
            ViewerArgs {
                frames_in_flight: 2,
                target_fps: Some(60),
                no_validation: true,
            }
        );
    }

    #[test]
    fn parse_rejects_zero_frames_in_flight() {
        let parsed = ViewerArgs::parse(&args(&["--frames-in-flight", "0"]));
        assert_eq!(parsed.frames_in_flight, MAX_FRAMES_IN_FLIGHT);
    }

    #[test]
    fn clear_color_stays_in_range() {
        for step in 0..100 {
            #[allow(clippy::cast_precision_loss)]
            let color = clear_color(step as f32 * 0.37);
            assert!(color.iter().all(|c| (0.0..=1.0).contains(c)), "{color:?}");
            assert!((color[3] - 1.0).abs() < f32::EPSILON);
        }
    }
}
