//! Application runner and event loop.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ember_gpu::{FrameBegin, FrameEnd, GraphicsConfig, WindowResized, MAX_FRAMES_IN_FLIGHT};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::window::{Window, WindowId};

use crate::app::EmberApp;
use crate::context::AppContext;
use crate::frame::FrameContext;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Window title.
    pub title: String,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Enable Vulkan validation layers (default: debug builds only).
    pub validation: bool,
    /// Frames the CPU may record ahead of the GPU.
    pub frames_in_flight: usize,
    /// Target frames per second (None for unlimited).
    pub target_fps: Option<u32>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            title: "Ember".to_string(),
            width: 1280,
            height: 720,
            validation: cfg!(debug_assertions),
            frames_in_flight: MAX_FRAMES_IN_FLIGHT,
            target_fps: None,
        }
    }
}

impl AppConfig {
    /// Create a new config with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Set the window dimensions.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Enable or disable validation layers.
    pub fn with_validation(mut self, validation: bool) -> Self {
        self.validation = validation;
        self
    }

    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames;
        self
    }

    /// Set the target FPS.
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.target_fps = Some(fps);
        self
    }

    /// Graphics settings derived from this config.
    pub fn graphics_config(&self) -> GraphicsConfig {
        GraphicsConfig::default()
            .with_app_name(self.title.clone())
            .with_validation(self.validation)
            .with_frames_in_flight(self.frames_in_flight)
    }

    fn target_frame_time(&self) -> Option<Duration> {
        self.target_fps
            .filter(|&fps| fps > 0)
            .map(|fps| Duration::from_nanos(1_000_000_000 / u64::from(fps)))
    }
}

/// Run an `EmberApp` with the given configuration.
///
/// Initializes logging, creates the window and GPU context, and runs the
/// event loop until the application exits. Returns an error if the
/// application stopped because of a fatal error.
pub fn run_app<A: EmberApp + 'static>(config: AppConfig) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("{} starting...", config.title);

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut runner = AppRunner::<A> {
        config,
        state: None,
        fatal: None,
    };

    event_loop.run_app(&mut runner)?;

    match runner.fatal {
        Some(err) => Err(err.context("application terminated")),
        None => Ok(()),
    }
}

/// Internal application runner that implements winit's `ApplicationHandler`.
struct AppRunner<A: EmberApp> {
    config: AppConfig,
    state: Option<AppState<A>>,
    fatal: Option<anyhow::Error>,
}

/// Internal application state.
struct AppState<A: EmberApp> {
    app: A,
    ctx: AppContext,
    target_frame_time: Option<Duration>,
    // FPS tracking
    min_fps: f64,
    max_fps: f64,
    fps_sum: f64,
}

impl<A: EmberApp + 'static> ApplicationHandler for AppRunner<A> {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");

        match self.create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready!");
            }
            Err(e) => self.fail(event_loop, e.context("failed to initialize application")),
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        // Let the app handle the event first
        if let Some(state) = &mut self.state {
            if state.app.on_event(&event) {
                return;
            }
        }

        let result = match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                if let Some(mut state) = self.state.take() {
                    state.cleanup();
                }
                event_loop.exit();
                Ok(())
            }
            WindowEvent::RedrawRequested => match &mut self.state {
                Some(state) => state.render_frame(),
                None => Ok(()),
            },
            WindowEvent::Resized(size) => match &mut self.state {
                Some(state) => state.handle_resize(size.width, size.height),
                None => Ok(()),
            },
            _ => Ok(()),
        };

        if let Err(e) = result {
            self.fail(event_loop, e);
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.ctx.window.request_redraw();
        }
    }
}

impl<A: EmberApp + 'static> AppRunner<A> {
    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<AppState<A>> {
        let window_attrs = Window::default_attributes()
            .with_title(&self.config.title)
            .with_inner_size(PhysicalSize::new(self.config.width, self.config.height));

        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let mut ctx = AppContext::new(window, &self.config.graphics_config())?;
        let extent = ctx.extent();
        info!(
            "Swapchain ready: {}x{} ({} images, {} frames in flight)",
            extent.width,
            extent.height,
            ctx.graphics.swapchain().image_count(),
            ctx.graphics.frames_in_flight()
        );

        let app = A::init(&mut ctx)?;

        Ok(AppState {
            app,
            ctx,
            target_frame_time: self.config.target_frame_time(),
            min_fps: f64::MAX,
            max_fps: 0.0,
            fps_sum: 0.0,
        })
    }

    /// Log a fatal error, tear down and leave the event loop.
    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        error!("{err:#}");
        if let Some(mut state) = self.state.take() {
            state.cleanup();
        }
        self.fatal = Some(err);
        event_loop.exit();
    }
}

impl<A: EmberApp> AppState<A> {
    fn render_frame(&mut self) -> anyhow::Result<()> {
        let frame_start = Instant::now();

        let now = Instant::now();
        let dt = now.duration_since(self.ctx.last_frame_time).as_secs_f32();
        self.ctx.last_frame_time = now;

        if dt > 0.0 {
            let fps = 1.0 / f64::from(dt);
            self.min_fps = self.min_fps.min(fps);
            self.max_fps = self.max_fps.max(fps);
            self.fps_sum += fps;
        }

        self.app.update(&self.ctx, dt);

        let info = match self.ctx.graphics.begin_frame()? {
            FrameBegin::Ready(info) => info,
            FrameBegin::Recreated => return self.notify_resize(),
            FrameBegin::Skipped => return Ok(()),
        };

        let frame = FrameContext::new(info, dt);
        self.app.render(&mut self.ctx, &frame)?;

        match self.ctx.graphics.end_frame()? {
            FrameEnd::Presented => self.ctx.frame_count += 1,
            FrameEnd::Recreated => self.notify_resize()?,
        }

        // Frame pacing
        if let Some(target) = self.target_frame_time {
            let elapsed = frame_start.elapsed();
            if elapsed < target {
                thread::sleep(target - elapsed);
            }
        }

        Ok(())
    }

    fn handle_resize(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        self.ctx
            .graphics
            .on_window_resize(WindowResized { width, height })?;

        if width == 0 || height == 0 {
            return Ok(());
        }

        info!("Resized to {}x{}", width, height);
        self.notify_resize()
    }

    fn notify_resize(&mut self) -> anyhow::Result<()> {
        let extent = self.ctx.extent();
        self.app.on_resize(&mut self.ctx, extent.width, extent.height)
    }

    fn cleanup(&mut self) {
        if self.ctx.frame_count > 0 && self.fps_sum > 0.0 {
            #[allow(clippy::cast_precision_loss)]
            let avg_fps = self.fps_sum / self.ctx.frame_count as f64;
            info!("FPS Statistics:");
            info!("  Min: {:.1}", self.min_fps);
            info!("  Max: {:.1}", self.max_fps);
            info!("  Avg: {:.1}", avg_fps);
            info!("  Total frames: {}", self.ctx.frame_count);
        }

        info!("Starting cleanup...");
        if let Err(e) = self.ctx.graphics.wait_for_device() {
            error!("Failed to wait idle: {e}");
        }

        self.app.cleanup(&mut self.ctx);
        info!("Cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_graphics_defaults() {
        let config = AppConfig::default();
        let graphics = config.graphics_config();
        assert_eq!(graphics.frames_in_flight, MAX_FRAMES_IN_FLIGHT);
        assert_eq!(graphics.app_name, "Ember");
        assert_eq!(graphics.validation, config.validation);
    }

    #[test]
    fn builder_carries_settings_to_graphics_config() {
        let config = AppConfig::new("Viewer")
            .with_size(800, 600)
            .with_validation(false)
            .with_frames_in_flight(2);
        let graphics = config.graphics_config();
        assert_eq!((config.width, config.height), (800, 600));
        assert_eq!(graphics.app_name, "Viewer");
        assert!(!graphics.validation);
        assert_eq!(graphics.frames_in_flight, 2);
    }

    #[test]
    fn target_frame_time_from_fps() {
        assert_eq!(AppConfig::default().target_frame_time(), None);
        assert_eq!(
            AppConfig::default().with_target_fps(50).target_frame_time(),
            Some(Duration::from_millis(20))
        );
        assert_eq!(AppConfig::default().with_target_fps(0).target_frame_time(), None);
    }
}
