//! Frame-loop harness over the headless driver.
//!
//! The harness plays the renderer's part of the frame protocol: begin a
//! frame, record a clear pass into the main framebuffer, submit, end. The
//! driver it runs on is shared so tests can script the surface and the GPU
//! between frames.

use std::sync::Arc;

use ember_gpu::headless::{GpuCompletion, HeadlessConfig, HeadlessDriver};
use ember_gpu::{
    Driver, FrameBegin, FrameEnd, FrameInfo, GraphicsConfig, GraphicsContext, QueueCapability,
    WindowResized,
};

use crate::{Result, TestError};

/// Clear color used by [`FrameHarness::run_frame`].
pub const DEFAULT_CLEAR_COLOR: [f32; 4] = [0.1, 0.1, 0.15, 1.0];

/// Harness configuration.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub headless: HeadlessConfig,
    pub graphics: GraphicsConfig,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            headless: HeadlessConfig::default(),
            graphics: GraphicsConfig::default()
                .with_app_name("ember-test")
                .with_validation(false),
        }
    }
}

impl HarnessConfig {
    pub fn with_headless(mut self, headless: HeadlessConfig) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_graphics(mut self, graphics: GraphicsConfig) -> Self {
        self.graphics = graphics;
        self
    }

    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.graphics = self.graphics.with_frames_in_flight(frames);
        self
    }

    pub fn with_completion(mut self, completion: GpuCompletion) -> Self {
        self.headless = self.headless.with_completion(completion);
        self
    }

    pub fn with_window_extent(mut self, width: u32, height: u32) -> Self {
        self.headless = self.headless.with_window_extent(width, height);
        self
    }
}

/// What happened to one iteration of the frame loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was submitted and presented.
    Presented(FrameInfo),
    /// Acquire failed; the swapchain was rebuilt before anything was recorded.
    Reissued,
    /// Present failed; the swapchain was rebuilt and the frame dropped.
    Lost,
    /// The window has no area.
    Skipped,
}

impl FrameOutcome {
    pub fn is_presented(&self) -> bool {
        matches!(self, Self::Presented(_))
    }

    /// Frame info for presented frames.
    pub fn info(&self) -> Option<FrameInfo> {
        match self {
            Self::Presented(info) => Some(*info),
            _ => None,
        }
    }
}

/// A graphics context over a headless driver.
pub struct FrameHarness {
    context: GraphicsContext<HeadlessDriver>,
    driver: Arc<HeadlessDriver>,
}

impl FrameHarness {
    pub fn new(config: HarnessConfig) -> Result<Self> {
        let driver = Arc::new(HeadlessDriver::new(config.headless));
        let extent = driver.window_extent();
        let context = GraphicsContext::new(Arc::clone(&driver), &config.graphics, extent)?;
        tracing::debug!(
            frames_in_flight = context.frames_in_flight(),
            "Frame harness ready"
        );
        Ok(Self { context, driver })
    }

    pub fn driver(&self) -> &Arc<HeadlessDriver> {
        &self.driver
    }

    pub fn context(&self) -> &GraphicsContext<HeadlessDriver> {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut GraphicsContext<HeadlessDriver> {
        &mut self.context
    }

    /// Run one frame that clears the main framebuffer.
    pub fn run_frame(&mut self) -> Result<FrameOutcome> {
        self.run_frame_with(Some(DEFAULT_CLEAR_COLOR))
    }

    /// Run one frame that records nothing.
    pub fn run_empty_frame(&mut self) -> Result<FrameOutcome> {
        self.run_frame_with(None)
    }

    /// Run `count` clearing frames.
    pub fn run_frames(&mut self, count: usize) -> Result<Vec<FrameOutcome>> {
        (0..count).map(|_| self.run_frame()).collect()
    }

    fn run_frame_with(&mut self, clear_color: Option<[f32; 4]>) -> Result<FrameOutcome> {
        let info = match self.context.begin_frame()? {
            FrameBegin::Ready(info) => info,
            FrameBegin::Recreated => return Ok(FrameOutcome::Reissued),
            FrameBegin::Skipped => return Ok(FrameOutcome::Skipped),
        };

        if let Some(color) = clear_color {
            record_clear_pass(&mut self.context, color)?;
        }

        Ok(match self.context.end_frame()? {
            FrameEnd::Presented => FrameOutcome::Presented(info),
            FrameEnd::Recreated => FrameOutcome::Lost,
        })
    }

    /// Resize the simulated window and forward the event to the context.
    pub fn resize(&mut self, width: u32, height: u32) -> Result<()> {
        self.driver.set_window_extent(width, height);
        self.context
            .on_window_resize(WindowResized { width, height })?;
        Ok(())
    }

    pub fn recreate_count(&self) -> u32 {
        self.context.swapchain().recreate_count()
    }

    /// Fail if the driver saw semaphore misuse or bad destroys.
    pub fn check_violations(&self) -> Result<()> {
        let violations = self.driver.violations();
        if violations.is_empty() {
            Ok(())
        } else {
            Err(TestError::Violations(violations))
        }
    }

    /// Drop the context, leaving only the driver.
    pub fn into_driver(self) -> Arc<HeadlessDriver> {
        let Self { context, driver } = self;
        drop(context);
        driver
    }
}

/// Record and submit a command buffer that clears the main framebuffer.
///
/// Must be called between `begin_frame` and `end_frame`.
pub fn record_clear_pass<D: Driver>(
    context: &mut GraphicsContext<D>,
    clear_color: [f32; 4],
) -> ember_gpu::Result<()> {
    let render_pass = context.get_main_render_pass();
    let framebuffer = context.get_main_framebuffer();
    let extent = context.swapchain().extent();

    let pool = context.get_current_frame_command_pool(QueueCapability::Graphics, false);
    let mut command_buffer = pool.get_command_buffer()?;
    command_buffer.begin()?;
    command_buffer.begin_render_pass(render_pass, framebuffer, extent, clear_color);
    command_buffer.set_viewport_scissor(extent);
    command_buffer.end_render_pass();
    command_buffer.end()?;

    context.submit_command_buffer(command_buffer);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn harness_presents_clear_frames() {
        let mut harness = FrameHarness::new(HarnessConfig::default()).unwrap();
        let outcome = harness.run_frame().unwrap();
        assert!(outcome.is_presented());
        assert_eq!(outcome.info().map(|info| info.frame_index), Some(0));

        let stats = harness.context().frame_stats();
        assert_eq!(stats.command_buffers, 1);
        assert_eq!(stats.commands, 3);
        harness.check_violations().unwrap();
    }

    #[test]
    fn empty_frame_submits_no_command_buffers() {
        let mut harness = FrameHarness::new(HarnessConfig::default()).unwrap();
        assert!(harness.run_empty_frame().unwrap().is_presented());
        assert_eq!(harness.context().frame_stats().command_buffers, 0);
        assert_eq!(harness.driver().submission_count(), 1);
    }

    #[test]
    fn into_driver_releases_context_objects() {
        let mut harness = FrameHarness::new(HarnessConfig::default()).unwrap();
        harness.run_frames(4).unwrap();
        let driver = harness.into_driver();
        assert_eq!(driver.live_object_count(), 0);
        assert!(driver.violations().is_empty(), "{:?}", driver.violations());
    }

    #[test]
    fn violations_surface_as_errors() {
        let harness = FrameHarness::new(HarnessConfig::default()).unwrap();
        let semaphore = harness.driver().create_semaphore().unwrap();
        harness.driver().destroy_semaphore(semaphore);
        harness.driver().destroy_semaphore(semaphore);
        assert!(matches!(
            harness.check_violations(),
            Err(TestError::Violations(v)) if v.len() == 1
        ));
    }
}
