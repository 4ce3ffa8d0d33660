//! `EmberApp` trait definition.

use crate::context::AppContext;
use crate::frame::FrameContext;
use winit::event::WindowEvent;

/// Trait for Ember applications.
///
/// The framework owns the window, the GPU context and the event loop. An
/// application only records work for the frames it is handed.
pub trait EmberApp: Sized {
    /// Initialize the application.
    ///
    /// Called once, after the window and GPU context have been created.
    fn init(ctx: &mut AppContext) -> anyhow::Result<Self>;

    /// Update application state.
    ///
    /// Called every redraw before a frame is begun, including redraws that
    /// end up not rendering (minimized window, swapchain rebuilt).
    ///
    /// # Arguments
    /// * `ctx` - Application context with GPU and window access
    /// * `dt` - Delta time in seconds since last frame
    fn update(&mut self, ctx: &AppContext, dt: f32);

    /// Render a frame.
    ///
    /// Called between `begin_frame` and `end_frame`. Take command buffers
    /// from `ctx.graphics.get_current_frame_command_pool(..)`, record them and
    /// hand them back with `ctx.graphics.submit_command_buffer(..)`.
    ///
    /// The framework handles:
    /// - Waiting for the frame slot and acquiring the swapchain image
    /// - Submitting queued command buffers
    /// - Presenting and swapchain recreation
    fn render(&mut self, ctx: &mut AppContext, frame: &FrameContext) -> anyhow::Result<()>;

    /// Handle a new swapchain extent.
    ///
    /// Called after the swapchain was rebuilt, whether from a window resize or
    /// because the surface went stale.
    ///
    /// Default implementation does nothing.
    #[allow(unused_variables)]
    fn on_resize(&mut self, ctx: &mut AppContext, width: u32, height: u32) -> anyhow::Result<()> {
        Ok(())
    }

    /// Handle window events.
    ///
    /// Return `true` if the event was handled and should not be processed
    /// further.
    #[allow(unused_variables)]
    fn on_event(&mut self, event: &WindowEvent) -> bool {
        false
    }

    /// Cleanup resources before shutdown.
    ///
    /// The GPU is idle when this is called.
    #[allow(unused_variables)]
    fn cleanup(&mut self, ctx: &mut AppContext) {}
}
