//! Application framework for the Ember engine.
//!
//! This crate provides a trait-based application framework that handles
//! common boilerplate like:
//! - Logging setup
//! - Window creation and resize forwarding
//! - GPU context initialization
//! - The begin/render/end frame loop
//! - Exiting with an error when something fatal happens
//!
//! # Example
//!
//! ```no_run
//! use ember_app::{run_app, AppConfig, AppContext, EmberApp, FrameContext};
//!
//! struct MyApp;
//!
//! impl EmberApp for MyApp {
//!     fn init(_ctx: &mut AppContext) -> anyhow::Result<Self> {
//!         Ok(MyApp)
//!     }
//!
//!     fn update(&mut self, _ctx: &AppContext, _dt: f32) {}
//!
//!     fn render(&mut self, _ctx: &mut AppContext, _frame: &FrameContext) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     run_app::<MyApp>(AppConfig::default())
//! }
//! ```

mod app;
mod context;
mod frame;
mod runner;

pub use app::EmberApp;
pub use context::AppContext;
pub use frame::FrameContext;
pub use runner::{run_app, AppConfig};

pub use winit::event::WindowEvent;
