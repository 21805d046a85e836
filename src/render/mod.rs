//! Render loop and display models.
//!
//! Pixel-level drawing lives behind [`output::DisplayBackend`]; this module
//! decides *what* is on screen each frame: it polls every handler's latest
//! snapshot, drives the domain engines, and assembles a `DisplayFrame` model
//! plus the secondary outputs (shift strip, OLED, audio).

pub mod frame;
pub mod model;
pub mod output;
pub mod renderer;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("display: {0}")]
    Display(String),
    #[error("render loop gave up after {0} display errors")]
    RetriesExhausted(u32),
}
