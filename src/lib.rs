//! Gaze-driven reading assistant: turns eye-tracker samples and text
//! selections into summaries of what the reader is looking at.

pub mod calibration;
pub mod cli;
pub mod config;
pub mod document;
pub mod dwell;
pub mod geometry;
pub mod input;
pub mod ipc;
pub mod locator;
pub mod logging;
pub mod placement;
pub mod session;
pub mod signal;
pub mod summarize;
pub mod text;
