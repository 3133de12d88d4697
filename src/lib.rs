//! LCD framebuffer JPEG feed for Anycubic printer boards.
//!
//! The process registers with the local control daemon (`gkapi`) in place of
//! the vendor camera process and serves the printer's display as a JPEG
//! stream.

pub mod config;
pub mod cpu;
pub mod display;
pub mod error;
pub mod lan;
pub mod protocol;
pub mod rpc;

pub use error::{Error, Result};
