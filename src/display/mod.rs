//! LCD framebuffer capture.
//!
//! The panel is scanned out from `/dev/fb0` as 32-bit BGRX. Frames are
//! rotated to match how the panel is mounted on each printer model, converted
//! to NV12 and JPEG-encoded.

mod capture;
mod encoder;
mod frame_buffer;
mod orientation;
mod surface;
mod transform;

pub use capture::{CapturePipeline, PipelineStatus};
pub use encoder::{EncodeUnit, SoftJpegUnit};
pub use frame_buffer::{EncodedFrame, SharedFrameBuffer};
pub use orientation::{Orientation, ALL_ORIENTATIONS};
pub use surface::{Framebuffer, PixelSource, SurfaceGeometry};
pub use transform::{bgrx_to_nv12, nv12_to_rgb, rotate, Nv12Frame};

#[cfg(test)]
pub(crate) use capture::testing;

/// JPEG quality used for display frames.
pub const JPEG_QUALITY: u8 = 80;
