//! Pixel remapping and colour conversion.
//!
//! Framebuffer pixels are 32-bit little-endian BGRX words (`0xXXRRGGBB`).
//! The encode unit consumes NV12: a full-resolution Y plane followed by an
//! interleaved CbCr plane at half resolution in both axes.

use super::Orientation;
use crate::error::{Error, Result};

/// Remap `src` (`width` x `height`) into `dst` according to `orientation`.
///
/// `dst` must hold `width * height` pixels. For the 90° family the output
/// is `height` pixels wide.
pub fn rotate(src: &[u32], dst: &mut [u32], width: usize, height: usize, orientation: Orientation) {
    let total = width * height;
    let src = &src[..total];
    let dst = &mut dst[..total];

    match orientation {
        Orientation::Normal => dst.copy_from_slice(src),
        Orientation::Flip180 => {
            for (d, s) in dst.iter_mut().zip(src.iter().rev()) {
                *d = *s;
            }
        }
        // Clockwise
        Orientation::Rotate90 => {
            for y in 0..height {
                let row = &src[y * width..(y + 1) * width];
                for (x, &px) in row.iter().enumerate() {
                    dst[x * height + (height - 1 - y)] = px;
                }
            }
        }
        Orientation::Rotate270 => {
            for y in 0..height {
                let row = &src[y * width..(y + 1) * width];
                for (x, &px) in row.iter().enumerate() {
                    dst[(width - 1 - x) * height + y] = px;
                }
            }
        }
    }
}

/// An NV12 image.
#[derive(Debug, Clone)]
pub struct Nv12Frame {
    pub width: u32,
    pub height: u32,
    data: Vec<u8>,
}

impl Nv12Frame {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(Error::Encode(format!(
                "NV12 needs even, non-zero dimensions (got {}x{})",
                width, height
            )));
        }
        let len = (width * height) as usize * 3 / 2;
        Ok(Self {
            width,
            height,
            data: vec![0; len],
        })
    }

    fn luma_len(&self) -> usize {
        (self.width * self.height) as usize
    }

    pub fn y(&self) -> &[u8] {
        &self.data[..self.luma_len()]
    }

    pub fn uv(&self) -> &[u8] {
        &self.data[self.luma_len()..]
    }

    fn planes_mut(&mut self) -> (&mut [u8], &mut [u8]) {
        let luma = self.luma_len();
        self.data.split_at_mut(luma)
    }
}

#[inline]
fn channels(px: u32) -> (i32, i32, i32) {
    (
        ((px >> 16) & 0xff) as i32,
        ((px >> 8) & 0xff) as i32,
        (px & 0xff) as i32,
    )
}

#[inline]
fn luma(r: i32, g: i32, b: i32) -> u8 {
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16) as u8
}

/// BT.601 limited-range conversion of `width` x `height` BGRX pixels.
///
/// Chroma is taken from the average of each 2x2 block. The padding byte is
/// ignored.
pub fn bgrx_to_nv12(src: &[u32], width: u32, height: u32, dst: &mut Nv12Frame) -> Result<()> {
    let (w, h) = (width as usize, height as usize);
    if dst.width != width || dst.height != height {
        return Err(Error::Encode(format!(
            "NV12 target is {}x{}, source is {}x{}",
            dst.width, dst.height, width, height
        )));
    }
    if src.len() < w * h {
        return Err(Error::Encode(format!(
            "source holds {} pixels, {} needed",
            src.len(),
            w * h
        )));
    }

    let (y_plane, uv_plane) = dst.planes_mut();

    for (dst_row, src_row) in y_plane.chunks_exact_mut(w).zip(src.chunks_exact(w)) {
        for (d, &px) in dst_row.iter_mut().zip(src_row) {
            let (r, g, b) = channels(px);
            *d = luma(r, g, b);
        }
    }

    for by in 0..h / 2 {
        let top = &src[(2 * by) * w..(2 * by + 1) * w];
        let bottom = &src[(2 * by + 1) * w..(2 * by + 2) * w];
        let out = &mut uv_plane[by * w..(by + 1) * w];

        for bx in 0..w / 2 {
            let (mut r, mut g, mut b) = (0, 0, 0);
            for px in [top[2 * bx], top[2 * bx + 1], bottom[2 * bx], bottom[2 * bx + 1]] {
                let (pr, pg, pb) = channels(px);
                r += pr;
                g += pg;
                b += pb;
            }
            let (r, g, b) = ((r + 2) / 4, (g + 2) / 4, (b + 2) / 4);

            out[2 * bx] = (((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128) as u8;
            out[2 * bx + 1] = (((112 * r - 94 * g - 18 * b + 128) >> 8) + 128) as u8;
        }
    }

    Ok(())
}

/// Expand an NV12 frame to packed RGB. Used by encode units that only
/// accept RGB input.
pub fn nv12_to_rgb(frame: &Nv12Frame, rgb: &mut Vec<u8>) {
    let (w, h) = (frame.width as usize, frame.height as usize);
    let (y_plane, uv_plane) = (frame.y(), frame.uv());

    rgb.clear();
    rgb.reserve(w * h * 3);

    for row in 0..h {
        let uv_row = &uv_plane[(row / 2) * w..(row / 2 + 1) * w];
        for col in 0..w {
            let c = y_plane[row * w + col] as i32 - 16;
            let d = uv_row[(col / 2) * 2] as i32 - 128;
            let e = uv_row[(col / 2) * 2 + 1] as i32 - 128;

            let r = (298 * c + 409 * e + 128) >> 8;
            let g = (298 * c - 100 * d - 208 * e + 128) >> 8;
            let b = (298 * c + 516 * d + 128) >> 8;
            rgb.push(r.clamp(0, 255) as u8);
            rgb.push(g.clamp(0, 255) as u8);
            rgb.push(b.clamp(0, 255) as u8);
        }
    }
}
