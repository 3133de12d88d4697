//! Memory-mapped Linux framebuffer.

use log::info;
use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr::NonNull;

use crate::error::{Error, Result};

/// Dimensions of a 32 bpp surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceGeometry {
    pub width: u32,
    pub height: u32,
    /// Bytes per row, at least `width * 4`.
    pub stride: usize,
}

impl SurfaceGeometry {
    pub fn pixels(&self) -> usize {
        (self.width * self.height) as usize
    }
}

/// Something that can hand out the current display contents as BGRX words.
pub trait PixelSource: Send {
    fn geometry(&self) -> SurfaceGeometry;

    /// Copy the visible area into `dst` (row-major, `width * height` pixels).
    fn read_into(&mut self, dst: &mut [u32]) -> Result<()>;
}

const FBIOGET_VSCREENINFO: libc::c_ulong = 0x4600;
const FBIOGET_FSCREENINFO: libc::c_ulong = 0x4602;

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct FbBitfield {
    offset: u32,
    length: u32,
    msb_right: u32,
}

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct FbVarScreeninfo {
    xres: u32,
    yres: u32,
    xres_virtual: u32,
    yres_virtual: u32,
    xoffset: u32,
    yoffset: u32,
    bits_per_pixel: u32,
    grayscale: u32,
    red: FbBitfield,
    green: FbBitfield,
    blue: FbBitfield,
    transp: FbBitfield,
    nonstd: u32,
    activate: u32,
    height: u32,
    width: u32,
    accel_flags: u32,
    pixclock: u32,
    left_margin: u32,
    right_margin: u32,
    upper_margin: u32,
    lower_margin: u32,
    hsync_len: u32,
    vsync_len: u32,
    sync: u32,
    vmode: u32,
    rotate: u32,
    colorspace: u32,
    reserved: [u32; 4],
}

#[repr(C)]
#[derive(Default)]
#[allow(dead_code)]
struct FbFixScreeninfo {
    id: [u8; 16],
    smem_start: libc::c_ulong,
    smem_len: u32,
    type_: u32,
    type_aux: u32,
    visual: u32,
    xpanstep: u16,
    ypanstep: u16,
    ywrapstep: u16,
    line_length: u32,
    mmio_start: libc::c_ulong,
    mmio_len: u32,
    accel: u32,
    capabilities: u16,
    reserved: [u16; 2],
}

/// Check what the driver reported and derive the geometry we capture with.
fn geometry_from(xres: u32, yres: u32, bpp: u32, line_length: u32) -> Result<SurfaceGeometry> {
    if bpp != 32 {
        return Err(Error::DeviceUnavailable(format!(
            "unsupported pixel depth: {} bpp (expected 32)",
            bpp
        )));
    }
    if xres == 0 || yres == 0 {
        return Err(Error::DeviceUnavailable(format!(
            "framebuffer reports empty resolution {}x{}",
            xres, yres
        )));
    }

    let row = xres as usize * 4;
    let stride = if line_length == 0 { row } else { line_length as usize };
    if stride < row {
        return Err(Error::DeviceUnavailable(format!(
            "line length {} shorter than a {} pixel row",
            stride, xres
        )));
    }

    Ok(SurfaceGeometry {
        width: xres,
        height: yres,
        stride,
    })
}

/// `/dev/fbN` mapped read-only for the lifetime of the value.
pub struct Framebuffer {
    // Closed after the mapping is gone (fields drop after `Drop::drop`).
    _file: File,
    map: NonNull<u8>,
    map_len: usize,
    geometry: SurfaceGeometry,
}

// The mapping is only read through `&mut self`.
unsafe impl Send for Framebuffer {}

impl Framebuffer {
    pub fn open(path: &Path) -> Result<Self> {
        let unavailable =
            |what: &str, e: std::io::Error| Error::DeviceUnavailable(format!("{}: {}: {}", path.display(), what, e));

        let file = File::open(path).map_err(|e| unavailable("open", e))?;
        let fd = file.as_raw_fd();

        let mut vinfo = FbVarScreeninfo::default();
        let ret = unsafe { libc::ioctl(fd, FBIOGET_VSCREENINFO as _, &mut vinfo as *mut FbVarScreeninfo) };
        if ret < 0 {
            return Err(unavailable("FBIOGET_VSCREENINFO", std::io::Error::last_os_error()));
        }

        let mut finfo = FbFixScreeninfo::default();
        let ret = unsafe { libc::ioctl(fd, FBIOGET_FSCREENINFO as _, &mut finfo as *mut FbFixScreeninfo) };
        if ret < 0 {
            return Err(unavailable("FBIOGET_FSCREENINFO", std::io::Error::last_os_error()));
        }

        let geometry = geometry_from(
            vinfo.xres,
            vinfo.yres,
            vinfo.bits_per_pixel,
            finfo.line_length,
        )?;
        let map_len = geometry.stride * geometry.height as usize;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(unavailable("mmap", std::io::Error::last_os_error()));
        }
        let map = NonNull::new(ptr as *mut u8).ok_or_else(|| {
            Error::DeviceUnavailable(format!("{}: mmap returned null", path.display()))
        })?;

        info!(
            "framebuffer {}: {}x{}, {} bpp, stride {}",
            path.display(),
            geometry.width,
            geometry.height,
            vinfo.bits_per_pixel,
            geometry.stride
        );

        Ok(Self {
            _file: file,
            map,
            map_len,
            geometry,
        })
    }
}

impl PixelSource for Framebuffer {
    fn geometry(&self) -> SurfaceGeometry {
        self.geometry
    }

    fn read_into(&mut self, dst: &mut [u32]) -> Result<()> {
        let SurfaceGeometry { width, height, stride } = self.geometry;
        let (width, height) = (width as usize, height as usize);
        if dst.len() < width * height {
            return Err(Error::SurfaceRead(format!(
                "destination holds {} pixels, {} needed",
                dst.len(),
                width * height
            )));
        }

        // The driver updates the mapping asynchronously; a frame may mix two
        // refreshes, which is acceptable for a status view.
        for (y, row) in dst.chunks_exact_mut(width).take(height).enumerate() {
            unsafe {
                let src = self.map.as_ptr().add(y * stride);
                std::ptr::copy_nonoverlapping(src, row.as_mut_ptr() as *mut u8, width * 4);
            }
        }
        Ok(())
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.map.as_ptr() as *mut libc::c_void, self.map_len);
        }
    }
}
