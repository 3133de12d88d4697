//! Capture pipeline.
//!
//! Reads the framebuffer, rotates to the panel orientation, converts to NV12
//! and JPEG-encodes, either once on demand or continuously on a cadence
//! thread that publishes into a [`SharedFrameBuffer`].

use log::{debug, error, info, trace, warn};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::encoder::{EncodeUnit, SoftJpegUnit};
use super::frame_buffer::SharedFrameBuffer;
use super::surface::{Framebuffer, PixelSource, SurfaceGeometry};
use super::transform::{bgrx_to_nv12, rotate, Nv12Frame};
use super::{Orientation, JPEG_QUALITY};
use crate::config::{clamp_fps, DisplayConfig};
use crate::error::{Error, Result};

/// Surface, encode session and scratch buffers. Only ever used under the
/// pipeline's engine lock.
struct CaptureEngine {
    source: Box<dyn PixelSource>,
    encoder: Box<dyn EncodeUnit>,
    orientation: Orientation,
    geometry: SurfaceGeometry,
    raw: Vec<u32>,
    rotated: Vec<u32>,
    nv12: Nv12Frame,
}

impl CaptureEngine {
    fn capture(&mut self) -> Result<Vec<u8>> {
        self.source.read_into(&mut self.raw)?;

        let (w, h) = (self.geometry.width as usize, self.geometry.height as usize);
        let pixels: &[u32] = match self.orientation {
            Orientation::Normal => &self.raw,
            orientation => {
                rotate(&self.raw, &mut self.rotated, w, h, orientation);
                &self.rotated
            }
        };

        let (out_w, out_h) = (self.nv12.width, self.nv12.height);
        bgrx_to_nv12(pixels, out_w, out_h, &mut self.nv12)?;
        self.encoder.encode(&self.nv12)
    }
}

struct Shared {
    engine: Mutex<CaptureEngine>,
    frames: Arc<SharedFrameBuffer>,
    running: AtomicBool,
    fps: AtomicU32,
    produced: AtomicU64,
    failed: AtomicU64,
    last_error: Mutex<Option<String>>,
    orientation: Orientation,
    output: (u32, u32),
}

impl Shared {
    fn capture(&self) -> Result<Vec<u8>> {
        lock(&self.engine).capture()
    }

    fn record_failure(&self, e: &Error) -> bool {
        self.failed.fetch_add(1, Ordering::Relaxed);
        let message = e.to_string();
        let mut last = lock(&self.last_error);
        let repeated = last.as_deref() == Some(message.as_str());
        *last = Some(message);
        !repeated
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Snapshot of the pipeline for status reporting.
#[derive(Debug, Clone)]
pub struct PipelineStatus {
    pub running: bool,
    pub fps: u32,
    pub orientation: Orientation,
    pub width: u32,
    pub height: u32,
    pub frames_produced: u64,
    pub frames_failed: u64,
    pub last_error: Option<String>,
}

pub struct CapturePipeline {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CapturePipeline {
    /// Open the framebuffer, detect the orientation and open the encode
    /// session.
    pub fn init(config: &DisplayConfig) -> Result<Self> {
        let orientation = config
            .orientation
            .unwrap_or_else(|| Orientation::detect(&config.model_config));
        info!("screen orientation: {}", orientation);

        let source = Framebuffer::open(&config.device)?;
        let geometry = source.geometry();
        let (w, h) = orientation.output_dims(geometry.width, geometry.height);

        let encoder = SoftJpegUnit::open(w, h, JPEG_QUALITY)
            .map_err(|e| Error::DeviceUnavailable(format!("encode unit: {}", e)))?;

        Self::with_parts(Box::new(source), Box::new(encoder), orientation, config.fps)
    }

    /// Assemble a pipeline from an already opened source and encode session.
    pub fn with_parts(
        source: Box<dyn PixelSource>,
        encoder: Box<dyn EncodeUnit>,
        orientation: Orientation,
        fps: u32,
    ) -> Result<Self> {
        let geometry = source.geometry();
        let output = orientation.output_dims(geometry.width, geometry.height);
        if encoder.dims() != output {
            return Err(Error::Encode(format!(
                "encode session is {:?}, output is {:?}",
                encoder.dims(),
                output
            )));
        }

        let nv12 = Nv12Frame::new(output.0, output.1)?;
        let pixels = geometry.pixels();
        let rotated = if orientation == Orientation::Normal {
            Vec::new()
        } else {
            vec![0; pixels]
        };

        info!(
            "capture pipeline ready: {}x{} -> {}x{} ({})",
            geometry.width, geometry.height, output.0, output.1, orientation
        );

        let engine = CaptureEngine {
            source,
            encoder,
            orientation,
            geometry,
            raw: vec![0; pixels],
            rotated,
            nv12,
        };

        Ok(Self {
            shared: Arc::new(Shared {
                engine: Mutex::new(engine),
                frames: Arc::new(SharedFrameBuffer::new()),
                running: AtomicBool::new(false),
                fps: AtomicU32::new(clamp_fps(fps)),
                produced: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                last_error: Mutex::new(None),
                orientation,
                output,
            }),
            thread: Mutex::new(None),
        })
    }

    /// Capture one frame into `buf`. Returns the JPEG size.
    pub fn try_capture_frame(&self, buf: &mut [u8]) -> Result<usize> {
        let jpeg = self.shared.capture()?;
        if jpeg.len() > buf.len() {
            return Err(Error::BufferTooSmall {
                needed: jpeg.len(),
                capacity: buf.len(),
            });
        }
        buf[..jpeg.len()].copy_from_slice(&jpeg);
        Ok(jpeg.len())
    }

    /// Capture one frame into `buf`; 0 on any failure.
    pub fn capture_frame(&self, buf: &mut [u8]) -> usize {
        match self.try_capture_frame(buf) {
            Ok(size) => size,
            Err(e) => {
                warn!("display capture failed: {}", e);
                0
            }
        }
    }

    /// Start the cadence thread. Already running is not an error; the new
    /// rate is picked up on the next tick.
    pub fn start(&self, fps: u32) -> Result<()> {
        let fps = clamp_fps(fps);
        let mut thread = lock(&self.thread);

        if thread.is_some() && self.shared.running.load(Ordering::Acquire) {
            let previous = self.shared.fps.swap(fps, Ordering::Relaxed);
            if previous != fps {
                info!("display capture already running, rate {} -> {} fps", previous, fps);
            } else {
                debug!("display capture already running at {} fps", fps);
            }
            return Ok(());
        }

        // A thread that exited on its own is reaped before starting another.
        if let Some(stale) = thread.take() {
            let _ = stale.join();
        }

        self.shared.fps.store(fps, Ordering::Relaxed);
        self.shared.running.store(true, Ordering::Release);

        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("display-capture".to_string())
            .spawn(move || cadence_loop(shared));

        match handle {
            Ok(handle) => {
                *thread = Some(handle);
                info!("display capture started at {} fps", fps);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                error!("failed to spawn display capture thread: {}", e);
                Err(Error::Io(e))
            }
        }
    }

    /// Stop and join the cadence thread. No frames are published after
    /// this returns.
    pub fn stop(&self) {
        let mut thread = lock(&self.thread);
        self.shared.running.store(false, Ordering::Release);

        if let Some(handle) = thread.take() {
            if handle.join().is_err() {
                error!("display capture thread panicked");
            }
            info!("display capture stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Latest frames published by the cadence thread.
    pub fn frames(&self) -> Arc<SharedFrameBuffer> {
        self.shared.frames.clone()
    }

    pub fn orientation(&self) -> Orientation {
        self.shared.orientation
    }

    /// Encoded frame (width, height).
    pub fn output_dims(&self) -> (u32, u32) {
        self.shared.output
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            running: self.is_running(),
            fps: self.shared.fps.load(Ordering::Relaxed),
            orientation: self.shared.orientation,
            width: self.shared.output.0,
            height: self.shared.output.1,
            frames_produced: self.shared.produced.load(Ordering::Relaxed),
            frames_failed: self.shared.failed.load(Ordering::Relaxed),
            last_error: lock(&self.shared.last_error).clone(),
        }
    }

    /// Stop capturing and release the surface and encode session.
    pub fn cleanup(self) {
        self.stop();
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

fn cadence_loop(shared: Arc<Shared>) {
    debug!("display capture thread running");

    while shared.running.load(Ordering::Acquire) {
        let tick = Instant::now();
        let interval = Duration::from_secs(1) / shared.fps.load(Ordering::Relaxed).max(1);

        match shared.capture() {
            Ok(jpeg) => {
                let size = jpeg.len();
                if let Some(seq) = shared.frames.publish(jpeg) {
                    shared.produced.fetch_add(1, Ordering::Relaxed);
                    trace!("display frame {} ({} bytes)", seq, size);
                }
            }
            Err(e) => {
                // Skip this frame; a display or encoder glitch must not end the stream.
                if shared.record_failure(&e) {
                    warn!("display frame skipped: {}", e);
                } else {
                    debug!("display frame skipped: {}", e);
                }
            }
        }

        let elapsed = tick.elapsed();
        if elapsed < interval && shared.running.load(Ordering::Acquire) {
            std::thread::sleep(interval - elapsed);
        }
    }

    debug!("display capture thread exiting");
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Synthetic surface: a gradient whose brightness changes every read
    /// unless `frozen`.
    pub struct PatternSource {
        pub width: u32,
        pub height: u32,
        pub reads: Arc<AtomicU64>,
        /// Every n-th read fails (0 = never).
        pub fail_every: u64,
        pub frozen: bool,
    }

    impl PatternSource {
        pub fn new(width: u32, height: u32) -> Self {
            Self {
                width,
                height,
                reads: Arc::new(AtomicU64::new(0)),
                fail_every: 0,
                frozen: false,
            }
        }
    }

    impl PixelSource for PatternSource {
        fn geometry(&self) -> SurfaceGeometry {
            SurfaceGeometry {
                width: self.width,
                height: self.height,
                stride: self.width as usize * 4,
            }
        }

        fn read_into(&mut self, dst: &mut [u32]) -> Result<()> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_every > 0 && n % self.fail_every == 0 {
                return Err(Error::SurfaceRead(format!("read {} failed", n)));
            }
            let shade = if self.frozen { 0x80 } else { (n % 200) as u32 };
            for (i, px) in dst.iter_mut().take((self.width * self.height) as usize).enumerate() {
                let x = i as u32 % self.width;
                *px = (shade << 16) | ((x * 255 / self.width) << 8) | 0x40;
            }
            Ok(())
        }
    }

    pub fn pipeline(source: PatternSource, orientation: Orientation, fps: u32) -> CapturePipeline {
        let (w, h) = orientation.output_dims(source.width, source.height);
        let encoder = SoftJpegUnit::open(w, h, JPEG_QUALITY).unwrap();
        CapturePipeline::with_parts(Box::new(source), Box::new(encoder), orientation, fps).unwrap()
    }
}
