//! Runtime configuration.
//!
//! Defaults match the Anycubic firmware layout: the control daemon listens on
//! loopback port 18086 and the printer model is recorded in `api.cfg`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::display::Orientation;

/// Control daemon endpoint (`gkapi`).
pub const RPC_ADDR: &str = "127.0.0.1:18086";
/// A session with no inbound bytes for this long is considered dead.
pub const RPC_IDLE_TIMEOUT: Duration = Duration::from_secs(30);
/// Socket read timeout used to poll the running flag.
pub const RPC_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Pause between reconnect attempts.
pub const RPC_RECONNECT_BACKOFF: Duration = Duration::from_secs(3);
/// Connect/receive timeout for one-shot requests.
pub const ONESHOT_TIMEOUT: Duration = Duration::from_secs(5);

pub const FRAMEBUFFER_PATH: &str = "/dev/fb0";
pub const MODEL_CONFIG_PATH: &str = "/userdata/app/gk/config/api.cfg";

/// Display updates are slow; a few frames per second is plenty.
pub const DEFAULT_DISPLAY_FPS: u32 = 5;
pub const MAX_DISPLAY_FPS: u32 = 30;

#[derive(Debug, Clone)]
pub struct Config {
    pub rpc: RpcConfig,
    pub display: DisplayConfig,
    pub lan: LanConfig,
    /// Start the RPC responder.
    pub rpc_enabled: bool,
    /// Interval between status/CPU log lines.
    pub status_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct RpcConfig {
    pub addr: SocketAddr,
    pub idle_timeout: Duration,
    pub poll_interval: Duration,
    pub reconnect_backoff: Duration,
    /// Cadence used when the daemon asks for a stream.
    pub stream_fps: u32,
}

#[derive(Debug, Clone)]
pub struct DisplayConfig {
    /// Initialise the capture pipeline at all.
    pub enabled: bool,
    /// Start the cadence thread right after init instead of waiting for a request.
    pub autostart: bool,
    pub device: PathBuf,
    pub model_config: PathBuf,
    pub fps: u32,
    /// Skip model detection and use this orientation.
    pub orientation: Option<Orientation>,
}

#[derive(Debug, Clone)]
pub struct LanConfig {
    /// Enable LAN print mode at startup.
    pub enable: bool,
    /// Apply the WiFi route-priority and driver tweaks at startup.
    pub tune_wifi: bool,
    pub addr: SocketAddr,
    pub timeout: Duration,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            idle_timeout: RPC_IDLE_TIMEOUT,
            poll_interval: RPC_POLL_INTERVAL,
            reconnect_backoff: RPC_RECONNECT_BACKOFF,
            stream_fps: DEFAULT_DISPLAY_FPS,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            autostart: false,
            device: PathBuf::from(FRAMEBUFFER_PATH),
            model_config: PathBuf::from(MODEL_CONFIG_PATH),
            fps: DEFAULT_DISPLAY_FPS,
            orientation: None,
        }
    }
}

impl Default for LanConfig {
    fn default() -> Self {
        Self {
            enable: false,
            tune_wifi: false,
            addr: default_addr(),
            timeout: ONESHOT_TIMEOUT,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc: RpcConfig::default(),
            display: DisplayConfig::default(),
            lan: LanConfig::default(),
            rpc_enabled: true,
            status_interval: Duration::from_secs(10),
        }
    }
}

/// Clamp a requested frame rate into the supported range; 0 means default.
pub fn clamp_fps(fps: u32) -> u32 {
    if fps == 0 {
        DEFAULT_DISPLAY_FPS
    } else {
        fps.min(MAX_DISPLAY_FPS)
    }
}

fn default_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 18086))
}
