use clap::{Args, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use fbcam::config::{
    Config, DisplayConfig, LanConfig, RpcConfig, DEFAULT_DISPLAY_FPS, FRAMEBUFFER_PATH,
    MODEL_CONFIG_PATH, RPC_ADDR,
};
use fbcam::display::Orientation;

#[derive(Parser)]
#[command(name = "fbcam")]
#[command(about = "LCD framebuffer JPEG feed announced to gkapi as its camera process", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Debug logging (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Answer the control daemon and stream the display on request
    Run(RunArgs),

    /// Write one display frame to a JPEG file
    Snapshot {
        /// Output file
        #[arg(short, long, default_value = "display.jpg")]
        output: PathBuf,

        #[command(flatten)]
        display: DisplayArgs,
    },
}

#[derive(Args)]
pub struct DisplayArgs {
    /// Framebuffer device
    #[arg(long, default_value = FRAMEBUFFER_PATH)]
    pub device: PathBuf,

    /// Printer config holding the modelId
    #[arg(long, default_value = MODEL_CONFIG_PATH)]
    pub model_config: PathBuf,

    /// Skip model detection (normal, flip-180, rotate-90, rotate-270)
    #[arg(long)]
    pub orientation: Option<Orientation>,
}

#[derive(Args)]
pub struct RunArgs {
    /// Control daemon address
    #[arg(long, default_value = RPC_ADDR)]
    pub rpc_addr: SocketAddr,

    /// Do not connect to the control daemon
    #[arg(long)]
    pub no_rpc: bool,

    /// Initialise display capture
    #[arg(long)]
    pub display: bool,

    /// Start streaming right away instead of waiting for startLanCapture
    #[arg(long, requires = "display")]
    pub autostart: bool,

    /// Display frames per second (1-30)
    #[arg(long, default_value_t = DEFAULT_DISPLAY_FPS)]
    pub fps: u32,

    #[command(flatten)]
    pub source: DisplayArgs,

    /// Enable LAN print mode at startup
    #[arg(long)]
    pub lan_mode: bool,

    /// Fix WiFi route priority and tune the WiFi driver at startup
    #[arg(long)]
    pub tune_wifi: bool,

    /// Seconds between status log lines
    #[arg(long, default_value_t = 10)]
    pub status_interval: u64,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl DisplayArgs {
    pub fn display_config(&self) -> DisplayConfig {
        DisplayConfig {
            enabled: true,
            device: self.device.clone(),
            model_config: self.model_config.clone(),
            orientation: self.orientation,
            ..DisplayConfig::default()
        }
    }
}

impl RunArgs {
    pub fn into_config(self) -> Config {
        let fps = fbcam::config::clamp_fps(self.fps);
        Config {
            rpc: RpcConfig {
                addr: self.rpc_addr,
                stream_fps: fps,
                ..RpcConfig::default()
            },
            display: DisplayConfig {
                enabled: self.display,
                autostart: self.autostart,
                fps,
                ..self.source.display_config()
            },
            lan: LanConfig {
                enable: self.lan_mode,
                tune_wifi: self.tune_wifi,
                addr: self.rpc_addr,
                ..LanConfig::default()
            },
            rpc_enabled: !self.no_rpc,
            status_interval: Duration::from_secs(self.status_interval.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(args: &[&str]) -> Config {
        let cli = Cli::try_parse_from(std::iter::once("fbcam").chain(args.iter().copied())).unwrap();
        match cli.command {
            Commands::Run(run) => run.into_config(),
            Commands::Snapshot { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn test_run_defaults() {
        let config = run(&["run"]);
        assert!(config.rpc_enabled);
        assert!(!config.display.enabled);
        assert_eq!(config.rpc.addr.to_string(), RPC_ADDR);
        assert_eq!(config.display.fps, DEFAULT_DISPLAY_FPS);
        assert_eq!(config.display.device, PathBuf::from(FRAMEBUFFER_PATH));
        assert_eq!(config.display.orientation, None);
        assert!(!config.lan.enable);
    }

    #[test]
    fn test_run_flags() {
        let config = run(&[
            "run",
            "--display",
            "--autostart",
            "--fps",
            "60",
            "--orientation",
            "rotate-270",
            "--lan-mode",
            "--no-rpc",
            "--rpc-addr",
            "127.0.0.1:9000",
        ]);
        assert!(config.display.enabled && config.display.autostart);
        assert_eq!(config.display.fps, 30);
        assert_eq!(config.rpc.stream_fps, 30);
        assert_eq!(config.display.orientation, Some(Orientation::Rotate270));
        assert!(config.lan.enable);
        assert!(!config.rpc_enabled);
        assert_eq!(config.lan.addr.port(), 9000);
    }

    #[test]
    fn test_autostart_requires_display() {
        assert!(Cli::try_parse_from(["fbcam", "run", "--autostart"]).is_err());
        assert!(Cli::try_parse_from(["fbcam", "run", "--orientation", "sideways"]).is_err());
    }

    #[test]
    fn test_snapshot_args() {
        let cli = Cli::try_parse_from(["fbcam", "-v", "snapshot", "-o", "/tmp/x.jpg", "--orientation", "90"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Snapshot { output, display } => {
                assert_eq!(output, PathBuf::from("/tmp/x.jpg"));
                let config = display.display_config();
                assert!(config.enabled);
                assert_eq!(config.orientation, Some(Orientation::Rotate90));
            }
            Commands::Run(_) => panic!("expected snapshot"),
        }
    }
}
