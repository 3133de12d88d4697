//! LAN print mode and WiFi tuning.
//!
//! LAN mode is toggled through one-shot calls to the control daemon: open a
//! connection, send one framed request, read one framed response, close.

mod wifi;

pub use wifi::{
    iface_prefix, parse_routes, plan_route_fix, CommandRunner, DriverTune, RouteEntry, RouteFix,
    RoutePlan, SystemCommands,
};

use log::{debug, info, warn};
use serde_json::Value;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::LanConfig;
use crate::error::{Error, Result};
use crate::protocol::{methods, oneshot_request, ETX};

/// Responses larger than this are truncated.
const MAX_RESPONSE: usize = 4096;

/// Keys the daemon has used for the LAN print flag, in lookup order.
const MODE_KEYS: [&str; 4] = ["open", "lan_print_mode", "lanPrintMode", "mode"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LanStatus {
    Enabled,
    Disabled,
    /// The daemon could not be reached or gave an unreadable answer.
    Error,
}

/// Send one request to the daemon and return its decoded response.
pub fn oneshot(addr: SocketAddr, timeout: Duration, method: &str) -> Result<Value> {
    let mut stream = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| Error::Connection(format!("connect {}: {}", addr, e)))?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    stream
        .write_all(&oneshot_request(method)?)
        .map_err(|e| Error::Connection(format!("send {}: {}", method, e)))?;

    let mut response = Vec::with_capacity(512);
    let mut chunk = [0u8; 1024];
    loop {
        let n = match stream.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            // Timed out: use whatever arrived.
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
            Err(e) => return Err(Error::Connection(format!("receive {}: {}", method, e))),
        };
        if n == 0 {
            break;
        }
        if let Some(end) = chunk[..n].iter().position(|&b| b == ETX) {
            response.extend_from_slice(&chunk[..end]);
            break;
        }
        response.extend_from_slice(&chunk[..n]);
        if response.len() >= MAX_RESPONSE {
            response.truncate(MAX_RESPONSE);
            break;
        }
    }

    if response.is_empty() {
        return Err(Error::Connection(format!("no response to {}", method)));
    }
    Ok(serde_json::from_slice(&response)?)
}

/// Read the LAN flag out of a `QueryLanPrintStatus` response.
fn status_from_response(response: &Value) -> LanStatus {
    let Some(result) = response.get("result") else {
        return LanStatus::Error;
    };
    let Some(flag) = MODE_KEYS.iter().find_map(|key| result.get(*key)) else {
        return LanStatus::Error;
    };

    let enabled = match flag {
        Value::Number(n) => n.as_f64().map_or(false, |v| v as i64 != 0),
        Value::String(s) => s == "1" || s == "true",
        Value::Bool(b) => *b,
        _ => return LanStatus::Error,
    };
    if enabled {
        LanStatus::Enabled
    } else {
        LanStatus::Disabled
    }
}

pub struct LanMode {
    addr: SocketAddr,
    timeout: Duration,
    sysfs_root: PathBuf,
    commands: Box<dyn CommandRunner>,
}

impl LanMode {
    pub fn new(config: &LanConfig) -> Self {
        Self {
            addr: config.addr,
            timeout: config.timeout,
            sysfs_root: PathBuf::from("/sys"),
            commands: Box::new(SystemCommands),
        }
    }

    /// Use another command runner for the WiFi helpers.
    pub fn with_commands(mut self, commands: Box<dyn CommandRunner>) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    pub fn query(&self) -> LanStatus {
        match oneshot(self.addr, self.timeout, methods::QUERY_LAN_PRINT) {
            Ok(response) => {
                let status = status_from_response(&response);
                debug!("LAN print status: {:?}", status);
                status
            }
            Err(e) => {
                warn!("LAN mode query failed: {}", e);
                LanStatus::Error
            }
        }
    }

    /// Turn LAN print mode on unless it already is.
    pub fn enable(&self) -> Result<()> {
        if self.query() == LanStatus::Enabled {
            info!("LAN mode already enabled");
            return Ok(());
        }

        let response = oneshot(self.addr, self.timeout, methods::OPEN_LAN_PRINT)?;
        match response.get("error") {
            None | Some(Value::Null) => {
                info!("LAN mode enabled");
                Ok(())
            }
            Some(err) => Err(Error::Protocol(format!("OpenLanPrint returned error: {}", err))),
        }
    }

    /// Give eth1 priority over wlan0 when both sit on the same /24.
    pub fn fix_route_priority(&self) -> RouteFix {
        wifi::fix_route_priority(self.commands.as_ref())
    }

    /// Tune the RTL8723DS driver for streaming.
    pub fn optimize_driver(&self) -> DriverTune {
        wifi::optimize_driver(self.commands.as_ref(), &self.sysfs_root)
    }
}
