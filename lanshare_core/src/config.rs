use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::discovery::{BEACON_INTERVAL_SECS, DISCOVERY_PORT};
use crate::transfer::TRANSFER_PORT;

const DOWNLOAD_DIR_NAME: &str = "lanshare";
const ENV_PREFIX: &str = "LANSHARE_";

/// Runtime settings for discovery and transfer. Built from defaults and the
/// environment; nothing is written back to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub device_name: String,
    pub discovery_port: u16,
    pub transfer_port: u16,
    /// Where beacons are sent. Defaults to the limited broadcast address.
    pub beacon_target: SocketAddr,
    pub beacon_interval: Duration,
    pub download_path: PathBuf,
    /// Deadline applied to each blocking transfer step. `None` waits forever.
    pub io_timeout: Option<Duration>,
}

impl Default for AppConfig {
    fn default() -> Self {
        // ~/lanshare on every platform
        let download_path = directories::UserDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DOWNLOAD_DIR_NAME);

        Self {
            device_name: default_device_name(),
            discovery_port: DISCOVERY_PORT,
            transfer_port: TRANSFER_PORT,
            beacon_target: SocketAddr::from(([255, 255, 255, 255], DISCOVERY_PORT)),
            beacon_interval: Duration::from_secs(BEACON_INTERVAL_SECS),
            download_path,
            io_timeout: None,
        }
    }
}

impl AppConfig {
    /// Defaults, overridden by `.env` and `LANSHARE_*` variables.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok());
        config
    }

    /// Apply overrides from any key lookup. Values that fail to parse are
    /// logged and leave the current setting untouched.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup("DEVICE_NAME").filter(|n| !n.trim().is_empty()) {
            self.device_name = name;
        }
        if let Some(port) = parse_var::<u16>(&lookup, "DISCOVERY_PORT") {
            self.discovery_port = port;
            self.beacon_target.set_port(port);
        }
        if let Some(port) = parse_var::<u16>(&lookup, "TRANSFER_PORT") {
            self.transfer_port = port;
        }
        if let Some(target) = parse_var::<SocketAddr>(&lookup, "BEACON_TARGET") {
            self.beacon_target = target;
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "BEACON_INTERVAL_SECS").filter(|s| *s > 0) {
            self.beacon_interval = Duration::from_secs(secs);
        }
        if let Some(dir) = lookup("DOWNLOAD_DIR").filter(|d| !d.is_empty()) {
            self.download_path = PathBuf::from(dir);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "IO_TIMEOUT_SECS") {
            self.io_timeout = (secs > 0).then(|| Duration::from_secs(secs));
        }
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}{}={:?}", ENV_PREFIX, key, raw);
            None
        }
    }
}

/// Hostname of this machine, used as the display name in beacons
pub fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|s| s.into_string().ok())
        .unwrap_or_else(|| "Unknown-PC".to_string())
}
