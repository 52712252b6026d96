use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use config::{Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub drone: DroneConfig,
    pub telemetry: TelemetryConfig,
    pub logger: LoggerConfig,
    pub flight: FlightConfig,
    pub transfer: TransferConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DroneConfig {
    /// Address of the vehicle on its own access point.
    pub address: IpAddr,
    pub command_port: u16,
    pub telemetry_port: u16,
    /// Local address the command socket binds to.
    pub command_bind: SocketAddr,
    /// Upper bound on a single command/response exchange.
    pub command_timeout_ms: u64,
}

impl Default for DroneConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::new(192, 168, 10, 1)),
            command_port: 8889,
            telemetry_port: 8890,
            command_bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8889),
            command_timeout_ms: 15_000,
        }
    }
}

impl DroneConfig {
    pub fn command_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.command_port)
    }

    pub fn telemetry_bind(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.telemetry_port)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub poll_interval_ms: u64,
    pub buffer_size: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            buffer_size: 1024,
        }
    }
}

impl TelemetryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub directory: PathBuf,
    /// strftime pattern rendered once per session.
    pub file_pattern: String,
    pub period_ms: u64,
    pub sea_level_hpa: f32,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        let directory = dirs::data_dir()
            .map(|dir| dir.join("ecodrone"))
            .unwrap_or_else(|| PathBuf::from("data"));
        Self {
            directory,
            file_pattern: "survey-%Y%m%d-%H%M%S.csv".to_string(),
            period_ms: 1000,
            sea_level_hpa: 1013.25,
        }
    }
}

impl LoggerConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn log_path(&self, now: chrono::DateTime<chrono::Local>) -> PathBuf {
        self.directory.join(now.format(&self.file_pattern).to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FlightConfig {
    /// Abort the session when the vehicle refuses control mode.
    pub require_ack: bool,
    pub arm_blinks: u32,
    pub blink_ms: u64,
    pub maneuvers: Vec<ManeuverConfig>,
}

impl Default for FlightConfig {
    fn default() -> Self {
        Self {
            require_ack: false,
            arm_blinks: 2,
            blink_ms: 500,
            maneuvers: vec![ManeuverConfig {
                command: "up 75".to_string(),
                settle_ms: 2000,
            }],
        }
    }
}

impl FlightConfig {
    pub fn blink(&self) -> Duration {
        Duration::from_millis(self.blink_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ManeuverConfig {
    pub command: String,
    #[serde(default)]
    pub settle_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub device_name: String,
    /// 0 waits for a client indefinitely.
    pub connect_timeout_ms: u64,
    pub chunk_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            device_name: "EcoDrone_Data".to_string(),
            connect_timeout_ms: 0,
            chunk_size: 180,
        }
    }
}

impl TransferConfig {
    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_ms > 0).then(|| Duration::from_millis(self.connect_timeout_ms))
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let env = std::env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
        let config_dir = PathBuf::from("config");

        let settings = config::Config::builder()
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            .add_source(File::from(config_dir.join(format!("{}.toml", env))).required(false))
            .add_source(File::from(PathBuf::from("/etc/ecodrone/ecodrone.toml")).required(false))
            .add_source(
                Environment::with_prefix("ECODRONE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config = settings.try_deserialize()?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(File::from_str(contents, config::FileFormat::Toml))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}
