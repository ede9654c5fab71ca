//! TCTI configuration.
//!
//! A transport is named by a string of the form `name[:conf]`, where `conf`
//! is a comma separated list of `key=value` pairs, e.g.
//! `mssim:host=127.0.0.1,port=2321` or `mssim:path=/run/tpm.sock`. The same
//! selection can come from the `TPM2TOOLS_TCTI` / `TCTI` environment
//! variables or from a TOML or JSON file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::TctiContext;
use crate::error::{Result, TctiError};
use crate::fake::FakeTcti;
use crate::header::cc;
use crate::mssim::MssimTcti;

/// Default simulator host.
pub const DEFAULT_MSSIM_HOST: &str = "localhost";

/// Default simulator command port. The platform port is the next one.
pub const DEFAULT_MSSIM_PORT: u16 = 2321;

/// Environment variables consulted by [`TctiSpec::from_env`], in order.
pub const TCTI_ENV_VARS: [&str; 2] = ["TPM2TOOLS_TCTI", "TCTI"];

/// Where to find the simulator.
///
/// In a conf string, setting `host` clears `path` and vice versa. When a
/// file sets both, `path` wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MssimConfig {
    /// Host name or address for TCP, without brackets for IPv6.
    pub host: Option<String>,
    /// TCP command port; the platform port is `port + 1`.
    pub port: u16,
    /// Unix socket path of the command socket; the platform socket is
    /// `<path>.ctrl`.
    pub path: Option<PathBuf>,
}

impl Default for MssimConfig {
    fn default() -> Self {
        Self {
            host: Some(DEFAULT_MSSIM_HOST.to_string()),
            port: DEFAULT_MSSIM_PORT,
            path: None,
        }
    }
}

impl MssimConfig {
    /// Apply a `key=value,...` string on top of this configuration.
    /// Keys that do not appear keep their current value.
    pub fn apply_conf(&mut self, conf: &str) -> Result<()> {
        for (key, value) in parse_key_values(conf)? {
            match key {
                "host" => {
                    self.host = Some(value.to_string());
                    self.path = None;
                }
                "port" => self.port = parse_port(value)?,
                "path" => {
                    self.path = Some(PathBuf::from(value));
                    self.host = None;
                }
                other => {
                    return Err(TctiError::bad_value(format!(
                        "unknown mssim key '{}'",
                        other
                    )))
                }
            }
        }
        Ok(())
    }

    /// Address of the command port, `host:port`, bracketing IPv6 hosts.
    pub fn tpm_addr(&self) -> Option<String> {
        self.host.as_deref().map(|host| join_host_port(host, self.port))
    }

    /// Address of the platform port, `host:port+1`. `None` without a host
    /// or when the command port is the last one.
    pub fn platform_addr(&self) -> Option<String> {
        let port = self.port.checked_add(1)?;
        self.host.as_deref().map(|host| join_host_port(host, port))
    }

    /// Check a configuration that did not come through a conf string.
    ///
    /// A Unix socket path needs nothing else. A TCP host needs a command
    /// port that leaves room for the platform port.
    pub fn validate(&self) -> Result<()> {
        if self.path.is_some() {
            return Ok(());
        }
        if self.host.is_none() {
            return Err(TctiError::bad_value("mssim config has neither host nor path"));
        }
        check_port(u32::from(self.port))?;
        Ok(())
    }
}

impl FromStr for MssimConfig {
    type Err = TctiError;

    fn from_str(conf: &str) -> Result<Self> {
        let mut config = MssimConfig::default();
        config.apply_conf(conf)?;
        Ok(config)
    }
}

impl fmt::Display for MssimConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.host, &self.path) {
            (_, Some(path)) => write!(f, "path={}", path.display()),
            (Some(host), None) => write!(f, "host={},port={}", host, self.port),
            (None, None) => write!(f, "port={}", self.port),
        }
    }
}

/// A transport selection: which implementation, configured how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TctiSpec {
    /// TPM 2.0 reference simulator over TCP or a Unix socket
    Mssim(MssimConfig),
    /// Test double accepting one command code
    Fake {
        /// Command code the fake accepts
        code: u32,
    },
}

impl Default for TctiSpec {
    fn default() -> Self {
        TctiSpec::Mssim(MssimConfig::default())
    }
}

impl TctiSpec {
    /// Read the selection from the first set variable of [`TCTI_ENV_VARS`].
    pub fn from_env() -> Result<Option<Self>> {
        for var in TCTI_ENV_VARS {
            if let Ok(value) = std::env::var(var) {
                if value.trim().is_empty() {
                    continue;
                }
                debug!(var, value = %value, "TCTI selected from environment");
                return value.parse().map(Some);
            }
        }
        Ok(None)
    }

    /// Build and initialize the selected transport.
    pub fn open(&self) -> Result<TctiContext> {
        match self {
            TctiSpec::Mssim(config) => {
                Ok(TctiContext::<MssimTcti>::initialize(config.clone())?.into_dyn())
            }
            TctiSpec::Fake { code } => {
                Ok(TctiContext::<FakeTcti>::initialize(*code)?.into_dyn())
            }
        }
    }
}

impl FromStr for TctiSpec {
    type Err = TctiError;

    fn from_str(s: &str) -> Result<Self> {
        let (name, conf) = match s.split_once(':') {
            Some((name, conf)) => (name, conf),
            None => (s, ""),
        };
        match name.trim() {
            "mssim" | "swtpm" => Ok(TctiSpec::Mssim(conf.parse()?)),
            "fake" => {
                let mut code = None;
                for (key, value) in parse_key_values(conf)? {
                    match key {
                        "code" => code = Some(parse_u32(value)?),
                        other => {
                            return Err(TctiError::bad_value(format!(
                                "unknown fake key '{}'",
                                other
                            )))
                        }
                    }
                }
                Ok(TctiSpec::Fake {
                    code: code.unwrap_or(cc::POLICY_AC_SEND_SELECT),
                })
            }
            other => Err(TctiError::bad_value(format!("unknown TCTI '{}'", other))),
        }
    }
}

impl fmt::Display for TctiSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TctiSpec::Mssim(config) => write!(f, "mssim:{}", config),
            TctiSpec::Fake { code } => write!(f, "fake:code=0x{:X}", code),
        }
    }
}

/// On-disk transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TctiFile {
    /// Transport selection
    pub tcti: TctiSpec,
    /// Receive timeout in milliseconds; absent means block.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Locality to set after opening the transport.
    #[serde(default)]
    pub locality: Option<u8>,
}

impl TctiFile {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let file: TctiFile = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)
                .map_err(|e| TctiError::bad_value(format!("{}: {}", path.display(), e)))?,
            "json" => serde_json::from_str(&contents)
                .map_err(|e| TctiError::bad_value(format!("{}: {}", path.display(), e)))?,
            _ => {
                return Err(TctiError::bad_value(format!(
                    "unsupported config file extension: {}",
                    ext
                )))
            }
        };
        if let TctiSpec::Mssim(config) = &file.tcti {
            config.validate()?;
        }
        Ok(file)
    }
}

fn parse_key_values(conf: &str) -> Result<Vec<(&str, &str)>> {
    if conf.trim().is_empty() {
        return Ok(Vec::new());
    }
    conf.split(',')
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| TctiError::bad_value(format!("'{}' is not key=value", pair)))?;
            let (key, value) = (key.trim(), value.trim());
            if key.is_empty() || value.is_empty() {
                return Err(TctiError::bad_value(format!("'{}' is not key=value", pair)));
            }
            Ok((key, value))
        })
        .collect()
}

fn parse_port(value: &str) -> Result<u16> {
    let port = value
        .parse::<u32>()
        .map_err(|_| TctiError::bad_value(format!("invalid port '{}'", value)))?;
    check_port(port)
}

/// The platform port sits at `port + 1`, so the last port is unusable.
fn check_port(port: u32) -> Result<u16> {
    match u16::try_from(port) {
        Ok(port) if port != 0 && port != u16::MAX => Ok(port),
        _ => Err(TctiError::bad_value(format!("invalid port {}", port))),
    }
}

fn parse_u32(value: &str) -> Result<u32> {
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|_| TctiError::bad_value(format!("invalid number '{}'", value)))
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
