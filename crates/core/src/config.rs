//! Configuration management for Rollcall.
//!
//! Loaded once at process start from TOML. Every section has defaults so a
//! partial file is valid:
//!
//! ```toml
//! [ca]
//! key_path = "ca.pem"
//! validity_secs = 2592000
//!
//! [checkin]
//! on_time_grace_minutes = 5
//! absent_after_minutes = 60
//! early_window_minutes = 120
//!
//! [store]
//! path = "attendance.db"
//! ```

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default certificate lifetime: 30 days.
pub const DEFAULT_VALIDITY_SECS: u64 = 30 * 24 * 60 * 60;

/// Default handshake completion window (30 seconds).
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ca: CaConfig,
    pub checkin: CheckinConfig,
    pub session: SessionConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfig {
    /// PEM file holding the CA signing key
    pub key_path: PathBuf,
    /// Lifetime added to the issuance instant. Zero makes certificates
    /// expire the second they are issued.
    pub validity_secs: u64,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            key_path: PathBuf::from("ca.pem"),
            validity_secs: DEFAULT_VALIDITY_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckinConfig {
    /// Minutes after the scheduled start still counted as on time
    pub on_time_grace_minutes: i64,
    /// Minutes after the scheduled start past which a first check-in is
    /// recorded as absent
    pub absent_after_minutes: i64,
    /// How long before the scheduled start a check-in is accepted at all
    pub early_window_minutes: i64,
    pub morning_start: NaiveTime,
    pub afternoon_start: NaiveTime,
    pub evening_start: NaiveTime,
}

impl Default for CheckinConfig {
    fn default() -> Self {
        Self {
            on_time_grace_minutes: 5,
            absent_after_minutes: 60,
            early_window_minutes: 120,
            morning_start: hm(8, 0),
            afternoon_start: hm(13, 0),
            evening_start: hm(18, 0),
        }
    }
}

/// AEAD construction used for session traffic. Both use a 12-byte nonce and
/// a 16-byte tag, so the wire format does not change between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AeadAlgorithm {
    #[default]
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub aead: AeadAlgorithm,
    pub handshake_timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            aead: AeadAlgorithm::default(),
            handshake_timeout_secs: DEFAULT_HANDSHAKE_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("attendance.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    #[cfg(feature = "config-file")]
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    #[cfg(feature = "config-file")]
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Self::default()
    }

    /// Reject settings the check-in policy cannot honour.
    pub fn validate(&self) -> Result<()> {
        let checkin = &self.checkin;
        if checkin.on_time_grace_minutes < 0 {
            return Err(Error::Config(
                "checkin.on_time_grace_minutes must not be negative".to_string(),
            ));
        }
        if checkin.absent_after_minutes < checkin.on_time_grace_minutes {
            return Err(Error::Config(format!(
                "checkin.absent_after_minutes ({}) must be >= on_time_grace_minutes ({})",
                checkin.absent_after_minutes, checkin.on_time_grace_minutes
            )));
        }
        if checkin.early_window_minutes < 0 {
            return Err(Error::Config(
                "checkin.early_window_minutes must not be negative".to_string(),
            ));
        }
        if self.session.handshake_timeout_secs == 0 {
            return Err(Error::Config(
                "session.handshake_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve a possibly relative path against the directory holding the
    /// config file.
    pub fn resolve_path(base: &Path, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base.join(path)
        }
    }
}

fn hm(hour: u32, minute: u32) -> NaiveTime {
    NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)
}
