//! Configuration document: typed sections, compiled-in defaults, and
//! whole-document validation.
//!
//! A snapshot is immutable once published. Updates always replace the
//! entire document; there is no partial merge, so a reader can never see
//! a half-applied change.

mod crypto;
mod store;

pub use crypto::{machine_key, open_sealed, seal};
pub use store::ConfigStore;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid document: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("validation failed: {0}")]
    Invalid(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decryption failed: {0}")]
    Crypto(String),
}

/// Infrastructure addresses, one per monitored role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Targets {
    pub gateway: String,
    pub server: String,
    pub egress: String,
}

/// Loop cadence and client fleet layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    pub interval_seconds: u64,
    pub client_subnet: String,
    pub client_start: u32,
    pub client_count: u32,
}

/// Verification delay, secondary egress reference, and hysteresis floor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationSettings {
    pub retry_delay_seconds: f64,
    pub secondary_target: String,
    pub min_incident_duration_seconds: u64,
}

/// Evidence-capture settings, consumed by the capture collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenshotSettings {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub resize_ratio: f64,
    pub quality: u8,
}

/// Occupancy tracking knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OccupancySettings {
    pub enabled: bool,
    pub min_session_minutes: u64,
    pub batch_delay_seconds: u64,
    pub hourly_snapshot_enabled: bool,
}

/// Notification routing. Webhook URLs are opaque here; payloads belong to
/// the notification collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordSettings {
    pub enabled: bool,
    pub venue_name: String,
    pub webhook_alerts: String,
    pub webhook_occupancy: String,
    pub webhook_screenshots: String,
}

/// Host-level settings consumed by external collaborators (startup
/// registration, log pruning). Carried in the document, not acted on here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemSettings {
    pub log_retention_days: u64,
    pub start_with_os: bool,
}

/// The full configuration document. Every section is required; a document
/// missing one fails deserialization and the update is rejected whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub targets: Targets,
    pub monitor_settings: MonitorSettings,
    pub verification_settings: VerificationSettings,
    pub screenshot_settings: ScreenshotSettings,
    pub occupancy_settings: OccupancySettings,
    pub discord_settings: DiscordSettings,
    pub system_settings: SystemSettings,
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        Self {
            targets: Targets {
                gateway: "192.168.1.1".to_string(),
                server: "192.168.1.200".to_string(),
                egress: "8.8.8.8".to_string(),
            },
            monitor_settings: MonitorSettings {
                interval_seconds: 2,
                client_subnet: "192.168.1".to_string(),
                client_start: 110,
                client_count: 20,
            },
            verification_settings: VerificationSettings {
                retry_delay_seconds: 1.0,
                secondary_target: "1.1.1.1".to_string(),
                min_incident_duration_seconds: 10,
            },
            screenshot_settings: ScreenshotSettings {
                enabled: true,
                interval_minutes: 60,
                resize_ratio: 1.0,
                quality: 80,
            },
            occupancy_settings: OccupancySettings {
                enabled: true,
                min_session_minutes: 3,
                batch_delay_seconds: 30,
                hourly_snapshot_enabled: true,
            },
            discord_settings: DiscordSettings {
                enabled: false,
                venue_name: "My Internet Cafe".to_string(),
                webhook_alerts: String::new(),
                webhook_occupancy: String::new(),
                webhook_screenshots: String::new(),
            },
            system_settings: SystemSettings {
                log_retention_days: 14,
                start_with_os: true,
            },
        }
    }
}

impl ConfigSnapshot {
    /// Range-check every numeric field. The first violation rejects the
    /// whole document with the reason.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.monitor_settings;
        if !(1..=60).contains(&m.interval_seconds) {
            return Err(ConfigError::Invalid(format!(
                "monitor_settings.interval_seconds must be 1-60, got {}",
                m.interval_seconds
            )));
        }
        if !(1..=254).contains(&m.client_count) {
            return Err(ConfigError::Invalid(format!(
                "monitor_settings.client_count must be 1-254, got {}",
                m.client_count
            )));
        }
        if !(1..=254).contains(&m.client_start) {
            return Err(ConfigError::Invalid(format!(
                "monitor_settings.client_start must be 1-254, got {}",
                m.client_start
            )));
        }
        // The derived addresses must stay inside the last octet.
        if m.client_start + m.client_count - 1 > 254 {
            return Err(ConfigError::Invalid(format!(
                "monitor_settings client range {}-{} exceeds host octet 254",
                m.client_start,
                m.client_start + m.client_count - 1
            )));
        }

        let v = &self.verification_settings;
        if !(0.1..=10.0).contains(&v.retry_delay_seconds) {
            return Err(ConfigError::Invalid(format!(
                "verification_settings.retry_delay_seconds must be 0.1-10.0, got {}",
                v.retry_delay_seconds
            )));
        }
        if v.min_incident_duration_seconds > 300 {
            return Err(ConfigError::Invalid(format!(
                "verification_settings.min_incident_duration_seconds must be 0-300, got {}",
                v.min_incident_duration_seconds
            )));
        }

        let s = &self.screenshot_settings;
        if !(1..=1440).contains(&s.interval_minutes) {
            return Err(ConfigError::Invalid(format!(
                "screenshot_settings.interval_minutes must be 1-1440, got {}",
                s.interval_minutes
            )));
        }
        if !(1..=100).contains(&s.quality) {
            return Err(ConfigError::Invalid(format!(
                "screenshot_settings.quality must be 1-100, got {}",
                s.quality
            )));
        }
        if !(0.1..=1.0).contains(&s.resize_ratio) {
            return Err(ConfigError::Invalid(format!(
                "screenshot_settings.resize_ratio must be 0.1-1.0, got {}",
                s.resize_ratio
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(ConfigSnapshot::default().validate().is_ok());
    }

    #[test]
    fn interval_out_of_range_is_rejected_with_reason() {
        let mut cfg = ConfigSnapshot::default();
        cfg.monitor_settings.interval_seconds = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("interval_seconds"));

        cfg.monitor_settings.interval_seconds = 61;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn quality_out_of_range_is_rejected() {
        let mut cfg = ConfigSnapshot::default();
        cfg.screenshot_settings.quality = 0;
        assert!(cfg.validate().is_err());
        cfg.screenshot_settings.quality = 101;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn client_range_must_fit_the_host_octet() {
        let mut cfg = ConfigSnapshot::default();
        cfg.monitor_settings.client_start = 0;
        assert!(cfg.validate().is_err());

        // 251 + 5 slots would reach .255.
        cfg.monitor_settings.client_start = 251;
        cfg.monitor_settings.client_count = 5;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("client range"));

        // 250..=254 is the last legal window of five.
        cfg.monitor_settings.client_start = 250;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn missing_section_fails_deserialization() {
        let mut doc = serde_json::to_value(ConfigSnapshot::default()).unwrap();
        doc.as_object_mut().unwrap().remove("targets");
        let parsed: Result<ConfigSnapshot, _> = serde_json::from_value(doc);
        assert!(parsed.is_err());
    }

    #[test]
    fn document_round_trips_through_json() {
        let cfg = ConfigSnapshot::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ConfigSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back.targets.gateway, cfg.targets.gateway);
        assert_eq!(
            back.verification_settings.min_incident_duration_seconds,
            cfg.verification_settings.min_incident_duration_seconds
        );
    }
}
