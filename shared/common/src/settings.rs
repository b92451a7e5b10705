use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::AppError;

/// Runtime settings stored in `system_settings`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SettingKey {
    SiteName,
    MaintenanceMode,
    NotificationsEnabled,
    PasswordMinLength,
}

impl SettingKey {
    pub const ALL: [SettingKey; 4] = [
        SettingKey::SiteName,
        SettingKey::MaintenanceMode,
        SettingKey::NotificationsEnabled,
        SettingKey::PasswordMinLength,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::SiteName => "site_name",
            SettingKey::MaintenanceMode => "maintenance_mode",
            SettingKey::NotificationsEnabled => "notifications_enabled",
            SettingKey::PasswordMinLength => "password_min_length",
        }
    }

    pub fn default_value(&self) -> &'static str {
        match self {
            SettingKey::SiteName => "Village Health Connect",
            SettingKey::MaintenanceMode => "false",
            SettingKey::NotificationsEnabled => "true",
            SettingKey::PasswordMinLength => "6",
        }
    }

    /// Checks a submitted value and returns its canonical stored form.
    pub fn normalize(&self, raw: &str) -> Result<String, AppError> {
        let value = raw.trim();
        match self {
            SettingKey::SiteName => {
                if value.is_empty() || value.chars().count() > 100 {
                    return Err(AppError::Validation(
                        "Site name must be between 1 and 100 characters".to_string(),
                    ));
                }
                Ok(value.to_string())
            }
            SettingKey::MaintenanceMode | SettingKey::NotificationsEnabled => parse_flag(value)
                .map(|flag| flag.to_string())
                .ok_or_else(|| AppError::Validation(format!("{} must be true or false", self))),
            SettingKey::PasswordMinLength => match value.parse::<u32>() {
                Ok(n) if (6..=64).contains(&n) => Ok(n.to_string()),
                _ => Err(AppError::Validation(
                    "password_min_length must be a whole number between 6 and 64".to_string(),
                )),
            },
        }
    }
}

impl FromStr for SettingKey {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SettingKey::ALL
            .iter()
            .copied()
            .find(|key| key.as_str() == s.trim())
            .ok_or_else(|| AppError::Validation(format!("Unknown setting '{}'", s)))
    }
}

impl fmt::Display for SettingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts the usual checkbox/toggle spellings.
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        for key in SettingKey::ALL {
            assert_eq!(key.normalize(key.default_value()).unwrap(), key.default_value());
        }
    }

    #[test]
    fn toggles_accept_checkbox_values() {
        assert_eq!(SettingKey::MaintenanceMode.normalize("on").unwrap(), "true");
        assert_eq!(SettingKey::NotificationsEnabled.normalize("0").unwrap(), "false");
        assert!(SettingKey::MaintenanceMode.normalize("maybe").is_err());
    }

    #[test]
    fn password_length_is_bounded() {
        assert!(SettingKey::PasswordMinLength.normalize("5").is_err());
        assert!(SettingKey::PasswordMinLength.normalize("65").is_err());
        assert!(SettingKey::PasswordMinLength.normalize("-8").is_err());
        assert_eq!(SettingKey::PasswordMinLength.normalize(" 10 ").unwrap(), "10");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!("smtp_host".parse::<SettingKey>().is_err());
        assert_eq!("site_name".parse::<SettingKey>().unwrap(), SettingKey::SiteName);
    }
}
