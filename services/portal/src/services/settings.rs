use std::collections::BTreeMap;

use sqlx::PgPool;

use village_health_common::{parse_flag, AppError, SettingKey};
use village_health_database::SystemSetting;

use crate::services::AppState;

pub struct SettingsService {
    db_pool: PgPool,
}

impl SettingsService {
    pub fn new(state: &AppState) -> Self {
        Self {
            db_pool: state.db_pool.clone(),
        }
    }

    /// Every known setting, with defaults filled in for missing rows.
    pub async fn get_all(&self) -> Result<BTreeMap<String, String>, AppError> {
        let rows = sqlx::query_as::<_, SystemSetting>("SELECT * FROM system_settings")
            .fetch_all(&self.db_pool)
            .await?;

        let mut settings: BTreeMap<String, String> = SettingKey::ALL
            .iter()
            .map(|key| (key.as_str().to_string(), key.default_value().to_string()))
            .collect();

        for row in rows {
            if settings.contains_key(&row.setting_key) {
                settings.insert(row.setting_key, row.setting_value);
            }
        }

        Ok(settings)
    }

    pub async fn get(&self, key: SettingKey) -> Result<String, AppError> {
        let value = sqlx::query_scalar::<_, String>(
            "SELECT setting_value FROM system_settings WHERE setting_key = $1",
        )
        .bind(key.as_str())
        .fetch_optional(&self.db_pool)
        .await?;

        Ok(value.unwrap_or_else(|| key.default_value().to_string()))
    }

    pub async fn get_flag(&self, key: SettingKey) -> Result<bool, AppError> {
        let value = self.get(key).await?;
        Ok(parse_flag(&value)
            .or_else(|| parse_flag(key.default_value()))
            .unwrap_or(false))
    }

    pub async fn site_name(&self) -> Result<String, AppError> {
        self.get(SettingKey::SiteName).await
    }

    pub async fn maintenance_mode(&self) -> Result<bool, AppError> {
        self.get_flag(SettingKey::MaintenanceMode).await
    }

    pub async fn notifications_enabled(&self) -> Result<bool, AppError> {
        self.get_flag(SettingKey::NotificationsEnabled).await
    }

    pub async fn password_min_length(&self) -> Result<usize, AppError> {
        let value = self.get(SettingKey::PasswordMinLength).await?;
        Ok(value.parse().unwrap_or(6))
    }

    /// Validates every submitted pair first, then upserts them in one
    /// transaction. Later duplicates of a key win. Returns the keys written.
    pub async fn update(&self, admin_id: i64, pairs: &[(String, String)]) -> Result<Vec<SettingKey>, AppError> {
        let changes = normalize_submission(pairs)?;
        if changes.is_empty() {
            return Err(AppError::Validation("No settings were submitted".to_string()));
        }

        let mut tx = self.db_pool.begin().await?;
        for (key, value) in &changes {
            sqlx::query(
                r#"
                INSERT INTO system_settings (setting_key, setting_value, updated_by, updated_at)
                VALUES ($1, $2, $3, NOW())
                ON CONFLICT (setting_key)
                DO UPDATE SET setting_value = EXCLUDED.setting_value,
                              updated_by = EXCLUDED.updated_by,
                              updated_at = NOW()
                "#,
            )
            .bind(key.as_str())
            .bind(value)
            .bind(admin_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::info!("Admin {} updated {} setting(s)", admin_id, changes.len());
        Ok(changes.into_keys().collect())
    }
}

/// Maps raw form pairs onto known keys. Form plumbing fields (anything starting
/// with `_`) are ignored.
pub fn normalize_submission(pairs: &[(String, String)]) -> Result<BTreeMap<SettingKey, String>, AppError> {
    let mut changes = BTreeMap::new();
    for (raw_key, raw_value) in pairs {
        if raw_key.starts_with('_') {
            continue;
        }
        let key: SettingKey = raw_key.parse()?;
        changes.insert(key, key.normalize(raw_value)?);
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn checkbox_after_hidden_field_wins() {
        let changes = normalize_submission(&pairs(&[
            ("maintenance_mode", "false"),
            ("maintenance_mode", "on"),
            ("_csrf", "ignored"),
        ]))
        .unwrap();
        assert_eq!(changes.get(&SettingKey::MaintenanceMode).map(String::as_str), Some("true"));
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn one_bad_value_rejects_the_whole_submission() {
        let result = normalize_submission(&pairs(&[
            ("site_name", "Rampur Health"),
            ("password_min_length", "3"),
        ]));
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn unknown_keys_are_an_error() {
        assert!(normalize_submission(&pairs(&[("smtp_host", "x")])).is_err());
    }
}
