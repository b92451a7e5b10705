use village_health_common::{
    env_or, env_parse, DatabaseConfig, JwtConfig, RedisConfig, ServerConfig,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub session: SessionConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub cookie_name: String,
    pub flash_cookie_name: String,
    pub secure_cookies: bool,
    pub max_login_attempts: u32,
    pub login_window_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub uploads_dir: String,
    pub backups_dir: String,
    pub max_photo_bytes: usize,
    pub allowed_photo_extensions: Vec<String>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, Box<dyn std::error::Error>> {
        let config = Self {
            server: ServerConfig::from_env(),
            database: DatabaseConfig::from_env(),
            redis: RedisConfig::from_env(),
            jwt: JwtConfig::from_env(),
            session: SessionConfig {
                cookie_name: env_or("SESSION_COOKIE_NAME", "vhc_session"),
                flash_cookie_name: env_or("FLASH_COOKIE_NAME", "vhc_flash"),
                secure_cookies: env_parse("SESSION_SECURE_COOKIES", false),
                max_login_attempts: env_parse("LOGIN_MAX_ATTEMPTS", 10),
                login_window_seconds: env_parse("LOGIN_WINDOW_SECONDS", 900),
            },
            storage: StorageConfig {
                uploads_dir: env_or("STORAGE_UPLOADS_DIR", "uploads"),
                backups_dir: env_or("STORAGE_BACKUPS_DIR", "backups"),
                max_photo_bytes: env_parse("STORAGE_MAX_PHOTO_MB", 5usize) * 1024 * 1024,
                allowed_photo_extensions: env_or("STORAGE_PHOTO_EXTENSIONS", "jpg,jpeg,png,gif,webp")
                    .split(',')
                    .map(|s| s.trim().to_ascii_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
        };

        if config.jwt.secret.len() < 16 {
            return Err("JWT_SECRET must be at least 16 characters".into());
        }

        Ok(config)
    }
}
