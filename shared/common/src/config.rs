use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn connection_string(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}",
            self.username, self.password, self.host, self.port, self.database
        )
    }

    pub fn from_env() -> Self {
        Self {
            host: env_or("DATABASE_HOST", "localhost"),
            port: env_parse("DATABASE_PORT", 5432),
            username: env_or("DATABASE_USERNAME", "village_health"),
            password: env_or("DATABASE_PASSWORD", "village_health_password"),
            database: env_or("DATABASE_NAME", "village_health"),
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub database: u8,
}

impl RedisConfig {
    pub fn connection_string(&self) -> String {
        match &self.password {
            Some(password) => format!("redis://:{}@{}:{}/{}", password, self.host, self.port, self.database),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }

    pub fn from_env() -> Self {
        Self {
            host: env_or("REDIS_HOST", "localhost"),
            port: env_parse("REDIS_PORT", 6379),
            password: std::env::var("REDIS_PASSWORD").ok().filter(|p| !p.is_empty()),
            database: env_parse("REDIS_DATABASE", 0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub expiration_hours: u64,
    pub issuer: String,
}

impl JwtConfig {
    pub fn from_env() -> Self {
        Self {
            secret: env_or("JWT_SECRET", "dev-secret-key-change-in-production"),
            expiration_hours: env_parse("JWT_EXPIRATION_HOURS", 12),
            issuer: env_or("JWT_ISSUER", "village-health-connect"),
        }
    }

    pub fn expiration_seconds(&self) -> u64 {
        self.expiration_hours * 3600
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            host: env_or("SERVER_HOST", "0.0.0.0"),
            port: env_parse("SERVER_PORT", 8000),
            cors_origins: env_or("CORS_ORIGINS", "http://localhost:8000")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

pub fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Invalid {} value '{}', using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_url_is_postgres() {
        let config = DatabaseConfig {
            host: "db".to_string(),
            port: 5433,
            username: "vh".to_string(),
            password: "secret".to_string(),
            database: "village".to_string(),
            max_connections: 4,
        };
        assert_eq!(config.connection_string(), "postgresql://vh:secret@db:5433/village");
    }

    #[test]
    fn redis_url_with_and_without_password() {
        let mut config = RedisConfig {
            host: "cache".to_string(),
            port: 6379,
            password: None,
            database: 2,
        };
        assert_eq!(config.connection_string(), "redis://cache:6379/2");
        config.password = Some("pw".to_string());
        assert_eq!(config.connection_string(), "redis://:pw@cache:6379/2");
    }

    #[test]
    fn unparsable_values_fall_back() {
        std::env::set_var("VH_TEST_BAD_PORT", "not-a-number");
        assert_eq!(env_parse::<u16>("VH_TEST_BAD_PORT", 8000), 8000);
        std::env::remove_var("VH_TEST_BAD_PORT");
    }
}
