use redis::{aio::MultiplexedConnection, AsyncCommands, Client};
use crate::{RedisConfig, AppError};

/// Server-side session registry. A session is valid only while its key exists,
/// so logging out or expiring the key revokes the token immediately.
#[derive(Clone)]
pub struct RedisService {
    client: Client,
}

impl RedisService {
    pub async fn new(config: &RedisConfig) -> Result<Self, AppError> {
        let service = Self::lazy(config)?;
        service.health_check().await?;

        tracing::info!("Redis connection established");
        Ok(service)
    }

    /// Builds the service without touching the network; connections are opened
    /// per command.
    pub fn lazy(config: &RedisConfig) -> Result<Self, AppError> {
        let client = Client::open(config.connection_string())?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<MultiplexedConnection, AppError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    // Session management
    pub async fn set_session(&self, session_id: &str, user_id: i64, expiry_seconds: u64) -> Result<(), AppError> {
        let mut conn = self.connection().await?;
        conn.set_ex::<_, _, ()>(RedisKeys::session(session_id), user_id, expiry_seconds)
            .await?;
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Option<i64>, AppError> {
        let mut conn = self.connection().await?;
        Ok(conn.get(RedisKeys::session(session_id)).await?)
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<(), AppError> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(RedisKeys::session(session_id)).await?;
        Ok(())
    }

    // Rate limiting
    pub async fn check_rate_limit(&self, key: &str, limit: u32, window_seconds: u64) -> Result<bool, AppError> {
        let mut conn = self.connection().await?;
        let current: u32 = conn.incr(key, 1).await?;

        if current == 1 {
            conn.expire::<_, ()>(key, window_seconds as i64).await?;
        }

        Ok(current <= limit)
    }

    pub async fn reset_rate_limit(&self, key: &str) -> Result<(), AppError> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    // Health check
    pub async fn health_check(&self) -> Result<(), AppError> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

// Redis key builders
pub struct RedisKeys;

impl RedisKeys {
    pub fn session(session_id: &str) -> String {
        format!("session:{}", session_id)
    }

    pub fn login_attempts(email: &str) -> String {
        format!("rate_limit:login:{}", email.trim().to_ascii_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_attempt_keys_ignore_case() {
        assert_eq!(
            RedisKeys::login_attempts(" Asha@Example.org "),
            "rate_limit:login:asha@example.org"
        );
    }

    #[test]
    fn lazy_client_does_not_connect() {
        let config = RedisConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            password: None,
            database: 0,
        };
        assert!(RedisService::lazy(&config).is_ok());
    }
}
