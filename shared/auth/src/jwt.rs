use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation, Algorithm};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use chrono::{Utc, Duration};
use village_health_common::{JwtConfig, AppError};

/// Session token claims. Only identifiers travel in the token; role, name and
/// village are looked up on every request so profile edits and role changes
/// take effect immediately.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String, // user id
    pub sid: String, // session id registered in Redis
    pub exp: i64,
    pub iat: i64,
    pub iss: String,
}

impl Claims {
    pub fn new(user_id: i64, config: &JwtConfig) -> Self {
        let now = Utc::now();
        let exp = now + Duration::hours(config.expiration_hours as i64);

        Self {
            sub: user_id.to_string(),
            sid: Uuid::new_v4().to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            iss: config.issuer.clone(),
        }
    }

    pub fn user_id(&self) -> Result<i64, AppError> {
        self.sub
            .parse()
            .map_err(|_| AppError::Authentication("Invalid user ID in token".to_string()))
    }
}

#[derive(Clone)]
pub struct JwtService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtService {
    pub fn new(config: &JwtConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_issuer(&[config.issuer.as_str()]);

        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_ref()),
            decoding_key: DecodingKey::from_secret(config.secret.as_ref()),
            validation,
        }
    }

    pub fn generate_token(&self, claims: &Claims) -> Result<String, AppError> {
        encode(&Header::default(), claims, &self.encoding_key)
            .map_err(|e| AppError::Internal(format!("Failed to generate token: {}", e)))
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, AppError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| AppError::Authentication(format!("Invalid token: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> JwtConfig {
        JwtConfig {
            secret: "test-secret".to_string(),
            expiration_hours: 1,
            issuer: "village-health-connect".to_string(),
        }
    }

    #[test]
    fn token_carries_user_and_session() {
        let service = JwtService::new(&config());
        let claims = Claims::new(42, &config());
        let token = service.generate_token(&claims).unwrap();

        let decoded = service.validate_token(&token).unwrap();
        assert_eq!(decoded.user_id().unwrap(), 42);
        assert_eq!(decoded.sid, claims.sid);
    }

    #[test]
    fn tokens_from_another_secret_are_rejected() {
        let other = JwtService::new(&JwtConfig {
            secret: "other-secret".to_string(),
            ..config()
        });
        let token = other.generate_token(&Claims::new(7, &config())).unwrap();

        let service = JwtService::new(&config());
        assert!(matches!(service.validate_token(&token), Err(AppError::Authentication(_))));
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let service = JwtService::new(&config());
        let mut claims = Claims::new(7, &config());
        claims.exp = Utc::now().timestamp() - 3600;
        let token = service.generate_token(&claims).unwrap();

        assert!(service.validate_token(&token).is_err());
    }

    #[test]
    fn every_login_gets_a_fresh_session_id() {
        let a = Claims::new(1, &config());
        let b = Claims::new(1, &config());
        assert_ne!(a.sid, b.sid);
    }
}
