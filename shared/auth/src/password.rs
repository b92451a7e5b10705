use bcrypt::{hash, verify, DEFAULT_COST};
use village_health_common::AppError;

pub struct PasswordService;

impl PasswordService {
    pub fn hash_password(password: &str) -> Result<String, AppError> {
        hash(password, DEFAULT_COST)
            .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))
    }

    /// A malformed stored hash counts as a mismatch so login failures stay generic.
    pub fn verify_password(password: &str, hash: &str) -> bool {
        verify(password, hash).unwrap_or(false)
    }

    pub fn validate_password_strength(password: &str, min_length: usize) -> Result<(), AppError> {
        if password.chars().count() < min_length {
            return Err(AppError::Validation(format!(
                "Password must be at least {} characters long",
                min_length
            )));
        }

        let has_letter = password.chars().any(|c| c.is_alphabetic());
        let has_digit = password.chars().any(|c| c.is_numeric());

        if !has_letter || !has_digit {
            return Err(AppError::Validation(
                "Password must contain both letters and digits".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify() {
        let hashed = PasswordService::hash_password("water2024").unwrap();
        assert!(PasswordService::verify_password("water2024", &hashed));
        assert!(!PasswordService::verify_password("water2025", &hashed));
    }

    #[test]
    fn garbage_hash_never_verifies() {
        assert!(!PasswordService::verify_password("anything", "not-a-bcrypt-hash"));
    }

    #[test]
    fn strength_follows_configured_length() {
        assert!(PasswordService::validate_password_strength("abc123", 6).is_ok());
        assert!(PasswordService::validate_password_strength("abc123", 8).is_err());
        assert!(PasswordService::validate_password_strength("abcdefgh", 6).is_err());
        assert!(PasswordService::validate_password_strength("12345678", 6).is_err());
    }
}
