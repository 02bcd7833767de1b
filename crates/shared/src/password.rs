use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};

use crate::tokens::TokenError;

pub const MIN_PASSWORD_LENGTH: usize = 8;

pub fn validate_password_strength(password: &str) -> Result<(), TokenError> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(TokenError::WeakPassword);
    }
    Ok(())
}

/// Hash a password with Argon2id and a random salt (PHC string format)
pub fn hash_password(password: &str) -> Result<String, TokenError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| TokenError::Hashing(e.to_string()))
}

/// Hash off the async runtime; Argon2 is deliberately slow
pub async fn hash_password_blocking(password: String) -> Result<String, TokenError> {
    tokio::task::spawn_blocking(move || hash_password(&password))
        .await
        .map_err(|e| TokenError::Hashing(e.to_string()))?
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}
