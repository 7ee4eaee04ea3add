use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use jwt::{SignWithKey, VerifyWithKey};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::AppError;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("invalid signing key")]
    Key,

    #[error("malformed or forged token: {0}")]
    Invalid(#[from] jwt::Error),

    #[error("token expired")]
    Expired,
}

impl From<TokenError> for AppError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Key => AppError::Internal("token signing key rejected".into()),
            TokenError::Invalid(_) | TokenError::Expired => AppError::Unauthenticated,
        }
    }
}

/// Claims carried by a bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i64,
    pub is_admin: bool,
    /// Expiry, seconds since the Unix epoch.
    pub exp: i64,
}

/// Mints and verifies HMAC-SHA256 signed bearer tokens.
pub struct TokenSigner {
    key: Hmac<Sha256>,
    lifetime: Duration,
}

impl TokenSigner {
    pub fn new(secret: &[u8], lifetime: Duration) -> Result<Self, TokenError> {
        let key = Hmac::new_from_slice(secret).map_err(|_| TokenError::Key)?;
        Ok(Self { key, lifetime })
    }

    /// Signer with a fresh random key; tokens do not survive a restart.
    pub fn ephemeral(lifetime: Duration) -> Result<Self, TokenError> {
        let secret: [u8; 32] = rand::thread_rng().gen();
        Self::new(&secret, lifetime)
    }

    pub fn mint(&self, user_id: i64, is_admin: bool) -> Result<(String, i64), TokenError> {
        let exp = (Utc::now() + self.lifetime).timestamp();
        let claims = Claims {
            user_id,
            is_admin,
            exp,
        };
        let token = claims.sign_with_key(&self.key)?;
        Ok((token, exp))
    }

    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let claims: Claims = token.verify_with_key(&self.key)?;
        if claims.exp <= Utc::now().timestamp() {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> TokenSigner {
        TokenSigner::new(b"test-secret", Duration::hours(1)).unwrap()
    }

    #[test]
    fn minted_token_verifies() {
        let signer = signer();
        let (token, exp) = signer.mint(42, true).unwrap();
        let claims = signer.verify(&token).unwrap();
        assert_eq!(
            claims,
            Claims {
                user_id: 42,
                is_admin: true,
                exp
            }
        );
    }

    #[test]
    fn token_from_other_key_is_rejected() {
        let (token, _) = signer().mint(1, false).unwrap();
        let other = TokenSigner::new(b"other-secret", Duration::hours(1)).unwrap();
        assert!(matches!(other.verify(&token), Err(TokenError::Invalid(_))));
    }

    #[test]
    fn expired_token_is_rejected() {
        let signer = TokenSigner::new(b"test-secret", Duration::seconds(-5)).unwrap();
        let (token, _) = signer.mint(1, false).unwrap();
        assert!(matches!(signer.verify(&token), Err(TokenError::Expired)));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(signer().verify("not.a.token").is_err());
        assert!(signer().verify("").is_err());
    }

    #[test]
    fn swapped_claims_are_rejected() {
        let signer = signer();
        let (token, _) = signer.mint(7, false).unwrap();
        let other = TokenSigner::new(b"other-secret", Duration::hours(1)).unwrap();
        let (admin_token, _) = other.mint(7, true).unwrap();

        let mut parts: Vec<&str> = token.split('.').collect();
        let admin_claims = admin_token.split('.').nth(1).unwrap();
        parts[1] = admin_claims;
        assert!(signer.verify(&parts.join(".")).is_err());
    }
}
