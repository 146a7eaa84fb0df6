use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Bearer tokens are valid for 24 hours from issuance.
pub const TOKEN_TTL_HOURS: i64 = 24;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String, // operator id
    pub username: String,
    pub iat: usize,
    pub exp: usize,
}

/// Identity carried by a valid token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenIdentity {
    pub operator_id: i64,
    pub username: String,
}

/// Issue a signed bearer token for an operator.
pub fn issue_token(
    secret: &str,
    operator_id: i64,
    username: &str,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = chrono::Utc::now();
    let expiration = now + chrono::Duration::hours(TOKEN_TTL_HOURS);

    let claims = Claims {
        sub: operator_id.to_string(),
        username: username.to_string(),
        iat: now.timestamp() as usize,
        exp: expiration.timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
}

/// Decode and verify a token. Every failure collapses to `None`.
pub fn validate_token(secret: &str, token: &str) -> Option<TokenIdentity> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map_err(|e| tracing::debug!("Rejected token: {e}"))
    .ok()?;

    let operator_id = data.claims.sub.parse().ok()?;
    Some(TokenIdentity {
        operator_id,
        username: data.claims.username,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test-secret";

    #[test]
    fn test_issue_validate_token() {
        let token = issue_token(SECRET, 7, "alice").unwrap();
        let identity = validate_token(SECRET, &token).unwrap();
        assert_eq!(identity.operator_id, 7);
        assert_eq!(identity.username, "alice");
    }

    #[test]
    fn test_wrong_secret_and_garbage_rejected() {
        let token = issue_token(SECRET, 7, "alice").unwrap();
        assert!(validate_token("other-secret", &token).is_none());
        assert!(validate_token(SECRET, "not.a.token").is_none());

        // Splice another operator's claims under alice's signature
        let other = issue_token(SECRET, 1, "root").unwrap();
        let parts: Vec<&str> = token.split('.').collect();
        let other_parts: Vec<&str> = other.split('.').collect();
        let tampered = format!("{}.{}.{}", parts[0], other_parts[1], parts[2]);
        assert!(validate_token(SECRET, &tampered).is_none());
    }

    #[test]
    fn test_expired_token_rejected() {
        let past = (chrono::Utc::now() - chrono::Duration::hours(25)).timestamp() as usize;
        let claims = Claims {
            sub: "7".into(),
            username: "alice".into(),
            iat: past,
            exp: past + 3600,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        assert!(validate_token(SECRET, &token).is_none());
    }

    #[test]
    fn test_expiry_is_24_hours() {
        let token = issue_token(SECRET, 1, "bob").unwrap();
        let data = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(SECRET.as_bytes()),
            &Validation::default(),
        )
        .unwrap();
        assert_eq!(data.claims.exp - data.claims.iat, 24 * 3600);
    }
}
