//! Stand-in auth service: verifies bearer tokens handed to the relay at
//! admission time and resolves them to a `userId`.
//!
//! The real product's login flow is out of scope (see SPEC_FULL.md S6); this
//! module satisfies the "a JWT validator is sufficient" interface contract
//! with HS256 tokens carrying a `sub` claim, the same token shape the
//! endpoint embeds in its pairing QR.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: usize,
}

/// Verifies `token` and returns the `userId` it carries, or `None` if the
/// token is malformed, expired, or signed with a different secret.
pub fn verify_token(token: &str, jwt_secret: &str) -> Option<String> {
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret.as_bytes()),
        &Validation::default(),
    )
    .ok()?;
    Some(data.claims.sub)
}

/// Mints a bearer token for `user_id`, valid for `ttl_secs` seconds. Used by
/// test fixtures and the `pair`/`claim` CLI subcommands to self-issue a token
/// when no external auth service is configured.
pub fn issue_token(user_id: &str, jwt_secret: &str, ttl_secs: u64) -> anyhow::Result<String> {
    let exp = chrono::Utc::now().timestamp() as usize + ttl_secs as usize;
    let claims = Claims {
        sub: user_id.to_string(),
        exp,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(jwt_secret.as_bytes()),
    )?;
    Ok(token)
}
