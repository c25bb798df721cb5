//! Signed bearer tokens: a short-lived access token and a long-lived
//! refresh token, each signed and verified with its own secret.
//!
//! The codec owns signature and time-claim checks only. Whether the
//! claims inside a valid token are usable (non-empty user id and name) is
//! the session layer's decision, not the codec's.

use josekit::jws::alg::hmac::{HmacJwsAlgorithm, HmacJwsSigner, HmacJwsVerifier};
use josekit::jws::JwsHeader;
use josekit::jwt::{self, JwtPayload, JwtPayloadValidator};
use josekit::JoseError;
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Access tokens live for fifteen minutes.
pub const ACCESS_TTL_SECS: u64 = 15 * 60;

/// Refresh tokens live for seven days.
pub const REFRESH_TTL_SECS: u64 = 7 * 24 * 3600;

const CLAIM_EMAIL: &str = "email";
const CLAIM_NAME: &str = "name";

#[derive(Debug, Error)]
pub enum TokenError {
    /// Key material could not be turned into an HS256 signer/verifier.
    #[error("Token key setup failed: {0}")]
    KeySetup(#[source] JoseError),
    /// The signer rejected the payload.
    #[error("Token signing failed: {0}")]
    Signing(#[source] JoseError),
    /// Signature or time-claim verification failed.
    #[error("Invalid token: {0}")]
    Invalid(#[source] JoseError),
}

/// The two cooperating token classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    pub fn ttl(self) -> Duration {
        match self {
            TokenKind::Access => Duration::from_secs(ACCESS_TTL_SECS),
            TokenKind::Refresh => Duration::from_secs(REFRESH_TTL_SECS),
        }
    }

    /// Cookie each kind rides on. The names are part of the API contract.
    pub fn cookie_name(self) -> &'static str {
        match self {
            TokenKind::Access => "token",
            TokenKind::Refresh => "refreshToken",
        }
    }
}

/// Identity carried inside both token kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenClaims {
    pub user_id: String,
    pub email: String,
    pub name: String,
}

struct KindKeys {
    signer: HmacJwsSigner,
    verifier: HmacJwsVerifier,
}

impl KindKeys {
    /// Secrets are run through SHA-256 so any configured secret length
    /// yields a valid HS256 key.
    fn derive(secret: &str) -> Result<Self, TokenError> {
        let key = Sha256::digest(secret.as_bytes());
        Ok(KindKeys {
            signer: HmacJwsAlgorithm::Hs256
                .signer_from_bytes(key.as_slice())
                .map_err(TokenError::KeySetup)?,
            verifier: HmacJwsAlgorithm::Hs256
                .verifier_from_bytes(key.as_slice())
                .map_err(TokenError::KeySetup)?,
        })
    }
}

/// HS256 signer/verifier pairs, one per token kind. Verification selects
/// the key by kind, so a token signed under one kind's secret can never
/// verify under the other (given distinct secrets).
pub struct TokenCodec {
    access: KindKeys,
    refresh: KindKeys,
}

impl TokenCodec {
    pub fn new(access_secret: &str, refresh_secret: &str) -> Result<Self, TokenError> {
        Ok(TokenCodec {
            access: KindKeys::derive(access_secret)?,
            refresh: KindKeys::derive(refresh_secret)?,
        })
    }

    fn keys(&self, kind: TokenKind) -> &KindKeys {
        match kind {
            TokenKind::Access => &self.access,
            TokenKind::Refresh => &self.refresh,
        }
    }

    /// Sign a token of the given kind, expiring `kind.ttl()` after `now`.
    /// A random `jti` makes every issued token a distinct string, so token
    /// values stay usable as lookup keys even within one clock second.
    pub fn issue(
        &self,
        kind: TokenKind,
        claims: &TokenClaims,
        now: SystemTime,
    ) -> Result<String, TokenError> {
        let mut payload = JwtPayload::new();
        payload.set_subject(claims.user_id.clone());
        payload
            .set_claim(CLAIM_EMAIL, Some(Value::String(claims.email.clone())))
            .map_err(TokenError::Signing)?;
        payload
            .set_claim(CLAIM_NAME, Some(Value::String(claims.name.clone())))
            .map_err(TokenError::Signing)?;
        payload.set_jwt_id(fresh_jti());
        payload.set_issued_at(&now);
        payload.set_expires_at(&(now + kind.ttl()));

        jwt::encode_with_signer(&payload, &JwsHeader::new(), &self.keys(kind).signer)
            .map_err(TokenError::Signing)
    }

    /// Verify signature and time claims with the secret matching `kind`,
    /// returning the identity claims as-is. Empty claim fields are passed
    /// through untouched.
    pub fn verify(
        &self,
        kind: TokenKind,
        token: &str,
        now: SystemTime,
    ) -> Result<TokenClaims, TokenError> {
        let (payload, _header) = jwt::decode_with_verifier(token, &self.keys(kind).verifier)
            .map_err(TokenError::Invalid)?;

        // decode_with_verifier checks the signature only; expiry is a
        // separate validation pass.
        let mut validator = JwtPayloadValidator::new();
        validator.set_base_time(now);
        validator.validate(&payload).map_err(TokenError::Invalid)?;

        Ok(TokenClaims {
            user_id: payload.subject().unwrap_or_default().to_string(),
            email: claim_str(&payload, CLAIM_EMAIL),
            name: claim_str(&payload, CLAIM_NAME),
        })
    }
}

fn claim_str(payload: &JwtPayload, key: &str) -> String {
    payload
        .claim(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn fresh_jti() -> String {
    let mut bytes = [0u8; 8];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn test_codec() -> TokenCodec {
        TokenCodec::new("access-secret-for-tests", "refresh-secret-for-tests").unwrap()
    }

    fn neo() -> TokenClaims {
        TokenClaims {
            user_id: "507f1f77bcf86cd799439011".to_string(),
            email: "neo@matrix.com".to_string(),
            name: "Neo".to_string(),
        }
    }

    #[test]
    fn round_trip_preserves_claims() {
        let codec = test_codec();
        let now = SystemTime::now();

        for kind in [TokenKind::Access, TokenKind::Refresh] {
            let token = codec.issue(kind, &neo(), now).unwrap();
            let claims = codec.verify(kind, &token, now).unwrap();
            assert_eq!(claims, neo());
        }
    }

    #[test]
    fn kinds_do_not_cross_verify() {
        let codec = test_codec();
        let now = SystemTime::now();

        let access = codec.issue(TokenKind::Access, &neo(), now).unwrap();
        assert!(matches!(
            codec.verify(TokenKind::Refresh, &access, now),
            Err(TokenError::Invalid(_))
        ));

        let refresh = codec.issue(TokenKind::Refresh, &neo(), now).unwrap();
        assert!(matches!(
            codec.verify(TokenKind::Access, &refresh, now),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn expired_token_is_rejected() {
        let codec = test_codec();
        let issued = SystemTime::now() - Duration::from_secs(ACCESS_TTL_SECS + 60);

        let token = codec.issue(TokenKind::Access, &neo(), issued).unwrap();
        assert!(matches!(
            codec.verify(TokenKind::Access, &token, SystemTime::now()),
            Err(TokenError::Invalid(_))
        ));

        // The same age is fine for a refresh token.
        let refresh = codec.issue(TokenKind::Refresh, &neo(), issued).unwrap();
        assert!(codec
            .verify(TokenKind::Refresh, &refresh, SystemTime::now())
            .is_ok());
    }

    #[test]
    fn tampered_token_is_rejected() {
        let codec = test_codec();
        let now = SystemTime::now();
        let token = codec.issue(TokenKind::Access, &neo(), now).unwrap();

        let mut tampered = token.into_bytes();
        let mid = tampered.len() / 2;
        tampered[mid] = if tampered[mid] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(tampered).unwrap();

        assert!(codec.verify(TokenKind::Access, &tampered, now).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let codec = test_codec();
        let other = TokenCodec::new("some-other-secret", "refresh-secret-for-tests").unwrap();
        let now = SystemTime::now();

        let token = codec.issue(TokenKind::Access, &neo(), now).unwrap();
        assert!(matches!(
            other.verify(TokenKind::Access, &token, now),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn issued_tokens_are_unique() {
        let codec = test_codec();
        let now = SystemTime::now();

        let first = codec.issue(TokenKind::Access, &neo(), now).unwrap();
        let second = codec.issue(TokenKind::Access, &neo(), now).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn empty_claims_pass_through_the_codec() {
        let codec = test_codec();
        let now = SystemTime::now();
        let anonymous = TokenClaims {
            user_id: String::new(),
            email: String::new(),
            name: String::new(),
        };

        // Shape checks live in the session layer; the codec only attests
        // the signature.
        let token = codec.issue(TokenKind::Access, &anonymous, now).unwrap();
        let claims = codec.verify(TokenKind::Access, &token, now).unwrap();
        assert_eq!(claims, anonymous);
    }

    #[test]
    fn cookie_names_match_the_api_contract() {
        assert_eq!(TokenKind::Access.cookie_name(), "token");
        assert_eq!(TokenKind::Refresh.cookie_name(), "refreshToken");
        assert_eq!(TokenKind::Access.ttl(), Duration::from_secs(900));
        assert_eq!(TokenKind::Refresh.ttl(), Duration::from_secs(604_800));
    }
}
