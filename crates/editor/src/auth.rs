use anyhow::{anyhow, bail, Context};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

pub const ACCESS_TOKEN_TTL_SECONDS: i64 = 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AccessTokenClaims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// The identity carried by a verified access token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserProfile {
    pub user_id: i64,
}

/// Verifies the `access-token` cookie presented on socket upgrade.
///
/// Token issuance belongs to the user service; the issuing helper here
/// exists so tests can mint tokens against the same secret.
#[derive(Clone)]
pub struct AccessTokenVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl AccessTokenVerifier {
    pub fn new(secret: &str) -> anyhow::Result<Self> {
        if secret.len() < 32 {
            bail!("jwt secret must be at least 32 characters long");
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Ok(Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        })
    }

    pub fn issue_token(&self, user_id: i64) -> anyhow::Result<String> {
        self.issue_token_at(user_id, current_unix_timestamp()?)
    }

    fn issue_token_at(&self, user_id: i64, issued_at: i64) -> anyhow::Result<String> {
        let claims = AccessTokenClaims {
            sub: user_id.to_string(),
            iat: issued_at,
            exp: issued_at + ACCESS_TOKEN_TTL_SECONDS,
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .context("failed to encode access token")
    }

    pub fn verify(&self, token: &str) -> anyhow::Result<UserProfile> {
        let claims = decode::<AccessTokenClaims>(token, &self.decoding_key, &self.validation)
            .context("failed to decode access token")?
            .claims;

        let user_id = claims
            .sub
            .parse::<i64>()
            .with_context(|| format!("access token subject '{}' is not a user id", claims.sub))?;

        Ok(UserProfile { user_id })
    }
}

fn current_unix_timestamp() -> anyhow::Result<i64> {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|error| anyhow!("system clock is before unix epoch: {error}"))?;

    i64::try_from(duration.as_secs()).context("unix timestamp overflow")
}

#[cfg(test)]
mod tests {
    use super::{current_unix_timestamp, AccessTokenVerifier, ACCESS_TOKEN_TTL_SECONDS};
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use serde::Serialize;

    const TEST_SECRET: &str = "peerpad_test_secret_that_is_definitely_long_enough";

    #[test]
    fn issues_and_verifies_tokens() {
        let verifier = AccessTokenVerifier::new(TEST_SECRET).expect("verifier should initialize");

        let token = verifier.issue_token(42).expect("token should be issued");
        let profile = verifier.verify(&token).expect("token should verify");

        assert_eq!(profile.user_id, 42);
    }

    #[test]
    fn rejects_short_secrets() {
        assert!(AccessTokenVerifier::new("too-short").is_err());
    }

    #[test]
    fn rejects_tampered_tokens() {
        let verifier = AccessTokenVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let token = verifier.issue_token(42).expect("token should be issued");
        let tampered = format!("{token}x");

        assert!(verifier.verify(&tampered).is_err());
    }

    #[test]
    fn rejects_expired_tokens() {
        let verifier = AccessTokenVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let issued_at = current_unix_timestamp().expect("current timestamp should resolve")
            - ACCESS_TOKEN_TTL_SECONDS
            - 1;
        let token = verifier.issue_token_at(42, issued_at).expect("token should be issued");

        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn rejects_tokens_with_non_numeric_subject() {
        #[derive(Serialize)]
        struct InvalidSubjectClaims {
            sub: &'static str,
            iat: i64,
            exp: i64,
        }

        let verifier = AccessTokenVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let now = current_unix_timestamp().expect("current timestamp should resolve");
        let claims = InvalidSubjectClaims {
            sub: "not-a-number",
            iat: now,
            exp: now + ACCESS_TOKEN_TTL_SECONDS,
        };

        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(TEST_SECRET.as_bytes()),
        )
        .expect("token should encode");

        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn rejects_tokens_signed_with_another_secret() {
        let verifier = AccessTokenVerifier::new(TEST_SECRET).expect("verifier should initialize");
        let other = AccessTokenVerifier::new("a_completely_different_secret_of_enough_length")
            .expect("other verifier should initialize");

        let token = other.issue_token(42).expect("token should be issued");
        assert!(verifier.verify(&token).is_err());
    }
}
