//! # Flush Authorization
//!
//! The flush route is hit by an external scheduler holding a shared secret.
//!
//! - Production: `Authorization: Bearer <secret>` only. No secret configured means every call is refused
//! - Elsewhere: `?token=<secret>` also works for poking the route by hand
//!
//! Both sides are hashed to SHA-256 before comparing, so the comparison always walks 32 bytes
//! regardless of what the caller sent.
use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicBool, Ordering},
};

use axum::http::{HeaderMap, header::AUTHORIZATION};
use sha2::{Digest, Sha256};
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Development,
    Test,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Environment::Production
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Ok(Environment::Production),
            "development" | "dev" => Ok(Environment::Development),
            "test" => Ok(Environment::Test),
            other => Err(format!("unknown environment '{other}'")),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Environment::Production => "production",
            Environment::Development => "development",
            Environment::Test => "test",
        };

        f.write_str(name)
    }
}

pub struct AuthGuard {
    secret: Option<String>,
    environment: Environment,
    allow_unauthenticated: bool,
    reported_missing_secret: AtomicBool,
}

impl AuthGuard {
    pub fn new(secret: Option<String>, environment: Environment, allow_unauthenticated: bool) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            environment,
            allow_unauthenticated,
            reported_missing_secret: AtomicBool::new(false),
        }
    }

    pub fn is_authorized(&self, headers: &HeaderMap, query_token: Option<&str>) -> bool {
        let Some(secret) = self.secret.as_deref() else {
            return self.missing_secret();
        };

        let provided = bearer_token(headers).or_else(|| {
            if self.environment.is_production() {
                None
            } else {
                query_token
            }
        });

        match provided {
            Some(token) if !token.is_empty() => digests_match(token, secret),
            _ => false,
        }
    }

    fn missing_secret(&self) -> bool {
        let first = !self.reported_missing_secret.swap(true, Ordering::SeqCst);
        let open = !self.environment.is_production() && self.allow_unauthenticated;

        if first {
            if open {
                warn!(environment = %self.environment, "No flush secret configured, flush route is open");
            } else {
                error!(environment = %self.environment, "No flush secret configured, refusing every flush");
            }
        }

        open
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;

    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
}

fn digests_match(provided: &str, secret: &str) -> bool {
    let provided = Sha256::digest(provided.as_bytes());
    let secret = Sha256::digest(secret.as_bytes());

    provided
        .iter()
        .zip(secret.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token(&headers("Bearer abc")), Some("abc"));
        assert_eq!(bearer_token(&headers("bearer  abc ")), Some("abc"));
        assert_eq!(bearer_token(&headers("Basic abc")), None);
        assert_eq!(bearer_token(&headers("abc")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[test]
    fn test_production_requires_header() {
        let guard = AuthGuard::new(Some("s3cret".to_string()), Environment::Production, false);

        assert!(guard.is_authorized(&headers("Bearer s3cret"), None));
        assert!(!guard.is_authorized(&headers("Bearer wrong"), None));
        assert!(!guard.is_authorized(&headers("Bearer s3cret-but-longer"), None));
        assert!(!guard.is_authorized(&HeaderMap::new(), Some("s3cret")));
        assert!(!guard.is_authorized(&HeaderMap::new(), None));
    }

    #[test]
    fn test_development_accepts_query_token() {
        let guard = AuthGuard::new(Some("s3cret".to_string()), Environment::Development, false);

        assert!(guard.is_authorized(&HeaderMap::new(), Some("s3cret")));
        assert!(!guard.is_authorized(&HeaderMap::new(), Some("nope")));
        assert!(!guard.is_authorized(&HeaderMap::new(), Some("")));
    }

    #[test]
    fn test_missing_secret_fails_closed_in_production() {
        let guard = AuthGuard::new(None, Environment::Production, true);

        assert!(!guard.is_authorized(&headers("Bearer anything"), None));
        assert!(!guard.is_authorized(&HeaderMap::new(), None));
        assert!(guard.reported_missing_secret.load(Ordering::SeqCst));
    }

    #[test]
    fn test_missing_secret_opens_only_with_override() {
        let closed = AuthGuard::new(None, Environment::Development, false);
        assert!(!closed.is_authorized(&HeaderMap::new(), None));

        let open = AuthGuard::new(Some(String::new()), Environment::Test, true);
        assert!(open.is_authorized(&HeaderMap::new(), None));
    }

    #[test]
    fn test_environment_parse() {
        assert_eq!("Production".parse::<Environment>(), Ok(Environment::Production));
        assert_eq!("dev".parse::<Environment>(), Ok(Environment::Development));
        assert_eq!("test".parse::<Environment>(), Ok(Environment::Test));
        assert!("staging".parse::<Environment>().is_err());
    }
}
