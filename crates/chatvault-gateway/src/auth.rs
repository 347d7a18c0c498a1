//! Cookie-based session resolution and master-credential verification.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::{request::Parts, HeaderMap};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chatvault_core::config::{AuthConfig, SecureCookies, AUTH_COOKIE_NAME};
use chatvault_core::error::{ChatvaultError, Result};
use chatvault_core::types::CallerContext;
use subtle::ConstantTimeEq;

use crate::app::AppState;

/// Resolves the caller from the session cookie, validating against the
/// in-memory session table. Returns `Unauthenticated` if the cookie is
/// missing, unknown, or expired.
pub fn resolve_caller(jar: &CookieJar, state: &AppState) -> Result<CallerContext> {
    let token = jar
        .get(AUTH_COOKIE_NAME)
        .map(|c| c.value().to_string())
        .ok_or(ChatvaultError::Unauthenticated)?;
    state.sessions.validate(&token).map_err(Into::into)
}

/// Like [`resolve_caller`] but tolerates the absence of a session entirely,
/// used by endpoints that behave differently for anonymous callers.
pub fn resolve_caller_optional(jar: &CookieJar, state: &AppState) -> Option<CallerContext> {
    resolve_caller(jar, state).ok()
}

/// Constant-time comparison against the configured master account.
pub fn verify_master(cfg: &AuthConfig, username: &str, password: &str) -> bool {
    if cfg.master_password.is_empty() {
        return false;
    }
    let user_ok: bool = username.as_bytes().ct_eq(cfg.master_username.as_bytes()).into();
    let pass_ok: bool = password.as_bytes().ct_eq(cfg.master_password.as_bytes()).into();
    user_ok && pass_ok
}

pub fn build_session_cookie(token: String, secure: bool, max_age_seconds: i64) -> Cookie<'static> {
    Cookie::build((AUTH_COOKIE_NAME, token))
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(secure)
        .path("/")
        .max_age(time::Duration::seconds(max_age_seconds))
        .build()
}

pub fn clearing_cookie() -> Cookie<'static> {
    let mut c = Cookie::build((AUTH_COOKIE_NAME, "")).path("/").build();
    c.make_removal();
    c
}

/// Decides whether the `Secure` cookie attribute should be set, per the
/// configured policy (auto = trust `X-Forwarded-Proto`).
pub fn wants_secure_cookie(headers: &HeaderMap, cfg: SecureCookies) -> bool {
    match cfg {
        SecureCookies::True => true,
        SecureCookies::False => false,
        SecureCookies::Auto => headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("https"))
            .unwrap_or(false),
    }
}

/// Client IP as resolved for login rate limiting: forwarded headers are
/// only trusted when the direct peer is itself a private/loopback address
/// (i.e. we're behind a reverse proxy), otherwise the TCP peer wins.
pub struct ClientIp(pub String);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> std::result::Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip());

        let direct_is_private = peer.map(is_private_ip).unwrap_or(false);

        if direct_is_private {
            if let Some(forwarded) = parts
                .headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(|v| v.trim().to_string())
            {
                if !forwarded.is_empty() {
                    return Ok(ClientIp(forwarded));
                }
            }
        }

        Ok(ClientIp(
            peer.map(|ip| ip.to_string()).unwrap_or_else(|| "unknown".to_string()),
        ))
    }
}

pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || is_unique_local(v6),
    }
}

fn is_unique_local(v6: Ipv6Addr) -> bool {
    (v6.segments()[0] & 0xfe00) == 0xfc00
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_ranges_detected() {
        assert!(is_private_ip("127.0.0.1".parse().unwrap()));
        assert!(is_private_ip("10.1.2.3".parse().unwrap()));
        assert!(is_private_ip("192.168.1.1".parse().unwrap()));
        assert!(!is_private_ip("8.8.8.8".parse().unwrap()));
        assert!(is_private_ip("::1".parse().unwrap()));
        assert!(is_private_ip("fc00::1".parse().unwrap()));
        assert!(!is_private_ip("2001:4860:4860::8888".parse().unwrap()));
    }

    #[test]
    fn master_verify_rejects_empty_config() {
        let cfg = AuthConfig {
            master_username: "admin".into(),
            master_password: String::new(),
            ..Default::default()
        };
        assert!(!verify_master(&cfg, "admin", ""));
    }
}
