use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chatvault_core::types::{CallerContext, Role, Scope};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SessionError};
use crate::types::AuthSession;

/// In-memory session table plus the login rate limiter. One instance per
/// process; both structures are swept periodically by [`SessionManager::sweep`].
pub struct SessionManager {
    sessions: Mutex<HashMap<String, AuthSession>>,
    /// Per-username insertion-ordered token list, for oldest-eviction once
    /// a user is at their session quota.
    by_user: Mutex<HashMap<String, VecDeque<String>>>,
    login_attempts: Mutex<HashMap<String, VecDeque<DateTime<Utc>>>>,
    session_ttl: ChronoDuration,
    max_sessions_per_user: usize,
    login_rate_limit: usize,
    login_rate_window: ChronoDuration,
}

impl SessionManager {
    pub fn new(
        session_ttl_seconds: i64,
        max_sessions_per_user: usize,
        login_rate_limit: usize,
        login_rate_window_seconds: i64,
    ) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            by_user: Mutex::new(HashMap::new()),
            login_attempts: Mutex::new(HashMap::new()),
            session_ttl: ChronoDuration::seconds(session_ttl_seconds),
            max_sessions_per_user,
            login_rate_limit,
            login_rate_window: ChronoDuration::seconds(login_rate_window_seconds),
        }
    }

    /// Record one login attempt from `ip` and report whether it was within
    /// the rate limit *before* this attempt. Always records, even when the
    /// attempt is itself rejected, so a client hammering the endpoint keeps
    /// extending its own block.
    #[instrument(skip(self))]
    pub fn record_login_attempt(&self, ip: &str) -> bool {
        let now = Utc::now();
        let mut attempts = self.login_attempts.lock().unwrap();
        let entry = attempts.entry(ip.to_string()).or_default();
        while let Some(front) = entry.front() {
            if now.signed_duration_since(*front) >= self.login_rate_window {
                entry.pop_front();
            } else {
                break;
            }
        }
        let allowed = entry.len() < self.login_rate_limit;
        entry.push_back(now);
        if !allowed {
            warn!(ip, "login rate limit exceeded");
        }
        allowed
    }

    /// Create a new session, evicting the user's oldest session first if
    /// they are already at quota.
    #[instrument(skip(self, allowed_chat_ids), fields(username))]
    pub fn create_session(
        &self,
        username: &str,
        role: Role,
        allowed_chat_ids: Scope,
    ) -> AuthSession {
        let token = generate_token();
        let now = Utc::now();
        let session = AuthSession {
            token: token.clone(),
            username: username.to_string(),
            role,
            allowed_chat_ids,
            created_at: now,
            last_accessed: now,
        };

        let mut by_user = self.by_user.lock().unwrap();
        let tokens = by_user.entry(username.to_string()).or_default();
        if tokens.len() >= self.max_sessions_per_user {
            if let Some(oldest) = tokens.pop_front() {
                self.sessions.lock().unwrap().remove(&oldest);
                debug!(username, "evicted oldest session at quota");
            }
        }
        tokens.push_back(token.clone());
        drop(by_user);

        self.sessions.lock().unwrap().insert(token, session.clone());
        session
    }

    /// Validate a session token, refreshing `last_accessed` on success.
    #[instrument(skip(self, token))]
    pub fn validate(&self, token: &str) -> Result<CallerContext> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(token).ok_or(SessionError::NotFound)?;
        let now = Utc::now();
        if now.signed_duration_since(session.created_at) >= self.session_ttl {
            let username = session.username.clone();
            sessions.remove(token);
            drop(sessions);
            self.forget_token(&username, token);
            return Err(SessionError::NotFound);
        }
        session.last_accessed = now;
        Ok(CallerContext {
            username: session.username.clone(),
            role: session.role,
            allowed_chat_ids: session.allowed_chat_ids.clone(),
        })
    }

    pub fn delete(&self, token: &str) {
        let username = self
            .sessions
            .lock()
            .unwrap()
            .remove(token)
            .map(|s| s.username);
        if let Some(username) = username {
            self.forget_token(&username, token);
        }
    }

    /// Evict every session belonging to `username`, for use by the admin
    /// service when an account's credentials or scope change underneath it.
    #[instrument(skip(self))]
    pub fn invalidate_for_username(&self, username: &str) {
        let tokens = self
            .by_user
            .lock()
            .unwrap()
            .remove(username)
            .unwrap_or_default();
        if tokens.is_empty() {
            return;
        }
        let mut sessions = self.sessions.lock().unwrap();
        for token in &tokens {
            sessions.remove(token);
        }
        drop(sessions);
        info!(username, evicted = tokens.len(), "sessions invalidated for account change");
    }

    /// Remove expired sessions and login-attempt entries whose every
    /// timestamp has aged out of the window. Intended to run every 900 s.
    #[instrument(skip(self))]
    pub fn sweep(&self) {
        let now = Utc::now();
        let expired: Vec<(String, String)> = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .iter()
                .filter(|(_, s)| now.signed_duration_since(s.created_at) >= self.session_ttl)
                .map(|(token, s)| (token.clone(), s.username.clone()))
                .collect()
        };
        if !expired.is_empty() {
            let mut sessions = self.sessions.lock().unwrap();
            for (token, _) in &expired {
                sessions.remove(token);
            }
        }
        for (token, username) in &expired {
            self.forget_token(username, token);
        }

        let mut attempts = self.login_attempts.lock().unwrap();
        attempts.retain(|_, timestamps| {
            timestamps
                .iter()
                .any(|t| now.signed_duration_since(*t) < self.login_rate_window)
        });

        info!(expired_sessions = expired.len(), "session sweep complete");
    }

    fn forget_token(&self, username: &str, token: &str) {
        let mut by_user = self.by_user.lock().unwrap();
        if let Some(tokens) = by_user.get_mut(username) {
            tokens.retain(|t| t != token);
            if tokens.is_empty() {
                by_user.remove(username);
            }
        }
    }
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex_encode(&bytes)
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new(3600, 3, 5, 300)
    }

    #[test]
    fn validates_a_freshly_created_session() {
        let mgr = manager();
        let session = mgr.create_session("alice", Role::Viewer, None);
        let ctx = mgr.validate(&session.token).unwrap();
        assert_eq!(ctx.username, "alice");
    }

    #[test]
    fn rejects_unknown_token() {
        let mgr = manager();
        assert!(matches!(mgr.validate("nope"), Err(SessionError::NotFound)));
    }

    #[test]
    fn expired_session_is_rejected_and_removed() {
        let mgr = SessionManager::new(-1, 3, 5, 300);
        let session = mgr.create_session("alice", Role::Viewer, None);
        assert!(mgr.validate(&session.token).is_err());
    }

    #[test]
    fn evicts_oldest_session_once_over_quota() {
        let mgr = SessionManager::new(3600, 2, 5, 300);
        let first = mgr.create_session("alice", Role::Viewer, None);
        let _second = mgr.create_session("alice", Role::Viewer, None);
        let _third = mgr.create_session("alice", Role::Viewer, None);
        assert!(mgr.validate(&first.token).is_err());
    }

    #[test]
    fn rate_limiter_allows_up_to_the_limit_then_blocks() {
        let mgr = SessionManager::new(3600, 3, 3, 300);
        assert!(mgr.record_login_attempt("1.2.3.4"));
        assert!(mgr.record_login_attempt("1.2.3.4"));
        assert!(mgr.record_login_attempt("1.2.3.4"));
        assert!(!mgr.record_login_attempt("1.2.3.4"));
    }

    #[test]
    fn invalidate_for_username_evicts_all_of_that_users_sessions() {
        let mgr = manager();
        let a = mgr.create_session("alice", Role::Viewer, None);
        let b = mgr.create_session("alice", Role::Viewer, None);
        let other = mgr.create_session("bob", Role::Viewer, None);
        mgr.invalidate_for_username("alice");
        assert!(mgr.validate(&a.token).is_err());
        assert!(mgr.validate(&b.token).is_err());
        assert!(mgr.validate(&other.token).is_ok());
    }

    #[test]
    fn rate_limiter_tracks_ips_independently() {
        let mgr = SessionManager::new(3600, 3, 1, 300);
        assert!(mgr.record_login_attempt("1.1.1.1"));
        assert!(mgr.record_login_attempt("2.2.2.2"));
    }
}
