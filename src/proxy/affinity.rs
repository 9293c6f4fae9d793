// src/proxy/affinity.rs
//
// Session-affinity cookie protocol. The cookie's wire payload is the
// backend id's canonical 36-character text form. Request-side and
// response-side handling both run inside one `Dispatcher::dispatch` call,
// so there is no need for a second round-tripped sentinel cookie — the
// wire protocol is limited to a single `LoadBalancerSessionCookie`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use cookie::Cookie as ParsedCookie;
use hyper::header::{HeaderMap, HeaderValue, COOKIE};
use uuid::Uuid;

use crate::config::SessionPersistenceConfig;

use super::backend::Backend;
use super::pool::BackendPool;

pub const SESSION_COOKIE_NAME: &str = "LoadBalancerSessionCookie";

/// Outcome of looking up the affinity cookie on an inbound request.
pub enum AffinityLookup {
    /// Session persistence is disabled; the caller should go straight to
    /// `policy.next()`.
    Disabled,
    /// A valid cookie resolved to a live backend — use it, bypassing the
    /// selection policy.
    Bound(Arc<Backend>),
    /// No cookie, an unparseable cookie, or a cookie pointing at a
    /// backend that is no longer alive. All three are recovered the same
    /// way: silently fall through to `policy.next()` and issue a fresh
    /// session.
    Fallthrough,
}

#[derive(Clone)]
pub struct SessionAffinity {
    config: SessionPersistenceConfig,
}

impl SessionAffinity {
    pub fn new(config: SessionPersistenceConfig) -> Self {
        Self { config }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn expiration(&self) -> Duration {
        Duration::seconds(self.config.expiration_period as i64)
    }

    /// Looks up the inbound request's session cookie against the pool.
    pub fn resolve(&self, headers: &HeaderMap, pool: &BackendPool) -> AffinityLookup {
        if !self.enabled() {
            return AffinityLookup::Disabled;
        }
        match find_session_id(headers) {
            None => AffinityLookup::Fallthrough,
            Some(id) => match pool.get(id) {
                Some(backend) if backend.is_alive() => AffinityLookup::Bound(backend),
                // Either unknown or dead: treat as expired.
                _ => AffinityLookup::Fallthrough,
            },
        }
    }

    /// Builds a fresh `Set-Cookie` with `Expires = now + ExpirationPeriod`.
    /// Sessions are sliding: every affinity-routed request refreshes the
    /// window, regardless of whether the cookie was already present.
    pub fn set_cookie_header(&self, backend_id: Uuid) -> HeaderValue {
        let expires_at = Utc::now() + self.expiration();
        build_set_cookie(backend_id, expires_at)
    }
}

fn find_session_id(headers: &HeaderMap) -> Option<Uuid> {
    for raw in headers.get_all(COOKIE) {
        let Ok(raw) = raw.to_str() else { continue };
        for parsed in ParsedCookie::split_parse(raw) {
            let Ok(parsed) = parsed else { continue };
            if parsed.name() == SESSION_COOKIE_NAME {
                return Uuid::parse_str(parsed.value()).ok();
            }
        }
    }
    None
}

fn build_set_cookie(backend_id: Uuid, expires_at: DateTime<Utc>) -> HeaderValue {
    // HTTP-date (RFC 7231 IMF-fixdate), the format browsers expect for
    // the cookie `Expires` attribute.
    let expires = expires_at.format("%a, %d %b %Y %H:%M:%S GMT");
    let value = format!("{SESSION_COOKIE_NAME}={backend_id}; Expires={expires}; SameSite=None; Path=/");
    HeaderValue::from_str(&value).expect("cookie value is always a valid header value")
}
