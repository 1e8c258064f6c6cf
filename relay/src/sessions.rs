/*
Copyright 2024 The Kubernetes Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use protocol::TtlCache;

const SESSION_TTL: Duration = Duration::from_secs(15 * 60);

/// Sticky state for one (server name, user) pair. Lives in the session
/// cache for 15 minutes; the error flag forces early re-resolution.
#[derive(Debug, Default)]
pub struct UserSession {
    pub server_name: String,
    pub cert_sni: String,

    /// Dialin key this session is stitched to.
    pub dialin_cached_key: String,

    /// Set when the upstream answered 401/502.
    pub error_flag: bool,

    pub user_name: String,
    pub role_name: String,
    pub is_read_role: bool,
    pub is_org_admin: bool,
    pub enforce_org_admin_only_secret: bool,
}

pub struct SessionCache {
    sessions: TtlCache<u64, Arc<RwLock<UserSession>>>,
}

impl SessionCache {
    pub fn new() -> Arc<Self> {
        Arc::new(SessionCache {
            sessions: TtlCache::new(1 << 14),
        })
    }

    pub fn get(&self, session_key: &str) -> Option<Arc<RwLock<UserSession>>> {
        self.sessions.get(&session_cache_key(session_key))
    }

    pub fn add(&self, session_key: &str, session: UserSession) -> Arc<RwLock<UserSession>> {
        let session = Arc::new(RwLock::new(session));
        self.sessions
            .insert(session_cache_key(session_key), session.clone(), SESSION_TTL);
        session
    }

    pub fn delete(&self, session_key: &str) {
        self.sessions.remove(&session_cache_key(session_key));
    }
}

fn session_cache_key(session_key: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    session_key.hash(&mut hasher);
    hasher.finish()
}

// Write-sensitive URL patterns rejected for read-only roles.
const ROLE_CHECK_ROUTES: &[(&str, &str)] = &[
    ("POST", "/api/:version/namespaces/:namespace/pods/:pod/exec"),
    ("POST", "/api/:version/namespaces/:namespace/secrets"),
    ("GET", "/api/:version/namespaces/:namespace/secrets"),
    ("GET", "/api/:version/secrets"),
];

// Secret resource patterns rejected unless the user is an org admin.
const SECRET_CHECK_ROUTES: &[(&str, &str)] = &[
    ("POST", "/api/:version/namespaces/:namespace/secrets"),
    ("GET", "/api/:version/namespaces/:namespace/secrets"),
    ("GET", "/api/:version/secrets"),
];

/// True when the request matches a write-sensitive pattern a read-only
/// role must not reach.
pub fn role_check(method: &str, path: &str) -> bool {
    ROLE_CHECK_ROUTES
        .iter()
        .any(|(m, pattern)| *m == method && path_matches(pattern, path))
}

/// True when the request targets secret resources.
pub fn secret_role_check(method: &str, path: &str) -> bool {
    SECRET_CHECK_ROUTES
        .iter()
        .any(|(m, pattern)| *m == method && path_matches(pattern, path))
}

/// Segment-wise match where `:name` segments match any single non-empty
/// path segment.
fn path_matches(pattern: &str, path: &str) -> bool {
    let path = path.split('?').next().unwrap_or(path);
    let mut pattern_segs = pattern.trim_matches('/').split('/');
    let mut path_segs = path.trim_matches('/').split('/');

    loop {
        match (pattern_segs.next(), path_segs.next()) {
            (None, None) => return true,
            (Some(p), Some(s)) => {
                if p.starts_with(':') {
                    if s.is_empty() {
                        return false;
                    }
                } else if p != s {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_round_trip() {
        let cache = SessionCache::new();
        assert!(cache.get("c1.user.relay.local:alice").is_none());

        cache.add(
            "c1.user.relay.local:alice",
            UserSession {
                server_name: "*.user.relay.local".to_string(),
                cert_sni: "c1.user.relay.local".to_string(),
                ..Default::default()
            },
        );

        let session = cache.get("c1.user.relay.local:alice").unwrap();
        session.write().unwrap().dialin_cached_key = "some-key".to_string();

        let again = cache.get("c1.user.relay.local:alice").unwrap();
        assert_eq!(again.read().unwrap().dialin_cached_key, "some-key");

        cache.delete("c1.user.relay.local:alice");
        assert!(cache.get("c1.user.relay.local:alice").is_none());
    }

    #[test]
    fn read_role_blocks_pod_exec() {
        assert!(role_check("POST", "/api/v1/namespaces/team-a/pods/web-0/exec"));
        assert!(role_check("GET", "/api/v1/secrets"));
        assert!(role_check("GET", "/api/v1/namespaces/team-a/secrets"));

        assert!(!role_check("GET", "/api/v1/namespaces/team-a/pods/web-0/exec"));
        assert!(!role_check("GET", "/api/v1/namespaces/team-a/pods"));
        assert!(!role_check("POST", "/api/v1/namespaces/team-a/pods/web-0/log"));
    }

    #[test]
    fn secret_check_matches_secret_urls_only() {
        assert!(secret_role_check("GET", "/api/v1/secrets"));
        assert!(secret_role_check("POST", "/api/v1/namespaces/team-a/secrets"));
        assert!(!secret_role_check("GET", "/api/v1/namespaces/team-a/pods"));
        assert!(!secret_role_check("DELETE", "/api/v1/secrets"));
    }

    #[test]
    fn query_strings_do_not_defeat_matching() {
        assert!(role_check(
            "POST",
            "/api/v1/namespaces/team-a/pods/web-0/exec?command=sh"
        ));
    }
}
