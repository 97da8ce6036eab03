use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Well-known prefix the ACME validator fetches HTTP-01 responses from.
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Path -> response body table served by [`crate::ChallengeServer`].
///
/// Entries are written by whoever drives ACME orders and read by every
/// inbound request. Readers share the lock, so lookups for unrelated paths
/// never wait on each other.
#[derive(Debug, Default)]
pub struct ChallengeDirectory {
    challenges: RwLock<HashMap<String, String>>,
}

pub type ChallengeDirectoryRef = Arc<ChallengeDirectory>;

impl ChallengeDirectory {
    pub fn new() -> Self {
        Self {
            challenges: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or overwrite the payload served at `path`.
    pub fn register_challenge(&self, path: &str, payload: &str) {
        debug!("register challenge path: {}", path);
        let mut challenges = self.challenges.write().unwrap();
        challenges.insert(path.to_string(), payload.to_string());
    }

    /// Remove `path`. Removing an unknown path is a no-op.
    pub fn unregister_challenge(&self, path: &str) {
        let mut challenges = self.challenges.write().unwrap();
        if challenges.remove(path).is_some() {
            debug!("unregister challenge path: {}", path);
        }
    }

    pub fn get_response(&self, path: &str) -> Option<String> {
        let challenges = self.challenges.read().unwrap();
        challenges.get(path).cloned()
    }

    pub fn paths(&self) -> Vec<String> {
        let challenges = self.challenges.read().unwrap();
        challenges.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.challenges.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.challenges.read().unwrap().is_empty()
    }
}

/// Returns the token part of an HTTP-01 path, if `path` is one.
pub fn extract_token_from_path(path: &str) -> Option<&str> {
    match path.strip_prefix(ACME_CHALLENGE_PREFIX) {
        Some(token) if !token.is_empty() => Some(token),
        _ => None,
    }
}

pub fn challenge_path(token: &str) -> String {
    format!("{}{}", ACME_CHALLENGE_PREFIX, token)
}
