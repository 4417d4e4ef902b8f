//! Caller identity for backend requests

use std::path::PathBuf;

use serde::Deserialize;
use tracing::warn;

/// Supplies the bearer token and user id attached to dispatches
pub trait IdentityStore: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
    fn user_id(&self) -> Option<String>;
}

#[derive(Debug, Default, Deserialize)]
struct IdentityRecord {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
}

/// Identity from fixed values, falling back to `identity.json`.
///
/// The file is written by the shell after login and is re-read on every
/// lookup, so a new login takes effect without a restart.
#[derive(Debug, Clone)]
pub struct IdentityFile {
    path: PathBuf,
    token: Option<String>,
    user_id: Option<String>,
}

impl IdentityFile {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            token: None,
            user_id: None,
        }
    }

    /// Values from `JARVIS_TOKEN` / `JARVIS_USER_ID` take precedence over the file
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        self.token = lookup("JARVIS_TOKEN").filter(|v| !v.is_empty());
        self.user_id = lookup("JARVIS_USER_ID").filter(|v| !v.is_empty());
        self
    }

    fn read(&self) -> IdentityRecord {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "malformed identity file");
                IdentityRecord::default()
            }),
            Err(_) => IdentityRecord::default(),
        }
    }
}

impl IdentityStore for IdentityFile {
    fn bearer_token(&self) -> Option<String> {
        self.token
            .clone()
            .or_else(|| self.read().token)
            .filter(|t| !t.is_empty())
    }

    fn user_id(&self) -> Option<String> {
        self.user_id.clone().or_else(|| self.read().user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_has_no_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityFile::new(dir.path().join("identity.json"));
        assert_eq!(store.bearer_token(), None);
        assert_eq!(store.user_id(), None);
    }

    #[test]
    fn test_file_is_reread() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        let store = IdentityFile::new(path.clone());

        assert_eq!(store.bearer_token(), None);
        std::fs::write(&path, r#"{"token":"abc","user_id":"7"}"#).unwrap();
        assert_eq!(store.bearer_token().as_deref(), Some("abc"));
        assert_eq!(store.user_id().as_deref(), Some("7"));
    }

    #[test]
    fn test_env_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("identity.json");
        std::fs::write(&path, r#"{"token":"from-file"}"#).unwrap();

        let store = IdentityFile::new(path).with_env(|key| match key {
            "JARVIS_TOKEN" => Some("from-env".to_string()),
            _ => None,
        });
        assert_eq!(store.bearer_token().as_deref(), Some("from-env"));
        assert_eq!(store.user_id(), None);
    }
}
