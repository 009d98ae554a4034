use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Identity that owns a mutation queue. Writes made while signed out belong to
/// the unauthenticated user.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn new(uid: impl Into<String>) -> Self {
        Self { uid: Some(uid.into()) }
    }

    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }

    /// Stable key used to partition persisted per-user state.
    pub fn key(&self) -> &str {
        self.uid.as_deref().unwrap_or("")
    }
}

impl Display for User {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.uid {
            Some(uid) => write!(f, "{uid}"),
            None => write!(f, "anonymous user"),
        }
    }
}
