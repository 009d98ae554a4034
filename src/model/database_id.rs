use serde::{Deserialize, Serialize};

pub const DEFAULT_DATABASE_ID: &str = "(default)";

/// Identifies the backend database an instance synchronizes with.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatabaseId {
    project_id: String,
    database: String,
}

impl DatabaseId {
    pub fn new(project_id: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database: database.into(),
        }
    }

    pub fn default(project_id: impl Into<String>) -> Self {
        Self::new(project_id, DEFAULT_DATABASE_ID)
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    /// Name used to namespace persisted state, one store per database.
    pub fn persistence_key(&self) -> String {
        format!("{}.{}", self.project_id, self.database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_database_name() {
        let id = DatabaseId::default("demo");
        assert_eq!(id.database(), DEFAULT_DATABASE_ID);
        assert_eq!(id.persistence_key(), "demo.(default)");
    }
}
