//! Secret capability: named string secrets loaded from a JSON object

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("Secret '{0}' does not exist")]
    Missing(String),

    #[error("Secret file is not a JSON object of strings: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Failed to read secret file: {0}")]
    Io(#[from] std::io::Error),
}

pub trait SecretSource: Send + Sync {
    fn get(&self, name: &str) -> Result<String, SecretError>;
}

#[derive(Clone, Default)]
pub struct SecretManager {
    secrets: HashMap<String, String>,
}

impl SecretManager {
    pub fn from_json(json: &str) -> Result<Self, SecretError> {
        Ok(Self {
            secrets: serde_json::from_str(json)?,
        })
    }

    pub async fn load(path: &Path) -> Result<Self, SecretError> {
        let json = tokio::fs::read_to_string(path).await?;
        Self::from_json(&json)
    }
}

impl SecretSource for SecretManager {
    fn get(&self, name: &str) -> Result<String, SecretError> {
        self.secrets
            .get(name)
            .cloned()
            .ok_or_else(|| SecretError::Missing(name.to_string()))
    }
}

// Never print secret values
impl std::fmt::Debug for SecretManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.secrets.keys().collect();
        names.sort();
        f.debug_struct("SecretManager").field("names", &names).finish()
    }
}
