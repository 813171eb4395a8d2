use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderProfile {
    pub id: Ulid,
    pub display_name: String,
    /// Minor currency units per hour.
    pub hourly_rate: i64,
    pub currency: String,
}

impl ProviderProfile {
    /// Price of `duration_minutes` at this provider's rate, rounded down.
    pub fn price_for(&self, duration_minutes: u32) -> i64 {
        self.hourly_rate.saturating_mul(i64::from(duration_minutes)) / 60
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerProfile {
    pub id: Ulid,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("cannot read directory file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse directory file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Resolves actors to display identity. Authentication happens upstream.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn provider(&self, id: &Ulid) -> Option<ProviderProfile>;
    async fn consumer(&self, id: &Ulid) -> Option<ConsumerProfile>;
}

#[derive(Debug, Default, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    providers: Vec<ProviderProfile>,
    #[serde(default)]
    consumers: Vec<ConsumerProfile>,
}

/// Directory held in memory, optionally seeded from a JSON file of the form
/// `{"providers": [...], "consumers": [...]}`.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    providers: DashMap<Ulid, ProviderProfile>,
    consumers: DashMap<Ulid, ConsumerProfile>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_json(raw: &str) -> Result<Self, DirectoryError> {
        let file: DirectoryFile = serde_json::from_str(raw)?;
        let dir = Self::new();
        for p in file.providers {
            dir.add_provider(p);
        }
        for c in file.consumers {
            dir.add_consumer(c);
        }
        Ok(dir)
    }

    pub fn load(path: &Path) -> Result<Self, DirectoryError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn add_provider(&self, profile: ProviderProfile) {
        self.providers.insert(profile.id, profile);
    }

    pub fn add_consumer(&self, profile: ConsumerProfile) {
        self.consumers.insert(profile.id, profile);
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }
}

#[async_trait]
impl IdentityDirectory for StaticDirectory {
    async fn provider(&self, id: &Ulid) -> Option<ProviderProfile> {
        self.providers.get(id).map(|e| e.value().clone())
    }

    async fn consumer(&self, id: &Ulid) -> Option<ConsumerProfile> {
        self.consumers.get(id).map(|e| e.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_is_prorated_per_minute() {
        let p = ProviderProfile {
            id: Ulid::new(),
            display_name: "Dr. Rao".into(),
            hourly_rate: 120_000,
            currency: "INR".into(),
        };
        assert_eq!(p.price_for(60), 120_000);
        assert_eq!(p.price_for(30), 60_000);
        assert_eq!(p.price_for(45), 90_000);
    }

    #[tokio::test]
    async fn loads_from_json() {
        let pid = Ulid::new();
        let cid = Ulid::new();
        let raw = format!(
            r#"{{"providers":[{{"id":"{pid}","displayName":"Dr. Rao","hourlyRate":100000,"currency":"INR"}}],
                "consumers":[{{"id":"{cid}","name":"Kiran"}}]}}"#
        );
        let dir = StaticDirectory::from_json(&raw).unwrap();
        assert_eq!(dir.provider(&pid).await.unwrap().hourly_rate, 100_000);
        let c = dir.consumer(&cid).await.unwrap();
        assert_eq!(c.name, "Kiran");
        assert_eq!(c.email, None);
        assert!(dir.provider(&cid).await.is_none());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            StaticDirectory::from_json("{\"providers\": 3}"),
            Err(DirectoryError::Parse(_))
        ));
    }
}
