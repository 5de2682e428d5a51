use super::{ArtifactRegistry, RegisterOptions, RegistryStats, ScanEvent, ValidationReport};
use crate::error::{ErrorKind, Result};
use crate::kind::Kind;
use async_trait::async_trait;
use exn::ResultExt;
use futures::TryStreamExt;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;

/// A registry of any kind, with records passed around as JSON.
///
/// This is what callers use when the kind is only known at runtime, like the
/// command line.
#[async_trait]
pub trait AnyRegistry: Send + Sync {
    fn kind(&self) -> &'static str;

    fn formats(&self) -> &'static [&'static str];

    async fn register(&self, path: &Path, options: RegisterOptions) -> Result<Value>;

    async fn get(&self, name: &str) -> Result<Option<Value>>;

    async fn list(&self) -> Result<Vec<Value>>;

    async fn validate(&self, name: &str) -> Result<ValidationReport>;

    async fn stats(&self) -> RegistryStats;

    async fn delete(&self, name: &str) -> Result<bool>;

    /// Put a record (as returned by [`get`](Self::get)) back as it was.
    async fn restore(&self, record: Value, dependencies: Vec<String>) -> Result<()>;

    async fn set_parameter(&self, name: &str, key: &str, value: Value) -> Result<Value>;

    async fn scan(&self) -> Result<Vec<ScanEvent>>;
}

fn to_json<K: Kind, T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).or_raise(|| ErrorKind::Store(K::NAME.to_string()))
}

#[async_trait]
impl<K: Kind> AnyRegistry for ArtifactRegistry<K> {
    fn kind(&self) -> &'static str {
        K::NAME
    }

    fn formats(&self) -> &'static [&'static str] {
        K::FORMATS
    }

    async fn register(&self, path: &Path, options: RegisterOptions) -> Result<Value> {
        let registered = ArtifactRegistry::register(self, path, options).await?;
        to_json::<K, _>(&registered)
    }

    async fn get(&self, name: &str) -> Result<Option<Value>> {
        match ArtifactRegistry::get(self, name).await {
            Some(record) => Ok(Some(to_json::<K, _>(&record)?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<Value>> {
        ArtifactRegistry::list(self).await.iter().map(to_json::<K, _>).collect()
    }

    async fn validate(&self, name: &str) -> Result<ValidationReport> {
        ArtifactRegistry::validate(self, name).await
    }

    async fn stats(&self) -> RegistryStats {
        ArtifactRegistry::stats(self).await
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        ArtifactRegistry::delete(self, name).await
    }

    async fn restore(&self, record: Value, dependencies: Vec<String>) -> Result<()> {
        let record = serde_json::from_value(record).or_raise(|| ErrorKind::Decode(format!("{} record", K::NAME)))?;
        ArtifactRegistry::restore(self, record, dependencies).await
    }

    async fn set_parameter(&self, name: &str, key: &str, value: Value) -> Result<Value> {
        let record = ArtifactRegistry::set_parameter(self, name, key, value).await?;
        to_json::<K, _>(&record)
    }

    async fn scan(&self) -> Result<Vec<ScanEvent>> {
        ArtifactRegistry::scan(self).try_collect().await
    }
}
