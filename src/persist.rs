//! Persistence provider contract and duplicate-key absorption

use crate::error::BoxError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use thiserror::Error;

/// How duplicate-key failures from the provider are absorbed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicateKeyPolicy {
    /// Surface the failure.
    #[default]
    Fail,
    /// Swallow it; the entity is already there.
    Ignore,
    /// Retry as an update.
    Upsert,
}

/// Failures from a persistence provider.
#[derive(Debug, Error)]
pub enum PersistError {
    /// Backend-agnostic duplicate-key signal.
    #[error("duplicate key: {detail}")]
    DuplicateKey { detail: String },
    /// Anything else the backend reports.
    #[error("persistence backend failure: {0}")]
    Backend(#[source] BoxError),
}

/// Abstract persistence provider, registered per entity family.
#[async_trait]
pub trait PersistenceProvider: Send + Sync {
    /// Stable identifier of the backing store (for diagnostics).
    fn type_id(&self) -> &str;

    /// Whether this provider can persist the given entity.
    fn supports(&self, entity: &(dyn Any + Send)) -> bool;

    /// Insert the entity.
    async fn persist(&self, entity: &(dyn Any + Send)) -> Result<(), PersistError>;

    /// Insert or update the entity.
    async fn persist_or_update(&self, entity: &(dyn Any + Send)) -> Result<(), PersistError>;
}

/// Persist with the configured duplicate-key behavior applied.
pub async fn persist_with_policy(
    provider: &dyn PersistenceProvider,
    entity: &(dyn Any + Send),
    policy: DuplicateKeyPolicy,
) -> Result<(), PersistError> {
    match provider.persist(entity).await {
        Err(PersistError::DuplicateKey { detail }) => match policy {
            DuplicateKeyPolicy::Fail => Err(PersistError::DuplicateKey { detail }),
            DuplicateKeyPolicy::Ignore => {
                tracing::debug!(provider = provider.type_id(), detail = %detail, "duplicate key ignored");
                Ok(())
            }
            DuplicateKeyPolicy::Upsert => provider.persist_or_update(entity).await,
        },
        other => other,
    }
}

/// Aspect handler persisting every observed item through `provider`.
///
/// Registered under the persistence aspect's name; entities unsupported by
/// the provider fail the side-effect step (subject to its retry/DLQ config).
pub fn persistence_handler(
    provider: std::sync::Arc<dyn PersistenceProvider>,
    policy: DuplicateKeyPolicy,
) -> crate::aspect::SideEffectHandler {
    crate::aspect::SideEffectHandler::from_dyn(move |item, _ctx| {
        let provider = provider.clone();
        Box::pin(async move {
            persist_with_policy(provider.as_ref(), item.as_ref(), policy)
                .await
                .map_err(|e| Box::new(e) as BoxError)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingProvider {
        seen: Mutex<HashSet<String>>,
        upserts: AtomicUsize,
    }

    #[async_trait]
    impl PersistenceProvider for RecordingProvider {
        fn type_id(&self) -> &str {
            "recording"
        }

        fn supports(&self, entity: &(dyn Any + Send)) -> bool {
            entity.downcast_ref::<String>().is_some()
        }

        async fn persist(&self, entity: &(dyn Any + Send)) -> Result<(), PersistError> {
            let key = entity
                .downcast_ref::<String>()
                .ok_or_else(|| PersistError::Backend("unsupported entity".into()))?
                .clone();
            let mut seen = self.seen.lock().unwrap();
            if !seen.insert(key.clone()) {
                return Err(PersistError::DuplicateKey { detail: key });
            }
            Ok(())
        }

        async fn persist_or_update(&self, _entity: &(dyn Any + Send)) -> Result<(), PersistError> {
            self.upserts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn fail_policy_surfaces_duplicates() {
        let provider = RecordingProvider::default();
        let entity: Box<dyn Any + Send> = Box::new("a".to_string());

        persist_with_policy(&provider, entity.as_ref(), DuplicateKeyPolicy::Fail)
            .await
            .unwrap();
        let err = persist_with_policy(&provider, entity.as_ref(), DuplicateKeyPolicy::Fail)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::DuplicateKey { .. }));
    }

    #[tokio::test]
    async fn ignore_policy_swallows_duplicates() {
        let provider = RecordingProvider::default();
        let entity: Box<dyn Any + Send> = Box::new("a".to_string());

        persist_with_policy(&provider, entity.as_ref(), DuplicateKeyPolicy::Ignore)
            .await
            .unwrap();
        persist_with_policy(&provider, entity.as_ref(), DuplicateKeyPolicy::Ignore)
            .await
            .unwrap();
        assert_eq!(provider.upserts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn upsert_policy_retries_as_update() {
        let provider = RecordingProvider::default();
        let entity: Box<dyn Any + Send> = Box::new("a".to_string());

        persist_with_policy(&provider, entity.as_ref(), DuplicateKeyPolicy::Upsert)
            .await
            .unwrap();
        persist_with_policy(&provider, entity.as_ref(), DuplicateKeyPolicy::Upsert)
            .await
            .unwrap();
        assert_eq!(provider.upserts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_duplicate_failures_pass_through() {
        let provider = RecordingProvider::default();
        let entity: Box<dyn Any + Send> = Box::new(17_u64);
        assert!(!provider.supports(entity.as_ref()));

        let err = persist_with_policy(&provider, entity.as_ref(), DuplicateKeyPolicy::Upsert)
            .await
            .unwrap_err();
        assert!(matches!(err, PersistError::Backend(_)));
        assert_eq!(provider.upserts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn policy_parses_from_config() {
        assert_eq!(
            serde_json::from_str::<DuplicateKeyPolicy>("\"upsert\"").unwrap(),
            DuplicateKeyPolicy::Upsert
        );
        assert_eq!(DuplicateKeyPolicy::default(), DuplicateKeyPolicy::Fail);
    }
}
