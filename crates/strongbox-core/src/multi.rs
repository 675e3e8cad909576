use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, instrument, warn};

use crate::service::{MemberFailure, Operation, Service, ServiceError};

/// Presents an ordered group of equivalent replicas as one logical store.
///
/// Writes and deletes go to every member and succeed only when every member
/// succeeds. Reads walk the members in construction order and return the first
/// value found, skipping members that are missing the key, unreachable, or
/// unable to decrypt it.
pub struct MultiService {
    members: Vec<Arc<dyn Service>>,
}

impl std::fmt::Debug for MultiService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiService")
            .field(
                "members",
                &self.members.iter().map(|m| m.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl MultiService {
    /// Group `members`; an empty group cannot serve anything and is rejected.
    pub fn new(members: Vec<Arc<dyn Service>>) -> Result<Self, ServiceError> {
        if members.is_empty() {
            return Err(ServiceError::configuration(
                "an aggregate store needs at least one member",
            ));
        }
        debug!(members = members.len(), "composing aggregate store");
        Ok(Self { members })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    async fn fan_out<'a, F, Fut>(&'a self, operation: Operation, op: F) -> Result<(), ServiceError>
    where
        F: Fn(&'a Arc<dyn Service>) -> Fut,
        Fut: std::future::Future<Output = Result<(), ServiceError>> + 'a,
    {
        // Every outcome is needed, so nothing is short-circuited.
        let results = join_all(self.members.iter().map(op)).await;

        let failures: Vec<MemberFailure> = results
            .into_iter()
            .enumerate()
            .filter_map(|(index, result)| {
                result.err().map(|error| MemberFailure {
                    index,
                    name: self.members[index].name(),
                    error: Box::new(error),
                })
            })
            .collect();

        if failures.is_empty() {
            return Ok(());
        }

        for failure in &failures {
            warn!(
                member = failure.index,
                store = failure.name,
                error = %failure.error,
                "{operation} did not reach replica"
            );
        }
        Err(ServiceError::PartialReplication {
            operation,
            total: self.members.len(),
            failures,
        })
    }
}

#[async_trait]
impl Service for MultiService {
    fn name(&self) -> &'static str {
        "multi"
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn get(&self, key: &str) -> Result<Vec<u8>, ServiceError> {
        let mut last_failure: Option<ServiceError> = None;

        for (index, member) in self.members.iter().enumerate() {
            match member.get(key).await {
                Ok(value) => return Ok(value),
                Err(ServiceError::NotFound { .. }) => {
                    debug!(member = index, store = member.name(), "key not present");
                }
                Err(err) => {
                    warn!(member = index, store = member.name(), error = %err, "skipping replica");
                    last_failure = Some(err);
                }
            }
        }

        // Absence is reported only when every replica answered that the key is absent.
        Err(last_failure.unwrap_or_else(|| ServiceError::not_found(key)))
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn set(&self, key: &str, value: &[u8]) -> Result<(), ServiceError> {
        self.fan_out(Operation::Set, |member| member.set(key, value))
            .await
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn delete(&self, key: &str) -> Result<(), ServiceError> {
        self.fan_out(Operation::Delete, |member| member.delete(key))
            .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ServiceError> {
        let results = join_all(self.members.iter().map(|m| m.list(prefix))).await;

        let mut keys = BTreeSet::new();
        let mut answered = false;
        let mut last_failure = None;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(found) => {
                    answered = true;
                    keys.extend(found);
                }
                Err(err) => {
                    warn!(member = index, error = %err, "list skipped replica");
                    last_failure = Some(err);
                }
            }
        }

        match (answered, last_failure) {
            (false, Some(err)) => Err(err),
            _ => Ok(keys.into_iter().collect()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::memory::MemoryService;

    /// Member that fails every call with a fixed error.
    struct Broken(ServiceError);

    #[async_trait]
    impl Service for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn get(&self, _key: &str) -> Result<Vec<u8>, ServiceError> {
            Err(self.0.clone())
        }

        async fn set(&self, _key: &str, _value: &[u8]) -> Result<(), ServiceError> {
            Err(self.0.clone())
        }

        async fn delete(&self, _key: &str) -> Result<(), ServiceError> {
            Err(self.0.clone())
        }

        async fn list(&self, _prefix: &str) -> Result<Vec<String>, ServiceError> {
            Err(self.0.clone())
        }
    }

    /// Memory member that counts reads.
    #[derive(Default)]
    struct Counting {
        store: MemoryService,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl Service for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn get(&self, key: &str) -> Result<Vec<u8>, ServiceError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.store.get(key).await
        }

        async fn set(&self, key: &str, value: &[u8]) -> Result<(), ServiceError> {
            self.store.set(key, value).await
        }

        async fn delete(&self, key: &str) -> Result<(), ServiceError> {
            self.store.delete(key).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, ServiceError> {
            self.store.list(prefix).await
        }
    }

    fn member(store: impl Service + 'static) -> Arc<dyn Service> {
        Arc::new(store)
    }

    fn unavailable() -> Arc<dyn Service> {
        Arc::new(Broken(ServiceError::unavailable("region down")))
    }

    #[test]
    fn empty_group_is_rejected() {
        let err = MultiService::new(Vec::new()).expect_err("must fail");
        assert!(matches!(err, ServiceError::Configuration { .. }));
    }

    #[tokio::test]
    async fn write_to_all_members_then_read_first() {
        let a = MemoryService::new();
        let b = MemoryService::new();
        let multi = MultiService::new(vec![member(a.clone()), member(b.clone())]).expect("multi");

        multi.set("vault-root", b"token").await.expect("set");
        assert_eq!(a.raw("vault-root").as_deref(), Some(&b"token"[..]));
        assert_eq!(b.raw("vault-root").as_deref(), Some(&b"token"[..]));
        assert_eq!(multi.get("vault-root").await.expect("get"), b"token");
    }

    #[tokio::test]
    async fn failing_member_fails_the_write_and_is_reported() {
        let healthy = MemoryService::with_entries([("vault-unseal-0", b"old".to_vec())]);
        let multi =
            MultiService::new(vec![member(healthy.clone()), unavailable()]).expect("multi");

        let err = multi
            .set("vault-unseal-0", b"new")
            .await
            .expect_err("write must not be masked");
        match err {
            ServiceError::PartialReplication {
                operation,
                total,
                failures,
            } => {
                assert_eq!(operation, Operation::Set);
                assert_eq!(total, 2);
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].index, 1);
                assert_eq!(failures[0].name, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
        // No rollback is attempted on the member that succeeded.
        assert_eq!(healthy.raw("vault-unseal-0").as_deref(), Some(&b"new"[..]));
    }

    #[tokio::test]
    async fn read_falls_back_past_unavailable_members() {
        let holder = MemoryService::with_entries([("vault-root", b"token".to_vec())]);
        let multi = MultiService::new(vec![unavailable(), unavailable(), member(holder)])
            .expect("multi");

        assert_eq!(multi.get("vault-root").await.expect("get"), b"token");
    }

    #[tokio::test]
    async fn empty_and_binary_values_replicate_unchanged() {
        let a = MemoryService::new();
        let b = MemoryService::new();
        let multi = MultiService::new(vec![member(a.clone()), member(b.clone())]).expect("multi");
        let binary: Vec<u8> = vec![0, 255, 128, 0x80, 0xBF, 0x00];

        multi.set("vault-unseal-0", b"").await.expect("set empty");
        multi.set("vault-unseal-1", &binary).await.expect("set binary");

        for replica in [&a, &b] {
            assert_eq!(replica.raw("vault-unseal-0").as_deref(), Some(&[][..]));
            assert_eq!(replica.raw("vault-unseal-1"), Some(binary.clone()));
        }
        assert!(multi.get("vault-unseal-0").await.expect("get empty").is_empty());
        assert_eq!(multi.get("vault-unseal-1").await.expect("get binary"), binary);
    }

    #[tokio::test]
    async fn read_skips_corrupt_members() {
        let holder = MemoryService::with_entries([("k", vec![0, 255])]);
        let corrupt = member(Broken(ServiceError::corrupt("k", "not base64")));
        let multi = MultiService::new(vec![corrupt, member(holder)]).expect("multi");

        assert_eq!(multi.get("k").await.expect("get"), vec![0, 255]);
    }

    #[tokio::test]
    async fn read_skips_members_that_cannot_decrypt() {
        let holder = MemoryService::with_entries([("k", b"v".to_vec())]);
        let undecryptable = member(Broken(ServiceError::DecryptionFailed {
            reason: "wrong key".into(),
        }));
        let multi = MultiService::new(vec![undecryptable, member(holder)]).expect("multi");

        assert_eq!(multi.get("k").await.expect("get"), b"v");
    }

    #[tokio::test]
    async fn read_stops_at_first_member_holding_the_value() {
        let first = Arc::new(Counting::default());
        let second = Arc::new(Counting::default());
        first.set("k", b"one").await.expect("set");
        second.set("k", b"two").await.expect("set");
        let multi = MultiService::new(vec![
            first.clone() as Arc<dyn Service>,
            second.clone() as Arc<dyn Service>,
        ]).expect("multi");

        assert_eq!(multi.get("k").await.expect("get"), b"one");
        assert_eq!(first.reads.load(Ordering::SeqCst), 1);
        assert_eq!(second.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn all_absent_is_not_found() {
        let multi = MultiService::new(vec![
            member(MemoryService::new()),
            member(MemoryService::new()),
            member(MemoryService::new()),
        ])
        .expect("multi");

        let err = multi.get("vault-root").await.expect_err("must fail");
        assert!(matches!(err, ServiceError::NotFound { .. }));
    }

    #[tokio::test]
    async fn all_unreachable_is_unavailable() {
        let multi = MultiService::new(vec![unavailable(), unavailable()]).expect("multi");

        let err = multi.get("vault-root").await.expect_err("must fail");
        assert!(matches!(err, ServiceError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn absent_plus_unreachable_is_not_reported_as_absent() {
        let multi =
            MultiService::new(vec![member(MemoryService::new()), unavailable()]).expect("multi");

        let err = multi.get("vault-root").await.expect_err("must fail");
        assert!(matches!(err, ServiceError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn delete_is_idempotent_across_members() {
        let multi = MultiService::new(vec![
            member(MemoryService::new()),
            member(MemoryService::new()),
        ])
        .expect("multi");

        multi.set("k", b"v").await.expect("set");
        multi.delete("k").await.expect("delete");
        multi.delete("k").await.expect("delete again");
        assert!(!multi.exists("k").await.expect("exists"));
    }

    #[tokio::test]
    async fn list_unions_responding_members() {
        let a = MemoryService::with_entries([("vault-unseal-0", vec![1]), ("vault-root", vec![2])]);
        let b = MemoryService::with_entries([("vault-unseal-1", vec![3]), ("vault-unseal-0", vec![1])]);
        let multi =
            MultiService::new(vec![member(a), unavailable(), member(b)]).expect("multi");

        assert_eq!(
            multi.list("vault-unseal-").await.expect("list"),
            vec!["vault-unseal-0".to_string(), "vault-unseal-1".to_string()]
        );

        let dead = MultiService::new(vec![unavailable()]).expect("multi");
        assert!(dead.list("").await.is_err());
    }
}
