use std::sync::Arc;

use strongbox_core::{keys, EnvelopeService, MultiService, Service, ServiceError};
use strongbox_storage::{FileService, LocalKeyManagement};

#[tokio::test]
async fn sealed_files_never_hold_plaintext() {
    let dir = tempfile::tempdir().expect("tempdir");
    let files = FileService::new(dir.path().join("data")).expect("file store");
    let kms = LocalKeyManagement::from_key_file(dir.path().join("local.key")).expect("kms");
    let store = EnvelopeService::new(kms, files);

    store
        .set(keys::ROOT_TOKEN, b"s.6Vx1root")
        .await
        .expect("set");
    assert_eq!(
        store.get(keys::ROOT_TOKEN).await.expect("get"),
        b"s.6Vx1root"
    );

    for entry in std::fs::read_dir(dir.path().join("data")).expect("read dir") {
        let bytes = std::fs::read(entry.expect("entry").path()).expect("read");
        assert!(!String::from_utf8_lossy(&bytes).contains("s.6Vx1root"));
    }
}

#[tokio::test]
async fn a_second_key_cannot_open_sealed_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path().join("data");

    let writer = EnvelopeService::new(
        LocalKeyManagement::ephemeral(),
        FileService::new(&root).expect("file store"),
    );
    writer.set("vault-unseal-0", b"share").await.expect("set");

    let reader = EnvelopeService::new(
        LocalKeyManagement::ephemeral(),
        FileService::new(&root).expect("file store"),
    );
    let err = reader.get("vault-unseal-0").await.expect_err("wrong key");
    assert!(matches!(err, ServiceError::DecryptionFailed { .. }));
}

#[tokio::test]
async fn replicated_sealed_stores_agree() {
    let dir = tempfile::tempdir().expect("tempdir");
    let members: Vec<Arc<dyn Service>> = (0..3)
        .map(|i| {
            let files = FileService::new(dir.path().join(format!("region-{i}"))).expect("files");
            Arc::new(EnvelopeService::new(LocalKeyManagement::ephemeral(), files)) as Arc<dyn Service>
        })
        .collect();
    let store = MultiService::new(members.clone()).expect("multi");

    for i in 0..3 {
        store
            .set(&keys::unseal_key(i), format!("share-{i}").as_bytes())
            .await
            .expect("set");
    }
    for member in &members {
        assert_eq!(
            member.get(&keys::unseal_key(1)).await.expect("replica"),
            b"share-1"
        );
    }
    assert_eq!(
        store.list(keys::UNSEAL_PREFIX).await.expect("list"),
        vec!["vault-unseal-0", "vault-unseal-1", "vault-unseal-2"]
    );

    store.delete(&keys::unseal_key(2)).await.expect("delete");
    assert!(store
        .get(&keys::unseal_key(2))
        .await
        .expect_err("deleted")
        .is_not_found());
}

#[tokio::test]
async fn sealed_files_keep_empty_and_binary_values() {
    let dir = tempfile::tempdir().expect("tempdir");
    let files = FileService::new(dir.path().join("data")).expect("file store");
    let kms = LocalKeyManagement::from_key_file(dir.path().join("local.key")).expect("kms");
    let store = EnvelopeService::new(kms, files);
    let binary: Vec<u8> = (0..=255u8).rev().chain([0, 0xC3, 0x28]).collect();

    store.set(&keys::unseal_key(0), b"").await.expect("set empty");
    store.set(&keys::unseal_key(1), &binary).await.expect("set binary");

    assert!(store.get(&keys::unseal_key(0)).await.expect("get empty").is_empty());
    assert_eq!(store.get(&keys::unseal_key(1)).await.expect("get binary"), binary);
    assert_eq!(
        store.list(keys::UNSEAL_PREFIX).await.expect("list"),
        vec!["vault-unseal-0", "vault-unseal-1"]
    );
}

#[tokio::test]
async fn plain_files_keep_empty_and_binary_values() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = FileService::new(dir.path()).expect("file store");
    let binary = [0u8, 255, 128, 0xFE, 0x00];

    store.set("empty", b"").await.expect("set empty");
    store.set("binary", &binary).await.expect("set binary");

    assert!(store.get("empty").await.expect("get empty").is_empty());
    assert_eq!(store.get("binary").await.expect("get binary"), binary);
}
