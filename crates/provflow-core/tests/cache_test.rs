mod common;

use common::*;
use provflow_cloud::{ControlPlane, ResourceClass};
use provflow_core::{ObjectCache, ProvisionError};

const BARE: &str = r#"
name: bare
defaults:
  provision:
    provider_name: aws
cluster:
  name: c
"#;

#[tokio::test]
async fn test_empty_class_reads_only_the_document() {
    let h = Harness::new();
    let provision = h.deploy_running(BARE).await;
    let cache = ObjectCache::new(provision.id(), h.store.clone(), h.cloud.clone());

    let reads = h.store.reads();
    let infos = h.cloud.count("info ");

    let hosts = cache.get_objects(ResourceClass::Host, false).await.unwrap();

    assert!(hosts.is_empty());
    assert_eq!(h.store.reads(), reads + 1);
    assert_eq!(h.cloud.count("info "), infos);
}

#[tokio::test]
async fn test_entries_are_reused_until_forced() {
    let h = Harness::new();
    let provision = h.deploy_running(EDGE).await;
    let cache = ObjectCache::new(provision.id(), h.store.clone(), h.cloud.clone());
    let infos = h.cloud.count("info datastores");

    let first = cache.get_objects(ResourceClass::Datastore, false).await.unwrap();
    let second = cache.get_objects(ResourceClass::Datastore, false).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].id, second[0].id);
    assert_eq!(h.cloud.count("info datastores"), infos + 1);

    cache.get_objects(ResourceClass::Datastore, true).await.unwrap();
    assert_eq!(h.cloud.count("info datastores"), infos + 2);

    cache.invalidate().await;
    cache.get_objects(ResourceClass::Datastore, false).await.unwrap();
    assert_eq!(h.cloud.count("info datastores"), infos + 3);
}

#[tokio::test]
async fn test_concurrent_readers_share_one_refresh() {
    let h = Harness::new();
    let provision = h.deploy_running(EDGE).await;
    let cache = ObjectCache::new(provision.id(), h.store.clone(), h.cloud.clone());
    let infos = h.cloud.count("info hosts");

    let (a, b) = tokio::join!(
        cache.get_objects(ResourceClass::Host, false),
        cache.get_objects(ResourceClass::Host, false)
    );

    assert_eq!(a.unwrap().len(), 2);
    assert_eq!(b.unwrap().len(), 2);
    assert_eq!(h.cloud.count("info hosts"), infos + 2);
}

#[tokio::test]
async fn test_missing_document_is_recoverable() {
    let h = Harness::new();
    let cache = ObjectCache::new(9999, h.store.clone(), h.cloud.clone());

    let err = cache.get_objects(ResourceClass::Host, false).await.unwrap_err();

    assert!(err.is_recoverable());
    assert!(matches!(err, ProvisionError::Recoverable(ref msg) if msg.contains("9999")));
}

#[tokio::test]
async fn test_vanished_object_is_recoverable() {
    let h = Harness::new();
    let provision = h.deploy_running(EDGE).await;
    let host = provision.objects(ResourceClass::Host)[0].id;
    h.cloud
        .delete(ResourceClass::Host, host, true, None)
        .await
        .unwrap();

    let cache = ObjectCache::new(provision.id(), h.store.clone(), h.cloud.clone());
    let err = cache.get_objects(ResourceClass::Host, true).await.unwrap_err();

    assert!(err.is_recoverable());
    assert!(err.to_string().contains(&format!("host {}", host)));
}
