use nexa_election::store::{LeaseStore, MemoryLeaseStore};
use nexa_election::{ElectionConfig, ElectionError, LeaderElection};
use std::sync::Arc;
use std::time::Duration;

const TTL: Duration = Duration::from_secs(10);

fn cluster(n: usize) -> Vec<Arc<MemoryLeaseStore>> {
    (0..n)
        .map(|i| Arc::new(MemoryLeaseStore::new(format!("store-{}", i))))
        .collect()
}

fn node(stores: &[Arc<MemoryLeaseStore>], id: &str) -> LeaderElection {
    let handles = stores
        .iter()
        .map(|s| Arc::clone(s) as Arc<dyn LeaseStore>)
        .collect();
    let mut config = ElectionConfig::default();
    config.candidate_id = Some(id.to_string());
    config.store_timeout_ms = 200;
    LeaderElection::with_stores(handles, &config).unwrap()
}

#[test_log::test(tokio::test)]
async fn test_first_candidate_wins_and_second_sees_it() {
    let stores = cluster(3);
    let a = node(&stores, "A");
    let b = node(&stores, "B");

    assert_eq!(a.elect("svc", "A", TTL).await.unwrap(), "A");
    assert_eq!(b.elect("svc", "B", TTL).await.unwrap(), "A");
    assert_eq!(b.get_leader("svc").await.unwrap().as_deref(), Some("A"));

    for store in &stores {
        assert_eq!(store.holder("svc").as_deref(), Some("A"));
    }
    assert!(a.is_leader("svc", "A"));
    assert!(!b.is_leader("svc", "B"));
}

#[test_log::test(tokio::test)]
async fn test_renewal_is_idempotent() {
    let stores = cluster(3);
    let a = node(&stores, "A");

    for _ in 0..5 {
        assert_eq!(a.elect("svc", "A", TTL).await.unwrap(), "A");
    }
    assert!(stores.iter().all(|s| s.holder("svc").as_deref() == Some("A")));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_successor_takes_over_after_expiry() {
    let stores = cluster(3);
    let a = node(&stores, "A");
    let b = node(&stores, "B");

    assert_eq!(a.elect("svc", "A", TTL).await.unwrap(), "A");
    assert_eq!(b.elect("svc", "B", TTL).await.unwrap(), "A");

    // A stops renewing
    tokio::time::advance(TTL + Duration::from_millis(100)).await;

    assert_eq!(b.elect("svc", "B", TTL).await.unwrap(), "B");
    assert!(!a.is_leader("svc", "A"));
    assert_eq!(a.get_leader("svc").await.unwrap().as_deref(), Some("B"));
}

#[test_log::test(tokio::test)]
async fn test_release_by_non_holder_keeps_lease() {
    let stores = cluster(3);
    let x = node(&stores, "X");
    let y = node(&stores, "Y");

    assert_eq!(x.elect("svc", "X", TTL).await.unwrap(), "X");
    assert!(!y.release("svc", "Y").await.unwrap());
    assert!(stores.iter().all(|s| s.holder("svc").as_deref() == Some("X")));

    assert!(x.release("svc", "X").await.unwrap());
    assert!(stores.iter().all(|s| s.holder("svc").is_none()));
    assert_eq!(y.get_leader("svc").await.unwrap(), None);
    assert_eq!(y.elect("svc", "Y", TTL).await.unwrap(), "Y");
}

#[test_log::test(tokio::test)]
async fn test_two_unreachable_stores_of_five_still_elect() {
    let stores = cluster(5);
    stores[3].set_available(false);
    stores[4].set_latency(Duration::from_secs(5));
    let a = node(&stores, "A");

    assert_eq!(a.elect("svc", "A", TTL).await.unwrap(), "A");
    assert!(a.is_leader("svc", "A"));
}

#[test_log::test(tokio::test)]
async fn test_three_unreachable_stores_of_five_is_no_quorum() {
    let stores = cluster(5);
    for store in &stores[2..] {
        store.set_available(false);
    }
    let a = node(&stores, "A");

    let err = a.elect("svc", "A", TTL).await.unwrap_err();
    match err {
        ElectionError::NoQuorum {
            configured,
            responded,
            best,
            ..
        } => {
            assert_eq!(configured, 5);
            assert_eq!(responded, 2);
            assert_eq!(best, 2);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(!a.is_leader("svc", "A"));

    let err = a.get_leader("svc").await.unwrap_err();
    assert!(err.is_retriable());
}

#[test_log::test(tokio::test)]
async fn test_split_stores_give_no_winner() {
    let stores = cluster(3);
    stores[0].seed("svc", "P", TTL);
    stores[1].seed("svc", "Q", TTL);
    let r = node(&stores, "R");

    // store-2 grants R, but R only has one vote out of three
    assert!(matches!(
        r.elect("svc", "R", TTL).await,
        Err(ElectionError::NoQuorum { best: 1, .. })
    ));
    assert!(matches!(
        r.get_leader("svc").await,
        Err(ElectionError::NoQuorum { .. })
    ));
}

#[test]
fn test_config_errors() {
    let stores = cluster(1);
    let handles: Vec<Arc<dyn LeaseStore>> = stores
        .iter()
        .map(|s| Arc::clone(s) as Arc<dyn LeaseStore>)
        .collect();

    let mut config = ElectionConfig::default();
    config.ttl_ms = 0;
    assert!(matches!(
        LeaderElection::with_stores(handles.clone(), &config),
        Err(ElectionError::Config(_))
    ));

    assert!(matches!(
        LeaderElection::with_stores(Vec::new(), &ElectionConfig::default()),
        Err(ElectionError::Config(_))
    ));

    let mut config = ElectionConfig::default();
    config.stores = vec!["carrier-pigeon://coop".to_string()];
    assert!(matches!(
        LeaderElection::from_config(&config),
        Err(ElectionError::Config(_))
    ));
}
