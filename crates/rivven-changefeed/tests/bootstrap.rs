//! Lease store bootstrap and legacy migration

mod common;

use common::*;
use rivven_changefeed::{
    BootstrapOutcome, Bootstrapper, ChangeFeedError, DocumentLeaseManager, FeedRange,
    InMemoryChangeFeed, InMemoryDocumentStore, LeaseContainer, LeaseManager, LeaseScheme,
    LeaseSchemeVersion, LeaseStore, LegacyLeases, ProcessorOptions,
};
use std::sync::Arc;
use std::time::Duration;

const LOCK_DURATION: Duration = Duration::from_secs(5);

struct Fixture {
    store: Arc<InMemoryDocumentStore>,
    feed: Arc<InMemoryChangeFeed>,
    manager: Arc<RecordingLeaseManager>,
    synchronizer: Arc<RecordingSynchronizer>,
}

fn fixture(partitions: usize) -> Fixture {
    init_test_logging();
    let options = ProcessorOptions::for_testing("host-a");
    let store = Arc::new(InMemoryDocumentStore::new());
    let feed = Arc::new(InMemoryChangeFeed::new("orders", partitions));
    let manager = RecordingLeaseManager::new(store.clone(), "", "host-a");
    let synchronizer = RecordingSynchronizer::new(feed.clone(), manager.clone(), &options);
    Fixture {
        store,
        feed,
        manager,
        synchronizer,
    }
}

impl Fixture {
    fn bootstrapper(&self, scheme: LeaseScheme) -> Bootstrapper {
        Bootstrapper::new(
            self.synchronizer.clone(),
            self.manager.clone(),
            self.manager.clone(),
            LOCK_DURATION,
            scheme,
        )
    }
}

#[tokio::test]
async fn test_initialized_store_is_left_alone() {
    let f = fixture(2);
    f.manager.mark_initialized().await.unwrap();

    let outcome = f
        .bootstrapper(LeaseScheme::EpochRange)
        .initialize()
        .await
        .unwrap();

    assert_eq!(outcome, BootstrapOutcome::AlreadyInitialized);
    assert_eq!(f.manager.lock_acquisitions(), 0);
    assert_eq!(f.synchronizer.create_missing_calls(), 0);
    assert_eq!(f.synchronizer.create_missing_from_calls(), 0);
    assert!(f.manager.get_all_leases().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_fresh_store_gets_one_lease_per_partition() {
    let f = fixture(4);
    let bootstrapper = f.bootstrapper(LeaseScheme::EpochRange);
    assert_eq!(bootstrapper.scheme(), LeaseSchemeVersion::EpochRange);

    assert_eq!(
        bootstrapper.initialize().await.unwrap(),
        BootstrapOutcome::Initialized
    );

    let tokens: Vec<String> = f.manager.tokens().await.into_iter().collect();
    assert_eq!(tokens, vec!["-40", "40-80", "80-C0", "C0-FF"]);
    assert!(f.manager.is_initialized().await.unwrap());
    assert_eq!(f.manager.lock_acquisitions(), 1);

    // lock was released: another host can take it right away
    let other = DocumentLeaseManager::new(f.store.clone(), "", "host-b");
    assert!(other.acquire_initialization_lock(LOCK_DURATION).await.unwrap());

    // running again is a no-op
    assert_eq!(
        bootstrapper.initialize().await.unwrap(),
        BootstrapOutcome::AlreadyInitialized
    );
    assert_eq!(f.synchronizer.create_missing_calls(), 1);
}

#[tokio::test]
async fn test_lock_held_elsewhere_does_not_mint_leases() {
    let f = fixture(2);
    let other = DocumentLeaseManager::new(f.store.clone(), "", "host-b");
    assert!(other.acquire_initialization_lock(LOCK_DURATION).await.unwrap());

    let outcome = f
        .bootstrapper(LeaseScheme::EpochRange)
        .initialize()
        .await
        .unwrap();

    assert_eq!(outcome, BootstrapOutcome::LockHeldElsewhere);
    assert_eq!(f.synchronizer.create_missing_calls(), 0);
    assert!(f.manager.get_all_leases().await.unwrap().is_empty());
    assert!(!f.manager.is_initialized().await.unwrap());

    // the foreign lock is untouched
    assert!(other.release_initialization_lock().await.unwrap());
}

#[tokio::test]
async fn test_concurrent_bootstrap_initializes_once() {
    let f = fixture(3);
    let peer_manager = RecordingLeaseManager::new(f.store.clone(), "", "host-b");
    let peer_sync = RecordingSynchronizer::new(
        f.feed.clone(),
        peer_manager.clone(),
        &ProcessorOptions::for_testing("host-b"),
    );
    let peer = Bootstrapper::new(
        peer_sync.clone(),
        peer_manager.clone(),
        peer_manager.clone(),
        LOCK_DURATION,
        LeaseScheme::EpochRange,
    );
    let local = f.bootstrapper(LeaseScheme::EpochRange);

    let (a, b) = tokio::join!(local.initialize(), peer.initialize());
    let outcomes = [a.unwrap(), b.unwrap()];
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == BootstrapOutcome::Initialized)
            .count(),
        1
    );

    assert_eq!(f.manager.get_all_leases().await.unwrap().len(), 3);
    assert_eq!(f.manager.total(Op::Create) + peer_manager.total(Op::Create), 3);
}

#[tokio::test]
async fn test_legacy_lease_with_progress_is_rejected() {
    let f = fixture(2);
    f.manager
        .create_lease_if_not_exist(
            FeedRange::PartitionKeyRange("0".into()),
            Some("\"42\"".into()),
        )
        .await
        .unwrap();
    let before = f.manager.get_all_leases().await.unwrap();

    let err = f
        .bootstrapper(LeaseScheme::EpochRange)
        .initialize()
        .await
        .unwrap_err();

    assert!(matches!(err, ChangeFeedError::IllegalState(_)), "{err}");
    assert_eq!(f.manager.get_all_leases().await.unwrap(), before);
    assert_eq!(f.synchronizer.create_missing_calls(), 0);
    assert!(!f.manager.is_initialized().await.unwrap());

    // lock released even though initialization failed
    let other = DocumentLeaseManager::new(f.store.clone(), "", "host-b");
    assert!(other.acquire_initialization_lock(LOCK_DURATION).await.unwrap());
}

#[tokio::test]
async fn test_uninitialized_legacy_store_with_progress_is_rejected() {
    let f = fixture(2);
    // a half-written range lease plus a legacy store that never finished
    f.manager
        .create_lease_if_not_exist(FeedRange::Epk(rivven_changefeed::Range::new("", "80")), None)
        .await
        .unwrap();

    let legacy_store = Arc::new(InMemoryDocumentStore::new());
    let legacy = Arc::new(DocumentLeaseManager::new(legacy_store, "", "host-a"));
    legacy
        .create_lease_if_not_exist(
            FeedRange::PartitionKeyRange("1".into()),
            Some("\"7\"".into()),
        )
        .await
        .unwrap();

    let scheme = LeaseScheme::PkRangeId(LegacyLeases {
        store: legacy.clone(),
        container: legacy.clone(),
        manager: legacy.clone(),
    });
    let err = f.bootstrapper(scheme).initialize().await.unwrap_err();

    assert!(matches!(err, ChangeFeedError::IllegalState(_)));
    assert_eq!(legacy.get_all_leases().await.unwrap().len(), 1);
    assert_eq!(f.manager.get_all_leases().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_migrates_initialized_legacy_store() {
    let f = fixture(2);

    let legacy_store = Arc::new(InMemoryDocumentStore::new());
    let legacy = Arc::new(DocumentLeaseManager::new(legacy_store, "", "host-a"));
    legacy
        .create_lease_if_not_exist(
            FeedRange::PartitionKeyRange("0".into()),
            Some("\"3\"".into()),
        )
        .await
        .unwrap();
    legacy
        .create_lease_if_not_exist(FeedRange::PartitionKeyRange("1".into()), None)
        .await
        .unwrap();
    legacy.mark_initialized().await.unwrap();

    let scheme = LeaseScheme::PkRangeId(LegacyLeases {
        store: legacy.clone(),
        container: legacy.clone(),
        manager: legacy.clone(),
    });
    let bootstrapper = f.bootstrapper(scheme);
    assert_eq!(bootstrapper.scheme(), LeaseSchemeVersion::PkRangeId);

    assert_eq!(
        bootstrapper.initialize().await.unwrap(),
        BootstrapOutcome::Migrated
    );

    // no new ranges were minted, so the store lock stayed untouched
    assert_eq!(f.manager.lock_acquisitions(), 0);
    assert_eq!(f.synchronizer.create_missing_calls(), 0);
    assert_eq!(f.synchronizer.create_missing_from_calls(), 1);
    assert!(f.manager.is_initialized().await.unwrap());
    assert!(legacy.get_all_leases().await.unwrap().is_empty());

    let migrated = f.manager.lease("-80").await.unwrap();
    assert_eq!(migrated.scheme(), LeaseSchemeVersion::EpochRange);
    let state = migrated.continuation_state().unwrap().unwrap();
    assert_eq!(state.current().unwrap().token.as_deref(), Some("\"3\""));

    let fresh = f.manager.lease("80-FF").await.unwrap();
    let state = fresh.continuation_state().unwrap().unwrap();
    assert_eq!(state.current().unwrap().token, None);
}

#[tokio::test]
async fn test_migration_follows_split_legacy_partition() {
    let f = fixture(1);
    f.feed.split("0", "80").unwrap();

    let legacy_store = Arc::new(InMemoryDocumentStore::new());
    let legacy = Arc::new(DocumentLeaseManager::new(legacy_store, "", "host-a"));
    legacy
        .create_lease_if_not_exist(
            FeedRange::PartitionKeyRange("0".into()),
            Some("\"9\"".into()),
        )
        .await
        .unwrap();
    legacy.mark_initialized().await.unwrap();

    let scheme = LeaseScheme::PkRangeId(LegacyLeases {
        store: legacy.clone(),
        container: legacy.clone(),
        manager: legacy,
    });
    assert_eq!(
        f.bootstrapper(scheme).initialize().await.unwrap(),
        BootstrapOutcome::Migrated
    );

    let tokens: Vec<String> = f.manager.tokens().await.into_iter().collect();
    assert_eq!(tokens, vec!["-80", "80-FF"]);
    for token in tokens {
        let lease = f.manager.lease(&token).await.unwrap();
        let state = lease.continuation_state().unwrap().unwrap();
        assert_eq!(state.current().unwrap().token.as_deref(), Some("\"9\""));
    }
}
