//! Coordination Tests
//!
//! ## Test Scopes
//! - **Tree**: parents, versions, children and ephemeral lifetime.
//! - **Watches**: one-shot delivery on change, deletion and session loss.
//! - **Admin**: collection lifecycle and locked metadata updates.
//! - **Safety net**: stale, missing and loading shards lose their bit.

#[cfg(test)]
mod tests {
    use crate::coordination::*;
    use crate::error::CacheError;
    use std::sync::Arc;
    use std::time::Duration;

    const ROOT: &str = "/shardset";

    fn admin(coordinator: &MemoryCoordinator) -> CollectionAdmin {
        CollectionAdmin::new(Arc::new(coordinator.clone()), ROOT)
    }

    async fn publish_status(
        coordinator: &MemoryCoordinator,
        name: &str,
        shard: usize,
        heartbeat_ms: u64,
        loading: bool,
    ) {
        let status = ShardStatus {
            index: shard,
            address: format!("127.0.0.1:{}", 9000 + shard),
            size: 0,
            loading,
            generation: 0,
            heartbeat_ms,
        };
        coordinator
            .create(
                &shard_path(ROOT, name, shard),
                status.to_bytes().unwrap(),
                NodeMode::Ephemeral,
            )
            .await
            .unwrap();
    }

    // ============================================================
    // TREE
    // ============================================================

    #[tokio::test]
    async fn test_create_requires_parent() {
        let zk = MemoryCoordinator::new();

        let result = zk.create("/a/b", Vec::new(), NodeMode::Persistent).await;
        assert_eq!(result, Err(CoordinationError::NoNode("/a".into())));

        zk.create("/a", Vec::new(), NodeMode::Persistent).await.unwrap();
        zk.create("/a/b", b"x".to_vec(), NodeMode::Persistent).await.unwrap();

        assert_eq!(
            zk.create("/a/b", Vec::new(), NodeMode::Persistent).await,
            Err(CoordinationError::NodeExists("/a/b".into()))
        );
    }

    #[tokio::test]
    async fn test_versions_and_conditional_writes() {
        let zk = MemoryCoordinator::new();
        zk.create("/n", b"v0".to_vec(), NodeMode::Persistent).await.unwrap();

        assert_eq!(zk.get("/n").await.unwrap(), (b"v0".to_vec(), 0));
        assert_eq!(zk.set_data("/n", b"v1".to_vec(), Some(0)).await.unwrap(), 1);

        let stale = zk.set_data("/n", b"v2".to_vec(), Some(0)).await;
        assert!(matches!(stale, Err(CoordinationError::BadVersion { actual: 1, .. })));

        assert_eq!(zk.set_data("/n", b"v2".to_vec(), None).await.unwrap(), 2);
        assert_eq!(zk.get("/n").await.unwrap().0, b"v2".to_vec());
    }

    #[tokio::test]
    async fn test_children_are_direct_and_sorted() {
        let zk = MemoryCoordinator::new();
        for path in ["/r", "/r/b", "/r/a", "/r/a/deep", "/rx"] {
            zk.create(path, Vec::new(), NodeMode::Persistent).await.unwrap();
        }

        assert_eq!(zk.children("/r").await.unwrap(), vec!["a", "b"]);
        assert_eq!(
            zk.delete("/r/a").await,
            Err(CoordinationError::NotEmpty("/r/a".into()))
        );
    }

    #[tokio::test]
    async fn test_ephemeral_nodes_vanish_with_session() {
        let zk = MemoryCoordinator::new();
        let worker = zk.session();

        zk.create("/live", Vec::new(), NodeMode::Persistent).await.unwrap();
        worker.create("/live/0", Vec::new(), NodeMode::Ephemeral).await.unwrap();
        zk.create("/live/keep", Vec::new(), NodeMode::Persistent).await.unwrap();

        worker.close().await;

        assert!(!zk.exists("/live/0").await.unwrap());
        assert!(zk.exists("/live/keep").await.unwrap());
        assert_eq!(worker.exists("/live").await, Err(CoordinationError::SessionClosed));
    }

    // ============================================================
    // WATCHES
    // ============================================================

    #[tokio::test]
    async fn test_watch_fires_once_on_change() {
        let zk = MemoryCoordinator::new();
        zk.create("/w", Vec::new(), NodeMode::Persistent).await.unwrap();

        let (_, _, watch) = zk.get_and_watch("/w").await.unwrap();
        zk.set_data("/w", b"1".to_vec(), None).await.unwrap();

        let event = watch.fired().await.unwrap();
        assert_eq!(event.kind, WatchEventKind::DataChanged);
        assert_eq!(event.path, "/w");

        // Second change is not delivered to the spent watch; a re-armed one sees it.
        let (data, version, rearmed) = zk.get_and_watch("/w").await.unwrap();
        assert_eq!((data, version), (b"1".to_vec(), 1));
        zk.delete("/w").await.unwrap();
        assert_eq!(rearmed.fired().await.unwrap().kind, WatchEventKind::Deleted);
    }

    #[tokio::test]
    async fn test_exists_watch_sees_creation_and_ephemeral_expiry() {
        let zk = MemoryCoordinator::new();
        let worker = zk.session();
        zk.create("/p", Vec::new(), NodeMode::Persistent).await.unwrap();

        let (exists, watch) = zk.exists_and_watch("/p/e").await.unwrap();
        assert!(!exists);
        worker.create("/p/e", Vec::new(), NodeMode::Ephemeral).await.unwrap();
        assert_eq!(watch.fired().await.unwrap().kind, WatchEventKind::Created);

        let (exists, watch) = zk.exists_and_watch("/p/e").await.unwrap();
        assert!(exists);
        worker.close().await;
        assert_eq!(watch.fired().await.unwrap().kind, WatchEventKind::Deleted);
    }

    #[tokio::test]
    async fn test_closed_session_drops_its_watches() {
        let zk = MemoryCoordinator::new();
        let client = zk.session();
        zk.create("/q", Vec::new(), NodeMode::Persistent).await.unwrap();

        let (_, _, watch) = client.get_and_watch("/q").await.unwrap();
        client.close().await;

        assert!(watch.fired().await.is_none());
    }

    // ============================================================
    // BITMAP & METADATA
    // ============================================================

    #[test]
    fn test_bitmap_is_lsb_first() {
        let mut bitmap = AvailabilityBitmap::all_down(10);
        assert!(bitmap.set(0, true));
        assert!(bitmap.set(9, true));
        assert!(!bitmap.set(9, true));

        assert_eq!(bitmap.as_bytes(), &[0b0000_0001, 0b0000_0010]);
        assert_eq!(bitmap.up_count(), 2);
        assert!(!bitmap.is_up(10));
        assert!(!bitmap.set(42, true));

        assert_eq!(AvailabilityBitmap::all_up(3).as_bytes(), &[0b0000_0111]);
    }

    /// Same field layout as `CollectionInfo`, with the bitmap internals exposed.
    #[derive(serde::Serialize)]
    struct RawInfo {
        name: String,
        kind: CollectionKind,
        shard_count: usize,
        replication: usize,
        bits: Vec<u8>,
        len: usize,
        source: Option<SourceDescriptor>,
        port: u16,
    }

    fn raw_info(shard_count: usize, bits: Vec<u8>, len: usize) -> Vec<u8> {
        bincode::serialize(&RawInfo {
            name: "corrupt".to_string(),
            kind: CollectionKind::DynamicSet,
            shard_count,
            replication: 2,
            bits,
            len,
            source: None,
            port: 0,
        })
        .unwrap()
    }

    #[test]
    fn test_metadata_rejects_short_bitmap() {
        let valid = CollectionInfo::from_bytes(&raw_info(16, vec![0xff, 0x01], 16)).unwrap();
        assert!(valid.availability.is_up(8));
        assert!(!valid.availability.is_up(9));

        assert!(matches!(
            CollectionInfo::from_bytes(&raw_info(16, Vec::new(), 16)),
            Err(CoordinationError::Decode(_))
        ));
        assert!(matches!(
            CollectionInfo::from_bytes(&raw_info(16, vec![0; 5], 16)),
            Err(CoordinationError::Decode(_))
        ));
        assert!(matches!(
            CollectionInfo::from_bytes(&raw_info(16, vec![0; 2], 8)),
            Err(CoordinationError::Decode(_))
        ));
    }

    #[test]
    fn test_load_quorum() {
        let info = CollectionInfo::new("c", CollectionKind::StaticSet, 4, 2, 0);
        assert_eq!(info.effective_replication(), 2);
        assert_eq!(info.load_quorum(), 3);

        let over = CollectionInfo::new("c", CollectionKind::StaticSet, 2, 5, 0);
        assert_eq!(over.effective_replication(), 2);
        assert_eq!(over.load_quorum(), 1);
    }

    #[test]
    fn test_collection_kind_names() {
        assert_eq!("map".parse::<CollectionKind>(), Ok(CollectionKind::MapSet));
        assert_eq!("Dynamic_Set".parse::<CollectionKind>(), Ok(CollectionKind::DynamicSet));
        assert_eq!(CollectionKind::StaticSet.to_string(), "static-set");
        assert_eq!("triple".parse::<CollectionKind>(), Ok(CollectionKind::TripleSet));
        assert_eq!(CollectionKind::TripleSet.to_string(), "triple-set");
        assert!(CollectionKind::TripleSet.is_triple() && !CollectionKind::TripleSet.is_plain_set());
        assert!("tree".parse::<CollectionKind>().is_err());
    }

    // ============================================================
    // ADMIN
    // ============================================================

    #[tokio::test]
    async fn test_collection_lifecycle() {
        let zk = MemoryCoordinator::new();
        let admin = admin(&zk);

        let info = admin.create("users", CollectionKind::DynamicSet, 4, 2, 7000).await.unwrap();
        assert_eq!(info.availability.up_count(), 0);
        assert!(admin.exists("users").await.unwrap());
        assert_eq!(admin.info("users").await.unwrap(), info);
        assert_eq!(admin.list().await.unwrap(), vec!["users"]);

        assert!(matches!(
            admin.create("users", CollectionKind::DynamicSet, 4, 2, 7000).await,
            Err(CacheError::Coordination(CoordinationError::NodeExists(_)))
        ));

        publish_status(&zk, "users", 0, now_ms(), false).await;
        admin.destroy("users").await.unwrap();

        assert!(!admin.exists("users").await.unwrap());
        assert!(!zk.exists(&lock_path(ROOT, "users")).await.unwrap());
        assert!(matches!(
            admin.info("users").await,
            Err(CacheError::CollectionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_bad_shape() {
        let zk = MemoryCoordinator::new();
        let admin = admin(&zk);

        assert!(matches!(
            admin.create("c", CollectionKind::MapSet, 0, 1, 0).await,
            Err(CacheError::Config(_))
        ));
        assert!(matches!(
            admin.create("c", CollectionKind::MapSet, 3, 0, 0).await,
            Err(CacheError::Config(_))
        ));
        assert!(matches!(
            admin.create("a/b", CollectionKind::MapSet, 3, 1, 0).await,
            Err(CacheError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_availability_and_source_updates() {
        let zk = MemoryCoordinator::new();
        let admin = admin(&zk);
        admin.create("words", CollectionKind::StaticSet, 3, 2, 0).await.unwrap();

        assert!(admin.set_shard_availability("words", 1, true).await.unwrap());
        assert!(!admin.set_shard_availability("words", 1, true).await.unwrap());
        assert!(admin.info("words").await.unwrap().availability.is_up(1));

        let first = admin.set_source("words", "/data/a.txt", 100, 0.01).await.unwrap();
        let second = admin.set_source("words", "/data/b.txt", 200, 0.01).await.unwrap();
        assert_eq!(first.generation, 1);
        assert_eq!(second.generation, 2);
        assert_eq!(admin.info("words").await.unwrap().source, Some(second));
    }

    #[tokio::test]
    async fn test_concurrent_updates_are_serialized() {
        let zk = MemoryCoordinator::new();
        let admin = admin(&zk);
        admin.create("busy", CollectionKind::DynamicSet, 16, 1, 0).await.unwrap();

        let mut tasks = Vec::new();
        for shard in 0..16 {
            // Each writer uses its own session, like separate workers would.
            let writer = CollectionAdmin::new(Arc::new(zk.session()), ROOT);
            tasks.push(tokio::spawn(async move {
                writer.set_shard_availability("busy", shard, true).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(admin.info("busy").await.unwrap().availability.up_count(), 16);
    }

    // ============================================================
    // SAFETY NET
    // ============================================================

    #[tokio::test]
    async fn test_safety_net_reconciles_bitmap() {
        let zk = MemoryCoordinator::new();
        let admin = admin(&zk);
        admin.create("net", CollectionKind::DynamicSet, 4, 2, 0).await.unwrap();
        for shard in 0..4 {
            admin.set_shard_availability("net", shard, true).await.unwrap();
        }

        let now = now_ms();
        publish_status(&zk, "net", 0, now, false).await;
        publish_status(&zk, "net", 1, now - 60_000, false).await;
        publish_status(&zk, "net", 2, now, true).await;
        // Shard 3 never published a status node.

        let net = SafetyNet::new(admin.clone(), Duration::from_secs(5), Duration::from_secs(1));
        let mut changes = net.sweep("net").await.unwrap();
        changes.sort();
        assert_eq!(changes, vec![(1, false), (2, false), (3, false)]);

        let bitmap = admin.info("net").await.unwrap().availability;
        assert!(bitmap.is_up(0));
        assert_eq!(bitmap.up_count(), 1);

        // A second sweep is a no-op.
        assert!(net.sweep("net").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_safety_net_restores_fresh_shard() {
        let zk = MemoryCoordinator::new();
        let admin = admin(&zk);
        admin.create("back", CollectionKind::DynamicSet, 2, 1, 0).await.unwrap();
        publish_status(&zk, "back", 0, now_ms(), false).await;

        let net = SafetyNet::new(admin.clone(), Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(net.sweep_all().await.unwrap(), 1);
        assert!(admin.info("back").await.unwrap().availability.is_up(0));
    }
}
