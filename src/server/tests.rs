//! Shard Server Tests
//!
//! ## Test Scopes
//! - **Dispatch**: every command against each collection kind, including rejections.
//! - **Connections**: framing over real sockets, unknown commands, Kill.
//! - **Lifecycle**: availability publishing, heartbeat, source reloads, status endpoint.

#[cfg(test)]
mod tests {
    use crate::coordination::*;
    use crate::protocol::*;
    use crate::routing::ShardRouter;
    use crate::server::http::{collect_status, StatusContext};
    use crate::server::worker::stream_count;
    use crate::server::{Reply, ShardState, ShardWorker};
    use crate::storage::FileSource;
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{BufReader, BufWriter};
    use tokio::net::TcpStream;

    const ROOT: &str = "/server-tests";

    fn state(kind: CollectionKind) -> ShardState {
        let info = CollectionInfo::new("c", kind, 1, 1, 0);
        ShardState::new(&info, 0, ShardRouter::default(), Arc::new(FileSource), None)
    }

    fn request(command: Command, args: &[&str]) -> Request {
        Request::new(command, args.iter().map(|a| a.to_string()).collect())
    }

    async fn single(state: &ShardState, command: Command, args: &[&str]) -> Response {
        match state.dispatch(request(command, args)).await {
            Reply::Single(response) => response,
            other => panic!("expected a single reply, got {:?}", other),
        }
    }

    async fn stream(state: &ShardState, command: Command, args: &[&str]) -> Vec<Vec<String>> {
        match state.dispatch(request(command, args)).await {
            Reply::Stream(mut records) => {
                records.sort();
                records
            }
            other => panic!("expected a stream, got {:?}", other),
        }
    }

    fn is_error(response: &Response) -> bool {
        response.ack == AckCode::Error
    }

    async fn wait_until<F, Fut>(what: &str, mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !check().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
    }

    // ============================================================
    // DISPATCH
    // ============================================================

    #[tokio::test]
    async fn test_dynamic_set_dispatch() {
        let state = state(CollectionKind::DynamicSet);

        assert!(single(&state, Command::IsEmpty, &[]).await.as_bool().unwrap());
        assert!(single(&state, Command::Add, &["alpha"]).await.as_bool().unwrap());
        assert!(!single(&state, Command::Add, &["alpha"]).await.as_bool().unwrap());
        assert_eq!(
            single(&state, Command::AddAll, &["alpha", "beta", "gamma"]).await.as_u64().unwrap(),
            2
        );
        assert!(single(&state, Command::Contains, &["beta"]).await.as_bool().unwrap());
        assert_eq!(single(&state, Command::Size, &[]).await.as_u64().unwrap(), 3);

        assert_eq!(
            stream(&state, Command::Scan, &[]).await,
            vec![vec!["alpha"], vec!["beta"], vec!["gamma"]]
        );

        assert!(single(&state, Command::Remove, &["beta"]).await.as_bool().unwrap());
        assert!(!single(&state, Command::Contains, &["beta"]).await.as_bool().unwrap());

        single(&state, Command::Clear, &[]).await;
        assert!(single(&state, Command::IsEmpty, &[]).await.as_bool().unwrap());

        // No filter for mutable sets.
        assert!(single(&state, Command::Filter, &[]).await.args.is_empty());
    }

    #[tokio::test]
    async fn test_map_set_dispatch() {
        let state = state(CollectionKind::MapSet);

        assert!(single(&state, Command::Add, &["user", "a"]).await.as_bool().unwrap());
        assert!(single(&state, Command::Add, &["user", "b"]).await.as_bool().unwrap());
        assert_eq!(
            single(&state, Command::AddAll, &["other", "x", "user", "a"]).await.as_u64().unwrap(),
            1
        );

        assert!(single(&state, Command::Contains, &["user"]).await.as_bool().unwrap());
        assert!(single(&state, Command::ContainsEntry, &["user", "b"]).await.as_bool().unwrap());
        assert!(!single(&state, Command::ContainsEntry, &["other", "b"]).await.as_bool().unwrap());
        assert_eq!(stream(&state, Command::Get, &["user"]).await, vec![vec!["a"], vec!["b"]]);
        assert!(stream(&state, Command::Get, &["nobody"]).await.is_empty());
        assert_eq!(stream(&state, Command::Scan, &[]).await.len(), 3);

        assert!(single(&state, Command::Remove, &["user", "a"]).await.as_bool().unwrap());
        assert!(single(&state, Command::Remove, &["other"]).await.as_bool().unwrap());
        assert_eq!(single(&state, Command::Size, &[]).await.as_u64().unwrap(), 1);

        assert!(is_error(&single(&state, Command::AddAll, &["odd"]).await));
        assert!(is_error(&single(&state, Command::Add, &["only-key"]).await));
    }

    #[tokio::test]
    async fn test_triple_set_dispatch() {
        let state = state(CollectionKind::TripleSet);

        assert!(single(&state, Command::Add, &["ann", "knows", "bob"]).await.as_bool().unwrap());
        assert!(!single(&state, Command::Add, &["ann", "knows", "bob"]).await.as_bool().unwrap());
        assert_eq!(
            single(&state, Command::AddAll, &["ann", "likes", "tea", "bob", "knows", "ann"])
                .await
                .as_u64()
                .unwrap(),
            2
        );
        assert!(single(&state, Command::Contains, &["bob", "knows", "ann"]).await.as_bool().unwrap());
        assert!(!single(&state, Command::Contains, &["bob", "knows", "cid"]).await.as_bool().unwrap());
        assert_eq!(single(&state, Command::Size, &[]).await.as_u64().unwrap(), 3);

        assert_eq!(stream(&state, Command::Scan, &[]).await.len(), 3);
        assert_eq!(stream(&state, Command::Scan, &["ann"]).await.len(), 2);
        assert_eq!(
            stream(&state, Command::Scan, &["ann", "likes"]).await,
            vec![vec!["ann", "likes", "tea"]]
        );

        assert!(single(&state, Command::Remove, &["ann", "likes", "tea"]).await.as_bool().unwrap());
        assert!(stream(&state, Command::Scan, &["ann", "likes"]).await.is_empty());

        assert!(is_error(&single(&state, Command::Contains, &["ann"]).await));
        assert!(is_error(&single(&state, Command::AddAll, &["a", "b"]).await));
        assert!(is_error(&single(&state, Command::Scan, &["a", "b", "c"]).await));
        assert!(is_error(&single(&state, Command::RetainAll, &["a"]).await));
    }

    #[tokio::test]
    async fn test_retain_all_dispatch() {
        let state = state(CollectionKind::DynamicSet);
        single(&state, Command::AddAll, &["a", "b", "c"]).await;

        assert!(single(&state, Command::RetainAll, &["a", "c", "z"]).await.as_bool().unwrap());
        assert_eq!(stream(&state, Command::Scan, &[]).await, vec![vec!["a"], vec!["c"]]);
        assert!(!single(&state, Command::RetainAll, &["a", "c"]).await.as_bool().unwrap());

        assert!(single(&state, Command::RetainAll, &[]).await.as_bool().unwrap());
        assert!(single(&state, Command::IsEmpty, &[]).await.as_bool().unwrap());
    }

    #[test]
    fn test_stream_count_refuses_oversized_streams() {
        assert_eq!(stream_count(0), Ok(0));
        assert_eq!(stream_count(u32::MAX as usize), Ok(u32::MAX));

        let oversized = u32::MAX as usize + 1;
        match stream_count(oversized) {
            Err(response) => assert!(is_error(&response)),
            Ok(count) => panic!("header would claim {} records", count),
        }
    }

    #[tokio::test]
    async fn test_static_set_is_read_only() {
        let state = state(CollectionKind::StaticSet);

        for (command, args) in [
            (Command::Add, vec!["x"]),
            (Command::AddAll, vec!["x", "y"]),
            (Command::Remove, vec!["x"]),
            (Command::RetainAll, vec!["x"]),
            (Command::Clear, vec![]),
        ] {
            assert!(is_error(&single(&state, command, &args).await), "{} accepted", command);
        }
        assert!(!single(&state, Command::Contains, &["x"]).await.as_bool().unwrap());
    }

    #[tokio::test]
    async fn test_kind_mismatch_and_bad_arguments() {
        let set = state(CollectionKind::DynamicSet);
        assert!(is_error(&single(&set, Command::ContainsEntry, &["k", "v"]).await));
        assert!(is_error(&single(&set, Command::Get, &["k"]).await));
        assert!(is_error(&single(&set, Command::Contains, &[]).await));
        assert!(is_error(&single(&set, Command::Scan, &["prefix"]).await));
        assert!(is_error(&single(&set, Command::Load, &["/tmp/x", "1", "0.1"]).await));

        let unknown = set
            .dispatch(Request {
                code: 77,
                args: Vec::new(),
            })
            .await;
        assert!(matches!(unknown, Reply::Single(ref r) if is_error(r)));
    }

    #[tokio::test]
    async fn test_load_command_trains_filter() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for word in ["a", "b", "c"] {
            writeln!(file, "{}", word).unwrap();
        }
        file.flush().unwrap();

        let state = state(CollectionKind::StaticSet);
        let path = file.path().to_string_lossy().into_owned();
        assert!(single(&state, Command::Load, &[path.as_str(), "3", "0.05"]).await.as_bool().unwrap());

        assert_eq!(single(&state, Command::Size, &[]).await.as_u64().unwrap(), 3);
        let filter_reply = single(&state, Command::Filter, &[]).await;
        let filter = crate::filter::MembershipFilter::from_bytes(&filter_reply.args[0]).unwrap();
        for word in ["a", "b", "c"] {
            assert!(filter.test(word));
        }

        assert!(is_error(&single(&state, Command::Load, &[path.as_str(), "many", "0.05"]).await));
        assert!(is_error(&single(&state, Command::Load, &["/no/such/file", "3", "0.05"]).await));
        assert!(!state.is_serving());
    }

    #[tokio::test]
    async fn test_kill_requests_shutdown() {
        let state = state(CollectionKind::DynamicSet);
        assert!(matches!(
            state.dispatch(request(Command::Kill, &[])).await,
            Reply::Shutdown(_)
        ));
    }

    // ============================================================
    // CONNECTIONS
    // ============================================================

    #[tokio::test]
    async fn test_worker_over_tcp() {
        let state = Arc::new(state(CollectionKind::MapSet));
        let worker = ShardWorker::bind("127.0.0.1:0".parse().unwrap(), state)
            .await
            .unwrap();
        let addr = worker.local_addr().unwrap();
        let server = tokio::spawn(worker.serve());

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        write_request(&mut writer, &request(Command::Add, &["k", "v1"])).await.unwrap();
        assert!(read_response(&mut reader).await.unwrap().as_bool().unwrap());
        write_request(&mut writer, &request(Command::Add, &["k", "v2"])).await.unwrap();
        read_response(&mut reader).await.unwrap();

        // An unknown command is answered with an error and the link stays usable.
        write_request(&mut writer, &Request { code: 99, args: Vec::new() }).await.unwrap();
        assert!(matches!(read_response(&mut reader).await, Err(ProtocolError::Remote(_))));

        write_request(&mut writer, &request(Command::Get, &["k"])).await.unwrap();
        assert_eq!(read_stream_header(&mut reader).await.unwrap(), 2);
        let mut values = vec![
            read_stream_record(&mut reader).await.unwrap(),
            read_stream_record(&mut reader).await.unwrap(),
        ];
        read_end_marker(&mut reader).await.unwrap();
        values.sort();
        assert_eq!(values, vec![vec!["v1"], vec!["v2"]]);

        write_request(&mut writer, &Request::bare(Command::Kill)).await.unwrap();
        read_response(&mut reader).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("worker did not stop")
            .unwrap()
            .unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_handle_closes_open_links() {
        let state = Arc::new(state(CollectionKind::DynamicSet));
        let worker = ShardWorker::bind("127.0.0.1:0".parse().unwrap(), state)
            .await
            .unwrap();
        let addr = worker.local_addr().unwrap();
        let handle = worker.shutdown_handle();
        let server = tokio::spawn(worker.serve());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_request(&mut stream, &Request::bare(Command::Ping)).await.unwrap();
        read_response(&mut stream).await.unwrap();

        handle.trigger();
        server.await.unwrap().unwrap();

        let next = async {
            write_request(&mut stream, &Request::bare(Command::Ping)).await?;
            read_response(&mut stream).await
        };
        assert!(tokio::time::timeout(Duration::from_secs(5), next).await.unwrap().is_err());
    }

    // ============================================================
    // LIFECYCLE
    // ============================================================

    #[tokio::test]
    async fn test_worker_publishes_availability_and_heartbeat() {
        let zk = MemoryCoordinator::new();
        let admin = CollectionAdmin::new(Arc::new(zk.clone()), ROOT);
        let info = admin.create("live", CollectionKind::DynamicSet, 2, 1, 0).await.unwrap();

        let worker_admin = CollectionAdmin::new(Arc::new(zk.session()), ROOT);
        let state = Arc::new(ShardState::new(
            &info,
            1,
            ShardRouter::default(),
            Arc::new(FileSource),
            Some(worker_admin),
        ));
        let worker = ShardWorker::bind("127.0.0.1:0".parse().unwrap(), state)
            .await
            .unwrap()
            .with_heartbeat(Duration::from_millis(20));
        let handle = worker.shutdown_handle();
        let server = tokio::spawn(worker.serve());

        wait_until("shard 1 up", || async {
            admin.info("live").await.unwrap().availability.is_up(1)
        })
        .await;
        wait_until("status node", || async {
            zk.exists(&shard_path(ROOT, "live", 1)).await.unwrap()
        })
        .await;

        let context = StatusContext {
            admin: admin.clone(),
            collection: "live".into(),
        };
        let status = collect_status(&context).await.unwrap();
        assert_eq!(status.up, 1);
        assert!(status.shards[1].up);
        assert_eq!(status.shards[1].loading, Some(false));
        assert!(status.shards[0].address.is_none());

        handle.trigger();
        server.await.unwrap().unwrap();

        assert!(!admin.info("live").await.unwrap().availability.is_up(1));
        assert!(!zk.exists(&shard_path(ROOT, "live", 1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_static_shard_reloads_on_new_generation() {
        let mut first = tempfile::NamedTempFile::new().unwrap();
        writeln!(first, "one").unwrap();
        first.flush().unwrap();
        let mut second = tempfile::NamedTempFile::new().unwrap();
        for word in ["one", "two", "three"] {
            writeln!(second, "{}", word).unwrap();
        }
        second.flush().unwrap();

        let zk = MemoryCoordinator::new();
        let admin = CollectionAdmin::new(Arc::new(zk.clone()), ROOT);
        admin.create("words", CollectionKind::StaticSet, 1, 1, 0).await.unwrap();
        admin
            .set_source("words", &first.path().to_string_lossy(), 10, 0.01)
            .await
            .unwrap();
        let info = admin.info("words").await.unwrap();

        let state = Arc::new(ShardState::new(
            &info,
            0,
            ShardRouter::default(),
            Arc::new(FileSource),
            Some(CollectionAdmin::new(Arc::new(zk.session()), ROOT)),
        ));
        let worker = ShardWorker::bind("127.0.0.1:0".parse().unwrap(), state.clone())
            .await
            .unwrap();
        let handle = worker.shutdown_handle();
        let server = tokio::spawn(worker.serve());

        wait_until("first load", || async { state.loaded_generation() == 1 }).await;
        assert_eq!(state.store().len(), 1);

        admin
            .set_source("words", &second.path().to_string_lossy(), 10, 0.01)
            .await
            .unwrap();
        wait_until("second load", || async { state.loaded_generation() == 2 }).await;
        assert_eq!(state.store().len(), 3);
        wait_until("shard back up", || async {
            admin.info("words").await.unwrap().availability.is_up(0)
        })
        .await;

        handle.trigger();
        server.await.unwrap().unwrap();
    }
}
