// Copyright 2020 Joyent, Inc.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio_test::block_on;

use fcp_server::bucket::MemoryBucket;
use fcp_server::engine::{JobEvent, JobFailure, ProgressEvent, SplitfileProgress};
use fcp_server::message::names;
use fcp_server::request::failure::fetch_codes;

use common::*;

fn settle() -> tokio::time::Sleep {
    tokio::time::sleep(Duration::from_millis(100))
}

#[test]
fn hello_must_come_first() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::default());
    let (addr, server) = start_server(test_config(dir.path(), false), Arc::clone(&engine));

    block_on(async {
        let mut client = fcp_server::client::FcpClient::connect(&addr).await.unwrap();
        send(
            &mut client,
            names::CLIENT_GET,
            &[("Identifier", "job1"), ("URI", "KSK@test.txt")],
        )
        .await;
        let error = client.receive().await.unwrap().unwrap();
        assert_eq!(error.name, names::PROTOCOL_ERROR);
        assert_eq!(error.get("Code"), Some("1"));
        assert_eq!(error.get("Fatal"), Some("true"));

        let next = tokio::time::timeout(Duration::from_secs(5), client.receive())
            .await
            .unwrap()
            .unwrap();
        assert!(next.is_none());
    });
    server.shutdown();
}

#[test]
fn late_hello_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::default());
    let (addr, server) = start_server(test_config(dir.path(), false), Arc::clone(&engine));

    block_on(async {
        let mut client = connect(&addr, "tester").await;
        send(
            &mut client,
            names::CLIENT_HELLO,
            &[("Name", "tester"), ("ExpectedVersion", "2.0")],
        )
        .await;
        let error = until(&mut client, names::PROTOCOL_ERROR).await.pop().unwrap();
        assert_eq!(error.get("Code"), Some("2"));
        assert_eq!(error.get("Fatal"), Some("false"));

        // Still usable afterwards.
        send(&mut client, names::REMOVE_REQUEST, &[("Identifier", "nothing")]).await;
        let error = until(&mut client, names::PROTOCOL_ERROR).await.pop().unwrap();
        assert_eq!(error.get("Code"), Some("15"));
        assert_eq!(error.get("Identifier"), Some("nothing"));
        assert_eq!(error.get("Fatal"), Some("false"));
    });
    server.shutdown();
}

#[test]
fn malformed_body_is_not_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::default());
    let (addr, server) = start_server(test_config(dir.path(), false), Arc::clone(&engine));

    block_on(async {
        let mut client = connect(&addr, "tester").await;
        client
            .send_bytes(b"ClientGet\nIdentifier=d1\nURI=KSK@d\nURI=KSK@e\nEnd\n")
            .await
            .unwrap();
        let error = until(&mut client, names::PROTOCOL_ERROR).await.pop().unwrap();
        assert_eq!(error.get("Code"), Some("3"));
        assert_eq!(error.get("Fatal"), Some("false"));
        assert_eq!(error.get("Identifier"), Some("d1"));

        // The connection is still in sync and usable.
        send(
            &mut client,
            names::CLIENT_GET,
            &[("Identifier", "d2"), ("URI", "KSK@d"), ("ReturnType", "none")],
        )
        .await;
        engine
            .reporter("d2")
            .await
            .fail(JobFailure::new(fetch_codes::DATA_NOT_FOUND));
        let failed = until(&mut client, names::GET_FAILED).await.pop().unwrap();
        assert_eq!(failed.get("Identifier"), Some("d2"));
    });
    server.shutdown();
}

#[test]
fn direct_fetch_reports_once_and_replays() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::default());
    let (addr, server) = start_server(test_config(dir.path(), false), Arc::clone(&engine));

    block_on(async {
        let mut client = connect(&addr, "tester").await;
        let get = [("Identifier", "job1"), ("URI", "KSK@test.txt")];
        send(&mut client, names::CLIENT_GET, &get).await;

        let reporter = engine.reporter("job1").await;
        for _ in 0..2 {
            reporter.report(JobEvent::FetchSucceeded {
                data: Arc::new(MemoryBucket::new(Bytes::from(vec![b'x'; 42]))),
                mime: Some("text/plain".to_string()),
            });
        }

        // Connection-tier requests are not announced with a tag.
        let msgs = until(&mut client, names::ALL_DATA).await;
        assert_eq!(names(&msgs), vec![names::DATA_FOUND, names::ALL_DATA]);
        assert_eq!(msgs[0].get("DataLength"), Some("42"));
        assert_eq!(msgs[0].get("Metadata.ContentType"), Some("text/plain"));
        assert_eq!(msgs[1].payload.as_ref().map(|p| p.len()), Some(42));

        // A second report never produces another DataFound; the status
        // replay follows directly.
        send(&mut client, names::GET_REQUEST_STATUS, &[("Identifier", "job1")]).await;
        let msgs = until(&mut client, names::ALL_DATA).await;
        assert_eq!(
            names(&msgs),
            vec![names::PERSISTENT_GET, names::DATA_FOUND, names::ALL_DATA]
        );

        send(&mut client, names::CLIENT_GET, &get).await;
        let collision = until(&mut client, names::IDENTIFIER_COLLISION).await;
        assert_eq!(collision.len(), 1);
        assert_eq!(collision[0].get("Identifier"), Some("job1"));
    });
    server.shutdown();
}

#[test]
fn progress_follows_verbosity() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::default());
    let (addr, server) = start_server(test_config(dir.path(), false), Arc::clone(&engine));

    block_on(async {
        let mut client = connect(&addr, "tester").await;
        send(
            &mut client,
            names::CLIENT_GET,
            &[("Identifier", "quiet"), ("URI", "KSK@a"), ("ReturnType", "none")],
        )
        .await;
        send(
            &mut client,
            names::CLIENT_GET,
            &[
                ("Identifier", "loud"),
                ("URI", "KSK@b"),
                ("ReturnType", "none"),
                ("Verbosity", "1"),
            ],
        )
        .await;

        let progress = ProgressEvent::Splitfile(SplitfileProgress {
            total: 4,
            required: 2,
            succeeded: 1,
            ..SplitfileProgress::default()
        });
        let quiet = engine.reporter("quiet").await;
        let loud = engine.reporter("loud").await;
        quiet.progress(progress.clone());
        quiet.fail(JobFailure::new(fetch_codes::DATA_NOT_FOUND));
        settle().await;
        loud.progress(progress);
        loud.fail(JobFailure::new(fetch_codes::DATA_NOT_FOUND));

        let msgs = until(&mut client, names::SIMPLE_PROGRESS).await;
        assert_eq!(msgs.last().unwrap().get("Identifier"), Some("loud"));
        assert_eq!(msgs.last().unwrap().get("Total"), Some("4"));
        let failed = msgs
            .iter()
            .filter(|m| m.name == names::GET_FAILED)
            .collect::<Vec<_>>();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].get("Identifier"), Some("quiet"));
        assert!(msgs
            .iter()
            .all(|m| m.name != names::SIMPLE_PROGRESS || m.get("Identifier") == Some("loud")));

        let failed = until(&mut client, names::GET_FAILED).await.pop().unwrap();
        assert_eq!(failed.get("Identifier"), Some("loud"));
        assert_eq!(failed.get("Code"), Some("13"));
    });
    server.shutdown();
}

#[test]
fn close_cancels_connection_requests_only() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::default());
    let (addr, server) = start_server(test_config(dir.path(), false), Arc::clone(&engine));

    block_on(async {
        let mut first = connect(&addr, "owner").await;
        send(
            &mut first,
            names::CLIENT_GET,
            &[("Identifier", "short"), ("URI", "KSK@short")],
        )
        .await;
        send(
            &mut first,
            names::CLIENT_GET,
            &[("Identifier", "long"), ("URI", "KSK@long"), ("Persistence", "reboot")],
        )
        .await;
        until(&mut first, names::PERSISTENT_GET).await;
        engine.reporter("short").await;
        engine.reporter("long").await;
        assert!(!engine.cancelled("short"));

        first.close().await.unwrap();
        for _ in 0..50 {
            if engine.cancelled("short") {
                break;
            }
            settle().await;
        }
        assert!(engine.cancelled("short"));
        assert!(!engine.cancelled("long"));

        let mut second = connect(&addr, "owner").await;
        send(&mut second, names::LIST_PERSISTENT_REQUESTS, &[]).await;
        let listed = until(&mut second, names::END_LIST_PERSISTENT_REQUESTS).await;
        assert_eq!(
            names(&listed),
            vec![names::PERSISTENT_GET, names::END_LIST_PERSISTENT_REQUESTS]
        );
        assert_eq!(listed[0].get("Identifier"), Some("long"));
    });
    server.shutdown();
}

#[test]
fn refused_upload_leaves_no_spill_file() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::default());
    let (addr, server) = start_server(test_config(dir.path(), false), Arc::clone(&engine));

    block_on(async {
        let mut client = connect(&addr, "uploader").await;
        send_with_data(
            &mut client,
            names::CLIENT_PUT,
            &[
                ("Identifier", "keep"),
                ("URI", "CHK@"),
                ("Persistence", "forever"),
                ("UploadFrom", "direct"),
                ("DataLength", "5"),
            ],
            b"hello",
        )
        .await;
        let error = until(&mut client, names::PROTOCOL_ERROR).await.pop().unwrap();
        assert_eq!(error.get("Code"), Some("16"));
        assert_eq!(error.get("Identifier"), Some("keep"));
        assert_eq!(error.get("Fatal"), Some("false"));
        assert!(spilled_files(dir.path()).is_empty());
    });
    server.shutdown();
}

#[test]
fn reboot_request_survives_reconnect() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::default());
    let (addr, server) = start_server(test_config(dir.path(), false), Arc::clone(&engine));

    block_on(async {
        let mut first = connect(&addr, "uploader").await;
        send_with_data(
            &mut first,
            names::CLIENT_PUT,
            &[
                ("Identifier", "up1"),
                ("URI", "CHK@"),
                ("Persistence", "reboot"),
                ("UploadFrom", "direct"),
                ("DataLength", "5"),
            ],
            b"hello",
        )
        .await;
        let tag = until(&mut first, names::PERSISTENT_PUT).await.pop().unwrap();
        assert_eq!(tag.get("PersistenceType"), Some("reboot"));
        let reporter = engine.reporter("up1").await;
        first.close().await.unwrap();
        settle().await;

        let mut second = connect(&addr, "uploader").await;
        send(&mut second, names::LIST_PERSISTENT_REQUESTS, &[]).await;
        let listed = until(&mut second, names::END_LIST_PERSISTENT_REQUESTS).await;
        assert_eq!(
            names(&listed),
            vec![names::PERSISTENT_PUT, names::END_LIST_PERSISTENT_REQUESTS]
        );
        assert_eq!(listed[0].get("Identifier"), Some("up1"));

        reporter.report(JobEvent::InsertSucceeded {
            uri: "CHK@abc,def,AAMC--8/".to_string(),
        });
        let done = until(&mut second, names::PUT_SUCCESSFUL).await.pop().unwrap();
        assert_eq!(done.get("Identifier"), Some("up1"));
        assert_eq!(done.get("URI"), Some("CHK@abc,def,AAMC--8/"));
    });
    server.shutdown();
}

#[test]
fn duplicate_name_closes_older_connection() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::default());
    let (addr, server) = start_server(test_config(dir.path(), false), Arc::clone(&engine));

    block_on(async {
        let mut first = connect(&addr, "same").await;
        let _second = connect(&addr, "same").await;
        let msgs = until(&mut first, names::CLOSE_CONNECTION_DUPLICATE_CLIENT_NAME).await;
        assert_eq!(msgs.len(), 1);
        let next = tokio::time::timeout(Duration::from_secs(5), first.receive())
            .await
            .unwrap()
            .unwrap();
        assert!(next.is_none());
    });
    server.shutdown();
}

#[test]
fn watchers_see_global_requests() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::default());
    let (addr, server) = start_server(test_config(dir.path(), false), Arc::clone(&engine));

    block_on(async {
        let mut owner = connect(&addr, "owner").await;
        send(
            &mut owner,
            names::CLIENT_GET,
            &[
                ("Identifier", "g1"),
                ("URI", "KSK@shared"),
                ("Global", "true"),
                ("Persistence", "reboot"),
                ("ReturnType", "none"),
            ],
        )
        .await;
        let reporter = engine.reporter("g1").await;

        let mut watcher = connect(&addr, "watcher").await;
        send(&mut watcher, names::WATCH_GLOBAL, &[("Enabled", "true")]).await;
        send(&mut watcher, names::LIST_PERSISTENT_REQUESTS, &[]).await;
        let listed = until(&mut watcher, names::END_LIST_PERSISTENT_REQUESTS).await;
        let tag = listed
            .iter()
            .find(|m| m.name == names::PERSISTENT_GET)
            .unwrap();
        assert_eq!(tag.get("Identifier"), Some("g1"));
        assert_eq!(tag.get("Global"), Some("true"));

        reporter.report(JobEvent::FetchSucceeded {
            data: Arc::new(MemoryBucket::new(Bytes::from_static(b"shared"))),
            mime: None,
        });
        let found = until(&mut watcher, names::DATA_FOUND).await.pop().unwrap();
        assert_eq!(found.get("Identifier"), Some("g1"));
        assert_eq!(found.get("Global"), Some("true"));
        assert_eq!(found.get("DataLength"), Some("6"));

        // Global requests need a persistent tier.
        send(
            &mut owner,
            names::CLIENT_GET,
            &[("Identifier", "g2"), ("URI", "KSK@shared"), ("Global", "true")],
        )
        .await;
        let error = until(&mut owner, names::PROTOCOL_ERROR).await.pop().unwrap();
        assert_eq!(error.get("Code"), Some("16"));
    });
    server.shutdown();
}

#[test]
fn forever_refused_when_persistence_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::default());
    let (addr, server) = start_server(test_config(dir.path(), false), Arc::clone(&engine));

    block_on(async {
        let mut client = connect(&addr, "tester").await;
        send(
            &mut client,
            names::CLIENT_GET,
            &[("Identifier", "f1"), ("URI", "KSK@x"), ("Persistence", "forever")],
        )
        .await;
        let error = until(&mut client, names::PROTOCOL_ERROR).await.pop().unwrap();
        assert_eq!(error.get("Code"), Some("16"));
        assert_eq!(error.get("Identifier"), Some("f1"));
    });
    server.shutdown();
}

#[test]
fn forever_request_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    let engine = Arc::new(ScriptedEngine::default());
    let (addr, server) = start_server(test_config(dir.path(), true), Arc::clone(&engine));
    block_on(async {
        let mut client = connect(&addr, "keeper").await;
        send(
            &mut client,
            names::CLIENT_GET,
            &[
                ("Identifier", "keep1"),
                ("URI", "KSK@kept"),
                ("Persistence", "forever"),
                ("ClientToken", "token-1"),
            ],
        )
        .await;
        until(&mut client, names::PERSISTENT_GET).await;
        engine.reporter("keep1").await;
    });
    server.shutdown();
    assert!(dir.path().join("persistent.dat").exists());

    let engine = Arc::new(ScriptedEngine::default());
    let (addr, server) = start_server(test_config(dir.path(), true), Arc::clone(&engine));
    block_on(async {
        let reporter = engine.reporter("keep1").await;
        let mut client = connect(&addr, "keeper").await;
        send(&mut client, names::LIST_PERSISTENT_REQUESTS, &[]).await;
        let listed = until(&mut client, names::END_LIST_PERSISTENT_REQUESTS).await;
        assert_eq!(listed[0].name, names::PERSISTENT_GET);
        assert_eq!(listed[0].get("Identifier"), Some("keep1"));
        assert_eq!(listed[0].get("ClientToken"), Some("token-1"));
        assert_eq!(listed[0].get("PersistenceType"), Some("forever"));

        reporter.report(JobEvent::FetchSucceeded {
            data: Arc::new(MemoryBucket::new(Bytes::from_static(b"kept data"))),
            mime: None,
        });
        let found = until(&mut client, names::DATA_FOUND).await.pop().unwrap();
        assert_eq!(found.get("DataLength"), Some("9"));

        send(
            &mut client,
            names::GET_REQUEST_STATUS,
            &[("Identifier", "keep1"), ("OnlyData", "true")],
        )
        .await;
        let data = until(&mut client, names::ALL_DATA).await.pop().unwrap();
        assert_eq!(data.payload, Some(Bytes::from_static(b"kept data")));

        send(&mut client, names::REMOVE_REQUEST, &[("Identifier", "keep1")]).await;
        until(&mut client, names::PERSISTENT_REQUEST_REMOVED).await;
    });
    server.shutdown();

    let engine = Arc::new(ScriptedEngine::default());
    let (addr, server) = start_server(test_config(dir.path(), true), Arc::clone(&engine));
    block_on(async {
        let mut client = connect(&addr, "keeper").await;
        send(&mut client, names::LIST_PERSISTENT_REQUESTS, &[]).await;
        let listed = until(&mut client, names::END_LIST_PERSISTENT_REQUESTS).await;
        assert_eq!(names(&listed), vec![names::END_LIST_PERSISTENT_REQUESTS]);
    });
    server.shutdown();
}

#[test]
fn modify_changes_priority() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(ScriptedEngine::default());
    let (addr, server) = start_server(test_config(dir.path(), false), Arc::clone(&engine));

    block_on(async {
        let mut client = connect(&addr, "tester").await;
        send(
            &mut client,
            names::CLIENT_GET,
            &[("Identifier", "m1"), ("URI", "KSK@m"), ("Persistence", "reboot")],
        )
        .await;
        until(&mut client, names::PERSISTENT_GET).await;
        send(
            &mut client,
            names::MODIFY_PERSISTENT_REQUEST,
            &[("Identifier", "m1"), ("PriorityClass", "1"), ("ClientToken", "new")],
        )
        .await;
        let modified = until(&mut client, names::PERSISTENT_REQUEST_MODIFIED)
            .await
            .pop()
            .unwrap();
        assert_eq!(modified.get("PriorityClass"), Some("1"));
        assert_eq!(modified.get("ClientToken"), Some("new"));

        send(
            &mut client,
            names::MODIFY_PERSISTENT_REQUEST,
            &[("Identifier", "m1"), ("ClientToken", "newer")],
        )
        .await;
        let modified = until(&mut client, names::PERSISTENT_REQUEST_MODIFIED)
            .await
            .pop()
            .unwrap();
        assert_eq!(modified.get("ClientToken"), Some("newer"));
        assert_eq!(modified.get("PriorityClass"), None);

        send(
            &mut client,
            names::MODIFY_PERSISTENT_REQUEST,
            &[("Identifier", "m1"), ("PriorityClass", "9")],
        )
        .await;
        let error = until(&mut client, names::PROTOCOL_ERROR).await.pop().unwrap();
        assert_eq!(error.get("Code"), Some("8"));
    });
    server.shutdown();
}
