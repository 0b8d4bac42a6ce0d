//! Primary to standby replication over the fetch transport.

use ledgerfs_common::{Config, ReplayMode};
use ledgerfs_journal::{FetchService, LogFetcher, LogReplicator, NameSystem, RemoteLogSource};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::net::TcpListener;

fn test_config(dir: &TempDir, buffer_limit_bytes: usize) -> Config {
    let mut config = Config::with_data_dir(dir.path());
    config.journal.buffer_limit_bytes = buffer_limit_bytes;
    config.journal.background_cleaner = false;
    config.journal.wait_interval_ms = 50;
    config.journal.replay_mode = ReplayMode::Strict;
    config
}

async fn serve_fetch(
    primary: &NameSystem,
    max_fetch_size: usize,
) -> (String, tokio::task::JoinHandle<()>) {
    let service = Arc::new(FetchService::new(
        LogFetcher::new(Arc::clone(primary.log()), max_fetch_size),
        Duration::from_secs(5),
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    (addr, tokio::spawn(service.serve(listener)))
}

#[tokio::test]
async fn test_standby_converges_on_flushed_and_buffered_records() {
    let primary_dir = TempDir::new().unwrap();
    let primary = NameSystem::open(&test_config(&primary_dir, 400)).unwrap();
    for i in 0..30 {
        primary.mkdir(&format!("/p/{i}")).unwrap();
        primary.create_file(&format!("/p/{i}/data")).unwrap();
    }
    // Leave a tail in the active buffer
    if primary.log().stats().buffered_bytes == 0 {
        primary.mkdir("/tail").unwrap();
    }
    assert!(!primary.log().segments().is_empty());
    let total = primary.synced_tx_id();

    let (addr, server) = serve_fetch(&primary, 7).await;

    let standby_dir = TempDir::new().unwrap();
    let standby_config = test_config(&standby_dir, 25 * 1024);
    let standby = Arc::new(NameSystem::open(&standby_config).unwrap());
    let replicator = LogReplicator::new(
        Arc::clone(&standby),
        Arc::new(RemoteLogSource::new(addr, Duration::from_secs(5))),
        7,
        Duration::from_millis(10),
    );

    let mut batches = 0;
    while replicator.sync_once().await.unwrap() > 0 {
        batches += 1;
    }
    // Batches stop at segment boundaries, so some are short
    assert!(batches >= 9);
    assert_eq!(standby.synced_tx_id(), total);
    assert_eq!(
        standby.tree().to_bytes().unwrap(),
        primary.tree().to_bytes().unwrap()
    );

    // The standby's own log holds the relogged records
    standby.shutdown().unwrap();
    drop(replicator);
    drop(standby);
    let reopened = NameSystem::open(&standby_config).unwrap();
    assert_eq!(reopened.synced_tx_id(), total);
    assert_eq!(
        reopened.tree().to_bytes().unwrap(),
        primary.tree().to_bytes().unwrap()
    );
    server.abort();
}

#[tokio::test]
async fn test_replicator_loop_follows_live_writes() {
    let primary_dir = TempDir::new().unwrap();
    let primary = Arc::new(NameSystem::open(&test_config(&primary_dir, 300)).unwrap());
    let (addr, server) = serve_fetch(&primary, 10).await;

    let standby_dir = TempDir::new().unwrap();
    let standby = Arc::new(NameSystem::open(&test_config(&standby_dir, 25 * 1024)).unwrap());
    let replicator = Arc::new(LogReplicator::new(
        Arc::clone(&standby),
        Arc::new(RemoteLogSource::new(addr, Duration::from_secs(5))),
        10,
        Duration::from_millis(20),
    ));

    let shutdown = Arc::new(AtomicBool::new(false));
    let task = {
        let replicator = Arc::clone(&replicator);
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move { replicator.run(shutdown).await })
    };

    let writer = {
        let primary = Arc::clone(&primary);
        tokio::task::spawn_blocking(move || {
            for i in 0..100 {
                primary.mkdir(&format!("/live/{}", i % 10)).unwrap();
                primary.create_file(&format!("/live/{}/f{i}", i % 10)).unwrap();
            }
        })
    };
    writer.await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(20);
    while standby.synced_tx_id() < 200 && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    shutdown.store(true, Ordering::Relaxed);
    task.await.unwrap().unwrap();

    assert_eq!(standby.synced_tx_id(), 200);
    assert_eq!(
        standby.tree().to_bytes().unwrap(),
        primary.tree().to_bytes().unwrap()
    );
    server.abort();
}
