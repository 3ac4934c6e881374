//! End-to-end I/O tests: alignment laws, range locking, retry, and error
//! translation over the simulated physical service.

use blockrelay_common::{
    BlockGeometry, BlockQualifier, BlockStatus, DeviceLocation, DiagnosticBuffer, Error,
    IoCompletion, IoOutcome, ObjectId, PoolConfig, ProxyConfig, SlotId,
};
use blockrelay_proxy::{BlockProxy, SimService};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

const BLOCK: usize = 512;

fn geometry(block_count: u64) -> BlockGeometry {
    BlockGeometry {
        block_size: 512,
        optimal_block_size: 2048,
        optimal_block_alignment: 0,
        block_count,
        physical_block_size: 512,
    }
}

fn config() -> ProxyConfig {
    ProxyConfig {
        slot_count: 4,
        geometry: blockrelay_common::GeometryDefaults {
            block_size: 512,
            optimal_block_size: 2048,
            optimal_block_alignment: 0,
        },
        pool: PoolConfig {
            // Enough for every concurrent RMW in the stress test to hold
            // its three buffers at once.
            buffer_count: 128,
            buffer_bytes: 2048,
        },
        io_timeout_ms: 5_000,
        max_observers: 8,
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

async fn start_with_one_drive() -> (Arc<SimService>, BlockProxy, ObjectId) {
    init_tracing();
    let sim = Arc::new(SimService::new());
    let object = sim.add_drive(DeviceLocation::new(0, 0, 0), geometry(64));
    let proxy = BlockProxy::start(&config(), Arc::clone(&sim) as Arc<_>)
        .await
        .expect("proxy start");
    (sim, proxy, object)
}

fn pattern(len: usize, seed: u8) -> Bytes {
    Bytes::from(
        (0..len)
            .map(|i| seed.wrapping_add((i % 251) as u8))
            .collect::<Vec<u8>>(),
    )
}

#[tokio::test]
async fn aligned_write_takes_no_pre_read_and_no_lock() {
    let (_sim, proxy, _object) = start_with_one_drive().await;
    let slot = SlotId::new(0);
    let data = pattern(4 * BLOCK, 1);

    let mut diag = DiagnosticBuffer::default();
    let outcome = proxy.write(slot, 4, 4, data.clone(), &mut diag).await.unwrap();
    assert_eq!(outcome, IoOutcome::Success);

    let stats = proxy.stats();
    assert_eq!(stats.aligned_writes, 1);
    assert_eq!(stats.rmw_writes, 0);
    assert_eq!(stats.pre_reads, 0);
    assert_eq!(stats.locks_granted, 0);
    assert_eq!(stats.locks_queued, 0);

    let back = proxy.read(slot, 4, 4).await.unwrap();
    assert_eq!(back, data);
}

#[tokio::test]
async fn misaligned_write_round_trips_and_preserves_neighbors() {
    // The 512/2048 scenario: writing LBA 1, length 1 is unaligned on both
    // edges; the pre-read must span [0, 4) and LBAs 0, 2, 3 stay intact.
    let (sim, proxy, object) = start_with_one_drive().await;
    let slot = SlotId::new(0);

    let original = pattern(4 * BLOCK, 7);
    sim.load(object, 0, &original);

    let data = pattern(BLOCK, 99);
    let mut diag = DiagnosticBuffer::default();
    proxy.write(slot, 1, 1, data.clone(), &mut diag).await.unwrap();

    let stats = proxy.stats();
    assert_eq!(stats.rmw_writes, 1);
    assert_eq!(stats.pre_reads, 1);
    assert_eq!(stats.locks_granted, 1);

    assert_eq!(proxy.read(slot, 1, 1).await.unwrap(), data);
    assert_eq!(sim.peek(object, 0, 1), &original[..BLOCK]);
    assert_eq!(sim.peek(object, 2, 2), &original[2 * BLOCK..]);
}

#[tokio::test]
async fn single_edge_misalignment_round_trips() {
    let (sim, proxy, object) = start_with_one_drive().await;
    let slot = SlotId::new(0);
    let original = pattern(8 * BLOCK, 3);
    sim.load(object, 0, &original);

    // Start aligned, end not: [0, 2) inside the optimal unit [0, 4).
    let head = pattern(2 * BLOCK, 21);
    let mut diag = DiagnosticBuffer::default();
    proxy.write(slot, 0, 2, head.clone(), &mut diag).await.unwrap();
    assert_eq!(proxy.read(slot, 0, 2).await.unwrap(), head);
    assert_eq!(sim.peek(object, 2, 2), &original[2 * BLOCK..4 * BLOCK]);

    // Start not aligned, end aligned: [6, 8) inside [4, 8).
    let tail = pattern(2 * BLOCK, 42);
    proxy.write(slot, 6, 2, tail.clone(), &mut diag).await.unwrap();
    assert_eq!(proxy.read(slot, 6, 2).await.unwrap(), tail);
    assert_eq!(sim.peek(object, 4, 2), &original[4 * BLOCK..6 * BLOCK]);

    assert_eq!(proxy.stats().pre_reads, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_writes_serialize_through_retry_queue() {
    let (sim, proxy, object) = start_with_one_drive().await;
    let proxy = Arc::new(proxy);
    let slot = SlotId::new(0);
    sim.set_io_delay(Some(Duration::from_millis(80)));

    // Both target the optimal unit [0, 4), so the second queues until the
    // first unlocks and must then complete on its own.
    let first = {
        let proxy = Arc::clone(&proxy);
        let data = pattern(BLOCK, 10);
        tokio::spawn(async move {
            let mut diag = DiagnosticBuffer::default();
            proxy.write(slot, 1, 1, data, &mut diag).await
        })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    let second = {
        let proxy = Arc::clone(&proxy);
        let data = pattern(BLOCK, 20);
        tokio::spawn(async move {
            let mut diag = DiagnosticBuffer::default();
            proxy.write(slot, 2, 1, data, &mut diag).await
        })
    };

    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    sim.set_io_delay(None);

    let stats = proxy.stats();
    assert_eq!(stats.locks_queued, 1);
    assert_eq!(stats.retries_resumed, 1);
    // Only the first acquisition was immediate; the second went through
    // the unlock grant.
    assert_eq!(stats.locks_granted, 1);

    assert_eq!(proxy.read(slot, 1, 1).await.unwrap(), pattern(BLOCK, 10));
    assert_eq!(proxy.read(slot, 2, 1).await.unwrap(), pattern(BLOCK, 20));
    drop(object);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn non_overlapping_writes_do_not_queue() {
    let (sim, proxy, _object) = start_with_one_drive().await;
    let proxy = Arc::new(proxy);
    let slot = SlotId::new(0);
    sim.set_io_delay(Some(Duration::from_millis(40)));

    // [0, 4) and [4, 8): disjoint optimal units may proceed in parallel.
    let a = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            let mut diag = DiagnosticBuffer::default();
            proxy.write(slot, 1, 1, pattern(BLOCK, 1), &mut diag).await
        })
    };
    let b = {
        let proxy = Arc::clone(&proxy);
        tokio::spawn(async move {
            let mut diag = DiagnosticBuffer::default();
            proxy.write(slot, 5, 1, pattern(BLOCK, 2), &mut diag).await
        })
    };
    a.await.unwrap().unwrap();
    b.await.unwrap().unwrap();

    let stats = proxy.stats();
    assert_eq!(stats.locks_queued, 0);
    assert_eq!(stats.locks_granted, 2);
}

#[tokio::test]
async fn request_validation_errors() {
    let (_sim, proxy, _object) = start_with_one_drive().await;
    let slot = SlotId::new(0);
    let mut diag = DiagnosticBuffer::default();

    // Bad slot index.
    let err = proxy
        .write(SlotId::new(9), 0, 1, pattern(BLOCK, 0), &mut diag)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameter(_)));

    // Zero length.
    let err = proxy
        .write(slot, 0, 0, pattern(BLOCK, 0), &mut diag)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameter(_)));

    // Buffer size does not match the block count.
    let err = proxy
        .write(slot, 0, 2, pattern(BLOCK, 0), &mut diag)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidParameter(_)));

    // Beyond device capacity.
    let err = proxy
        .write(slot, 62, 4, pattern(4 * BLOCK, 0), &mut diag)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidRequest(_)));

    // Empty slot: no physical object behind it yet.
    let err = proxy
        .write(SlotId::new(1), 0, 1, pattern(BLOCK, 0), &mut diag)
        .await
        .unwrap_err();
    assert_eq!(err, Error::NotReady);
}

#[tokio::test]
async fn pool_exhaustion_fails_only_the_affected_request() {
    let sim = Arc::new(SimService::new());
    sim.add_drive(DeviceLocation::new(0, 0, 0), geometry(64));
    let mut cfg = config();
    // A both-edges write needs three buffers (begin, dummy, end).
    cfg.pool.buffer_count = 2;
    let proxy = BlockProxy::start(&cfg, Arc::clone(&sim) as Arc<_>)
        .await
        .unwrap();
    let slot = SlotId::new(0);
    let mut diag = DiagnosticBuffer::default();

    let err = proxy
        .write(slot, 1, 1, pattern(BLOCK, 5), &mut diag)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted(_)));

    // Aligned writes never touch the pool.
    proxy
        .write(slot, 0, 4, pattern(4 * BLOCK, 6), &mut diag)
        .await
        .unwrap();

    // A start-only misalignment needs two buffers, so the earlier failure
    // must have returned everything it took.
    proxy
        .write(slot, 6, 2, pattern(2 * BLOCK, 7), &mut diag)
        .await
        .unwrap();
}

#[tokio::test]
async fn slow_service_maps_to_timeout() {
    let sim = Arc::new(SimService::new());
    sim.add_drive(DeviceLocation::new(0, 0, 0), geometry(64));
    let mut cfg = config();
    cfg.io_timeout_ms = 40;
    let proxy = BlockProxy::start(&cfg, Arc::clone(&sim) as Arc<_>)
        .await
        .unwrap();
    sim.set_io_delay(Some(Duration::from_millis(200)));

    let mut diag = DiagnosticBuffer::default();
    let err = proxy
        .write(SlotId::new(0), 0, 4, pattern(4 * BLOCK, 1), &mut diag)
        .await
        .unwrap_err();
    assert_eq!(err, Error::Timeout);
    assert!(proxy.stats().timeouts >= 1);
}

#[tokio::test]
async fn media_error_carries_diagnostics() {
    let (sim, proxy, _object) = start_with_one_drive().await;
    sim.inject_write_fault(IoCompletion::block_error(
        BlockStatus::MediaError,
        0x32,
        Some(6),
    ));

    let mut diag = DiagnosticBuffer::default();
    let err = proxy
        .write(SlotId::new(0), 4, 4, pattern(4 * BLOCK, 1), &mut diag)
        .await
        .unwrap_err();
    assert_eq!(err, Error::MediaError { lba: Some(6) });
    assert_eq!(diag.entries().len(), 1);
    assert_eq!(diag.entries()[0].error_code, 0x32);
    assert_eq!(diag.entries()[0].lba, Some(6));
}

#[tokio::test]
async fn remap_required_is_a_success_with_diagnostics() {
    let (sim, proxy, _object) = start_with_one_drive().await;
    sim.inject_write_fault(IoCompletion {
        qualifier: BlockQualifier::RemapRequired,
        error_code: 0x31,
        media_error_lba: Some(5),
        ..IoCompletion::success()
    });

    let mut diag = DiagnosticBuffer::default();
    let outcome = proxy
        .write(SlotId::new(0), 4, 4, pattern(4 * BLOCK, 1), &mut diag)
        .await
        .unwrap();
    assert_eq!(outcome, IoOutcome::RemapRequired);
    assert_eq!(diag.entries().len(), 1);
}

#[tokio::test]
async fn failed_pre_read_does_not_abort_the_write() {
    let (sim, proxy, _object) = start_with_one_drive().await;
    sim.inject_read_fault(IoCompletion::block_error(
        BlockStatus::MediaError,
        0x11,
        Some(0),
    ));

    let slot = SlotId::new(0);
    let data = pattern(BLOCK, 77);
    let mut diag = DiagnosticBuffer::default();
    let outcome = proxy.write(slot, 1, 1, data.clone(), &mut diag).await.unwrap();
    assert_eq!(outcome, IoOutcome::Success);
    assert_eq!(proxy.stats().pre_read_failures, 1);

    // The client's own range is intact even though the edges were
    // best-effort.
    assert_eq!(proxy.read(slot, 1, 1).await.unwrap(), data);
}

#[tokio::test]
async fn read_of_unready_slot_is_not_ready() {
    let (_sim, proxy, _object) = start_with_one_drive().await;
    assert_eq!(
        proxy.read(SlotId::new(2), 0, 1).await.unwrap_err(),
        Error::NotReady
    );
}

#[tokio::test]
async fn capacity_reports_device_blocks() {
    let (_sim, proxy, _object) = start_with_one_drive().await;
    assert_eq!(proxy.capacity(SlotId::new(0)).await.unwrap(), 64);
    assert_eq!(
        proxy.capacity(SlotId::new(1)).await.unwrap_err(),
        Error::NotReady
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn randomized_concurrent_single_block_writes() {
    use rand::seq::SliceRandom;
    use rand::{Rng, SeedableRng};

    let (_sim, proxy, _object) = start_with_one_drive().await;
    let proxy = Arc::new(proxy);
    let slot = SlotId::new(0);

    // Distinct LBAs across the device, shuffled so neighboring writes in
    // the same optimal unit race each other through the lock manager.
    let mut rng = rand::rngs::StdRng::seed_from_u64(0x5eed);
    let mut lbas: Vec<u64> = (0..64).collect();
    lbas.shuffle(&mut rng);
    lbas.truncate(24);

    let mut tasks = Vec::new();
    for lba in lbas.clone() {
        let proxy = Arc::clone(&proxy);
        let seed: u8 = rng.gen_range(0..=u8::MAX);
        tasks.push((lba, seed, tokio::spawn(async move {
            let mut diag = DiagnosticBuffer::default();
            proxy.write(slot, lba, 1, pattern(BLOCK, seed), &mut diag).await
        })));
    }

    for (lba, seed, task) in tasks {
        task.await
            .unwrap()
            .unwrap_or_else(|err| panic!("write at lba {lba} failed: {err}"));
        let back = proxy.read(slot, lba, 1).await.unwrap();
        assert_eq!(back, pattern(BLOCK, seed), "lba {lba} round trip");
    }
}
