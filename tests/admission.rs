//! End-to-end admission behavior across limiter, stores and clock.

use std::sync::Arc;
use std::time::Duration;

use slidegate::ratelimit::{
    Admission, ExternalStore, KvBackend, Limiter, MemoryBackend, Outcome, RequestPolicy,
    ShardedStore, Store,
};
use slidegate::{Clock, ManualClock};

const START: u64 = 1_700_000_000;

fn memory_limiter(max: u64, window_secs: u64, clock: Arc<ManualClock>) -> Arc<Limiter> {
    Arc::new(
        Limiter::builder()
            .max(max)
            .window(Duration::from_secs(window_secs))
            .clock(clock)
            .build()
            .unwrap(),
    )
}

fn external_limiter(
    max: u64,
    window_secs: u64,
    clock: Arc<ManualClock>,
    backend: Arc<MemoryBackend>,
) -> Arc<Limiter> {
    Arc::new(
        Limiter::builder()
            .max(max)
            .window(Duration::from_secs(window_secs))
            .clock(clock)
            .store(Arc::new(ExternalStore::new(backend)))
            .build()
            .unwrap(),
    )
}

async fn race(limiter: Arc<Limiter>, key: &'static str, callers: usize) -> usize {
    let tasks: Vec<_> = (0..callers)
        .map(|_| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.check(key).await.admitted })
        })
        .collect();

    futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .filter(|admitted| *admitted)
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_parallel_callers_admit_exactly_max() {
    let clock = Arc::new(ManualClock::new(START));
    let limiter = memory_limiter(10, 10, clock);

    let admitted = race(limiter.clone(), "10.1.1.1", 100).await;
    assert_eq!(admitted, 10);
    assert_eq!(limiter.store().get("10.1.1.1").await.current_hits, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_parallel_callers_on_external_store_admit_exactly_max() {
    let clock = Arc::new(ManualClock::new(START));
    let backend = Arc::new(MemoryBackend::new(clock.clone()));
    let limiter = external_limiter(10, 10, clock, backend);

    assert_eq!(race(limiter, "10.1.1.1", 60).await, 10);
}

// Six of ten hits are used in the first window; at the exact boundary the whole
// previous window still weighs in, leaving room for four more.
async fn assert_single_rollover_under_race(limiter: Arc<Limiter>, clock: Arc<ManualClock>) {
    for _ in 0..6 {
        assert!(limiter.check("10.2.2.2").await.admitted);
    }
    let old_end = limiter.store().get("10.2.2.2").await.window_end;
    assert_eq!(old_end, START + 10);

    clock.set(old_end);
    let admitted = race(limiter.clone(), "10.2.2.2", 50).await;

    let record = limiter.store().get("10.2.2.2").await;
    assert_eq!(record.previous_hits, 6);
    assert_eq!(record.window_end, old_end + 10);
    assert_eq!(record.current_hits, 4);
    assert_eq!(admitted, 4);
    assert_eq!(record.estimate(old_end, 10), 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_parallel_callers_at_boundary_roll_over_once() {
    let clock = Arc::new(ManualClock::new(START));
    let limiter = memory_limiter(10, 10, clock.clone());

    assert_single_rollover_under_race(limiter, clock).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_parallel_callers_at_boundary_on_external_store_roll_over_once() {
    let clock = Arc::new(ManualClock::new(START));
    let backend = Arc::new(MemoryBackend::new(clock.clone()));
    let limiter = external_limiter(10, 10, clock.clone(), backend);

    assert_single_rollover_under_race(limiter, clock).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_parallel_callers_on_distinct_keys_do_not_interfere() {
    let clock = Arc::new(ManualClock::new(START));
    let limiter = memory_limiter(3, 10, clock);

    let tasks: Vec<_> = (0..50)
        .map(|i| {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.check(&format!("user:{}", i)).await })
        })
        .collect();

    for verdict in futures::future::join_all(tasks).await {
        let verdict = verdict.unwrap();
        assert!(verdict.admitted);
        assert_eq!(verdict.remaining, 2);
    }
}

#[tokio::test]
async fn test_shared_backend_spans_limiter_instances() {
    let clock = Arc::new(ManualClock::new(START));
    let backend = Arc::new(MemoryBackend::new(clock.clone()));
    let a = external_limiter(4, 10, clock.clone(), backend.clone());
    let b = external_limiter(4, 10, clock.clone(), backend.clone());

    assert!(a.check("client").await.admitted);
    assert!(b.check("client").await.admitted);
    assert!(a.check("client").await.admitted);

    let verdict = b.check("client").await;
    assert!(verdict.admitted);
    assert_eq!(verdict.remaining, 0);

    assert!(!a.check("client").await.admitted);
    assert!(!b.check("client").await.admitted);
}

#[tokio::test]
async fn test_backend_outage_degrades_to_no_history() {
    let clock = Arc::new(ManualClock::new(START));
    let backend = Arc::new(MemoryBackend::new(clock.clone()));
    let limiter = external_limiter(2, 10, clock, backend.clone());

    assert!(limiter.check("client").await.admitted);
    assert!(limiter.check("client").await.admitted);
    assert!(!limiter.check("client").await.admitted);

    backend.set_unavailable(true);
    for _ in 0..5 {
        let verdict = limiter.check("client").await;
        assert!(verdict.admitted);
        assert_eq!(verdict.remaining, 1);
    }
}

#[tokio::test]
async fn test_backend_ttl_covers_previous_window() {
    let clock = Arc::new(ManualClock::new(START));
    let backend = Arc::new(MemoryBackend::new(clock.clone()));
    let limiter = external_limiter(10, 10, clock.clone(), backend.clone());

    for _ in 0..10 {
        limiter.check("client").await;
    }

    // Still within window_end + window: the record must survive for weighting
    clock.advance(15);
    assert_eq!(backend.len(), 1);
    let verdict = limiter.check("client").await;
    assert_eq!(verdict.remaining, 10 - 5 - 1);

    // Long after, the backend forgets the key entirely
    clock.advance(60);
    assert!(backend.get("client").await.unwrap().is_none());
}

#[tokio::test]
async fn test_sweep_releases_idle_keys() {
    let clock = Arc::new(ManualClock::new(START));
    let store = Arc::new(ShardedStore::new(16, clock.clone()).unwrap());
    let limiter = Limiter::builder()
        .max(5)
        .window(Duration::from_secs(10))
        .clock(clock.clone())
        .store(store.clone())
        .build()
        .unwrap();

    for i in 0..100 {
        limiter.check(&format!("10.0.0.{}", i)).await;
    }
    assert_eq!(store.len(), 100);

    // TTL is reset + window = 20s from the first hits
    clock.advance(19);
    assert_eq!(store.sweep(), 0);
    clock.advance(1);
    assert_eq!(store.sweep(), 100);
    assert!(store.is_empty());

    // An evicted key starts over with no history
    let verdict = limiter.check("10.0.0.1").await;
    assert_eq!(verdict.remaining, 4);
    assert_eq!(store.get("10.0.0.1").await.previous_hits, 0);
}

#[tokio::test]
async fn test_policy_over_external_store() {
    let clock = Arc::new(ManualClock::new(START));
    let backend = Arc::new(MemoryBackend::new(clock.clone()));
    let limiter = external_limiter(1, 10, clock, backend);
    let policy = RequestPolicy::new(limiter, |ip: &String| ip.clone()).skip_failed(true);

    let ip = "192.168.0.9".to_string();
    match policy.admit(&ip).await {
        Admission::Admitted(ticket) => {
            let verdict = ticket.complete(Outcome::Failure).await;
            assert_eq!(verdict.remaining, 1);
        }
        other => panic!("expected admission, got {:?}", other),
    }

    // The failed request did not use up the single slot
    assert!(policy.admit(&ip).await.is_allowed());
    assert!(!policy.admit(&ip).await.is_allowed());
}

#[test]
fn test_default_limiter_outside_runtime() {
    let limiter = Limiter::builder().max(2).build().unwrap();

    let verdicts: Vec<_> = (0..3)
        .map(|_| tokio_test::block_on(limiter.check("cli")))
        .collect();

    assert!(verdicts[0].admitted);
    assert!(verdicts[1].admitted);
    assert!(!verdicts[2].admitted);
    assert!(verdicts[2].reset_secs <= 60);
    assert!(slidegate::GlobalClock.now() > START);
}
