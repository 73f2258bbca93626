//! Supervisor logic tests — backoff policy and health verdicts.

use std::time::Duration;

use preroll::capture::WorkerState;
use preroll::config::ReconnectConfig;
use preroll::supervisor::{assess_worker, backoff_delay, HealthVerdict};

fn policy(initial: u64, max: u64) -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_secs(initial),
        max_delay: Duration::from_secs(max),
        max_attempts: 0,
    }
}

#[test]
fn test_backoff_doubles_until_cap() {
    let p = policy(2, 60);
    let delays: Vec<u64> = (0..7).map(|k| backoff_delay(&p, k).as_secs()).collect();
    assert_eq!(delays, vec![2, 4, 8, 16, 32, 60, 60]);

    // d_k = min(d0 * 2^k, d_max) for every k.
    for k in 0..7u32 {
        let expected = (2u64 << k).min(60);
        assert_eq!(delays[k as usize], expected);
    }
}

#[test]
fn test_backoff_survives_huge_attempt_counts() {
    let p = policy(2, 60);
    // 2^40 overflows the multiplier; the cap must still hold.
    assert_eq!(backoff_delay(&p, 40), Duration::from_secs(60));
    assert_eq!(backoff_delay(&p, u32::MAX), Duration::from_secs(60));
}

#[test]
fn test_backoff_monotone() {
    let p = policy(1, 300);
    let mut prev = Duration::ZERO;
    for k in 0..16 {
        let d = backoff_delay(&p, k);
        assert!(d >= prev, "delay regressed at attempt {k}");
        prev = d;
    }
}

const CHUNK: Duration = Duration::from_secs(5);

#[test]
fn test_running_and_fresh_is_healthy() {
    let verdict = assess_worker(
        WorkerState::Running,
        Some(Duration::from_secs(2)),
        Some(Duration::from_secs(1)),
        Some(Duration::from_secs(120)),
        CHUNK,
    );
    assert_eq!(verdict, HealthVerdict::Healthy);
}

#[test]
fn test_running_with_stale_segments_is_stalled() {
    // Segments stopped advancing (age >= 3 * chunk) long after startup.
    let verdict = assess_worker(
        WorkerState::Running,
        Some(Duration::from_secs(20)),
        Some(Duration::from_secs(1)),
        Some(Duration::from_secs(120)),
        CHUNK,
    );
    assert_eq!(verdict, HealthVerdict::Stalled);
}

#[test]
fn test_startup_grace_window() {
    // No segments yet, but the encoder only just started.
    let verdict = assess_worker(
        WorkerState::Running,
        None,
        Some(Duration::from_secs(1)),
        Some(Duration::from_secs(3)),
        CHUNK,
    );
    assert_eq!(verdict, HealthVerdict::Waiting);

    // Grace expired without a single segment: stalled.
    let verdict = assess_worker(
        WorkerState::Running,
        None,
        Some(Duration::from_secs(1)),
        Some(Duration::from_secs(60)),
        CHUNK,
    );
    assert_eq!(verdict, HealthVerdict::Stalled);
}

#[test]
fn test_non_running_states() {
    let fresh = Some(Duration::from_secs(1));
    assert_eq!(
        assess_worker(WorkerState::Failed, fresh, fresh, None, CHUNK),
        HealthVerdict::Failed
    );
    assert_eq!(
        assess_worker(WorkerState::Starting, None, None, None, CHUNK),
        HealthVerdict::Waiting
    );
    assert_eq!(
        assess_worker(WorkerState::Backoff, None, None, None, CHUNK),
        HealthVerdict::Waiting
    );
    assert_eq!(
        assess_worker(WorkerState::Stopped, None, None, None, CHUNK),
        HealthVerdict::Stopped
    );
}
