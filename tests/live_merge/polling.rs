//! Block-job polling protocol

use std::time::Duration;

use livemerge::{Backoff, CancelToken, ErrorKind, JobStatus, MergeDirection, WaitOptions};

use crate::harness::{three_layer, Variant};

fn quick(timeout_ms: u64) -> WaitOptions {
    WaitOptions {
        interval: Duration::from_millis(10),
        timeout: Duration::from_millis(timeout_ms),
        backoff: Backoff::Exponential,
        max_interval: Duration::from_millis(80),
    }
}

#[test]
fn test_wait_block_job_until_caught_up() {
    let f = three_layer(Variant::default());
    let job = f.engine.pull(f.chain, Some("BASE"), Some(8 * 1024)).unwrap();
    f.engine
        .wait_block_job(f.chain, MergeDirection::Pull, &quick(30_000), None)
        .unwrap();
    // Caught up means relinked; no join needed before looking at the chain
    f.assert_backing("S2", Some("BASE"));
    assert_eq!(f.engine.join(job.id).unwrap().status, JobStatus::Completed);
}

#[test]
fn test_wait_block_job_times_out() {
    let f = three_layer(Variant::default());
    let job = f.engine.pull(f.chain, None, Some(512)).unwrap();
    let err = f
        .engine
        .wait_block_job(f.chain, MergeDirection::Pull, &quick(100), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    f.engine.cancel(job.id).unwrap();
    f.engine.join(job.id).unwrap();
}

#[test]
fn test_wait_block_job_wrong_direction_is_hard_failure() {
    let f = three_layer(Variant::default());
    let job = f.engine.commit(f.chain, "BASE", Some("S1"), Some(512)).unwrap();
    let err = f
        .engine
        .wait_block_job(f.chain, MergeDirection::Pull, &quick(5_000), None)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    f.engine.cancel(job.id).unwrap();
    f.engine.join(job.id).unwrap();
}

#[test]
fn test_wait_block_job_can_be_cancelled() {
    let f = three_layer(Variant::default());
    let job = f.engine.pull(f.chain, None, Some(512)).unwrap();
    let token = CancelToken::new();
    token.cancel();
    let err = f
        .engine
        .wait_block_job(f.chain, MergeDirection::Pull, &quick(30_000), Some(&token))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    f.engine.cancel(job.id).unwrap();
    assert_eq!(f.engine.join(job.id).unwrap().status, JobStatus::Cancelled);
}
