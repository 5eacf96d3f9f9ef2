//! The four reference scenarios and both backward-merge shapes

use livemerge::{ErrorKind, JobStatus, LayerStatus};

use crate::harness::{three_layer, Variant};

/// Scenario A: BASE >> S1 >> S2, keeping BASE
#[test]
fn test_forward_merge_one_to_active() {
    let f = three_layer(Variant::default());
    let job = f.engine.pull(f.chain, Some("BASE"), None).unwrap();
    let snap = f.engine.join(job.id).unwrap();
    assert_eq!(snap.status, JobStatus::Completed);

    f.assert_backing("BASE", None);
    f.assert_backing("S2", Some("BASE"));
    assert_eq!(f.engine.inspect("S1").unwrap().status, LayerStatus::RemovalPending);
    f.assert_original_content();
    // S1's data was pulled up into S2
    f.assert_layer_pattern("S2", 1024, 1024, 2);
}

/// Scenario B: everything into the active layer
#[test]
fn test_forward_merge_all_to_active() {
    let f = three_layer(Variant::default());
    let job = f.engine.pull(f.chain, None, None).unwrap();
    assert_eq!(f.engine.join(job.id).unwrap().status, JobStatus::Completed);

    f.assert_backing("S2", None);
    assert_eq!(f.engine.inspect("S2").unwrap().backing, None);
    f.assert_original_content();

    let mut removed = f.engine.detach_removed(f.chain).unwrap();
    removed.sort();
    assert_eq!(removed, vec!["BASE".to_string(), "S1".to_string()]);
    assert!(!f.dir.path().join("BASE.img").exists());
    f.assert_original_content();
}

/// Scenario C: S1 << S2 with S2 active
#[test]
fn test_backward_merge_from_active() {
    let f = three_layer(Variant::default());
    let job = f.engine.commit(f.chain, "S1", Some("S2"), None).unwrap();
    assert_eq!(f.engine.join(job.id).unwrap().status, JobStatus::Completed);

    assert_eq!(f.engine.active_layer(f.chain).unwrap(), "S1");
    f.assert_backing("BASE", None);
    f.assert_backing("S1", Some("BASE"));
    f.assert_layer_pattern("S1", 1024, 1024, 2);
    f.assert_layer_pattern("S1", 2048, 1024, 3);
    f.assert_original_content();
    assert_eq!(f.engine.inspect("S2").unwrap().status, LayerStatus::RemovalPending);
}

/// BASE << S1 with S2 active gives BASE <- S2
#[test]
fn test_backward_merge_from_inactive() {
    let f = three_layer(Variant::default());
    let job = f.engine.commit(f.chain, "BASE", Some("S1"), None).unwrap();
    assert_eq!(f.engine.join(job.id).unwrap().status, JobStatus::Completed);

    f.assert_backing("BASE", None);
    f.assert_backing("S2", Some("BASE"));
    f.assert_layer_pattern("BASE", 0, 1024, 1);
    f.assert_layer_pattern("BASE", 1024, 2048, 2);
    f.assert_original_content();
    assert_eq!(f.engine.active_layer(f.chain).unwrap(), "S2");
}

/// Scenario D: a second job on a busy chain
#[test]
fn test_second_job_conflicts() {
    let f = three_layer(Variant::default());
    let before = f.engine.snapshot(f.chain).unwrap();

    let job = f.engine.pull(f.chain, None, Some(512)).unwrap();
    let err = f.engine.commit(f.chain, "BASE", Some("S1"), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = f.engine.pull(f.chain, Some("BASE"), None).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(f.engine.snapshot(f.chain).unwrap(), before);
    let info = f.engine.block_job_info(f.chain).unwrap().unwrap();
    assert_eq!(info.end, f.engine.inspect("S2").unwrap().size);

    f.engine.cancel(job.id).unwrap();
    assert_eq!(f.engine.join(job.id).unwrap().status, JobStatus::Cancelled);
    assert_eq!(f.engine.snapshot(f.chain).unwrap(), before);
    f.assert_original_content();
}
