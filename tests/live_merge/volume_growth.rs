//! Volume growth under a live writer
//!
//! A consumer keeps appending to the active layer while a bandwidth-limited
//! merge runs; a watcher samples each image's allocation high-water mark.
//! The volume itself can also be extended while a pull is copying.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use livemerge::{
    BackingMode, ChainGrowthSample, DeviceKind, ImageFormat, JobStatus, LayerSpec, MergeDirection,
    MergeEngine, WaitOptions,
};

use tempfile::TempDir;

use crate::harness::engine;

const SIZE: u64 = 1024 * 1024;
const STRIDE: u64 = 16 * 1024;

fn grow_and_merge(commit: bool) -> (Arc<MergeEngine>, Vec<ChainGrowthSample>, u64, TempDir) {
    let (engine, dir) = engine();
    let engine = Arc::new(engine);
    let chain = engine.create_chain();
    engine
        .create_layer(
            chain,
            LayerSpec::new("BASE", ImageFormat::Qcow2)
                .size(SIZE)
                .kind(DeviceKind::Block),
        )
        .unwrap();
    engine.write_pattern(chain, 0, 64 * 1024, 0xBA).unwrap();
    engine
        .create_layer(
            chain,
            LayerSpec::new("S1", ImageFormat::Qcow2)
                .backed_by("BASE", BackingMode::Absolute)
                .kind(DeviceKind::Block),
        )
        .unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let writer = {
        let engine = Arc::clone(&engine);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut seek = 0u64;
            while !stop.load(Ordering::Relaxed) && seek + STRIDE <= SIZE {
                engine.write_pattern(chain, seek, STRIDE, 0xEE).unwrap();
                seek += STRIDE;
                thread::sleep(Duration::from_millis(5));
            }
            seek
        })
    };
    let watcher = {
        let engine = Arc::clone(&engine);
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            let mut samples = Vec::new();
            while !stop.load(Ordering::Relaxed) {
                samples.push(engine.sample_growth(chain).unwrap());
                thread::sleep(Duration::from_millis(10));
            }
            samples
        })
    };

    // Let the active layer grow before merging
    thread::sleep(Duration::from_millis(100));
    let (job, direction) = if commit {
        let job = engine.commit(chain, "BASE", Some("S1"), Some(256 * 1024));
        (job.unwrap(), MergeDirection::Commit)
    } else {
        let job = engine.pull(chain, None, Some(256 * 1024));
        (job.unwrap(), MergeDirection::Pull)
    };
    let opts = WaitOptions {
        timeout: Duration::from_secs(60),
        ..engine.wait_options()
    };
    engine.wait_block_job(chain, direction, &opts, None).unwrap();
    let snap = engine.join(job.id).unwrap();
    assert_eq!(snap.status, JobStatus::Completed);

    stop.store(true, Ordering::Relaxed);
    let written = writer.join().unwrap();
    let mut samples = watcher.join().unwrap();
    samples.push(engine.sample_growth(chain).unwrap());

    assert_eq!(engine.verify_pattern(chain, 0, written, 0xEE).unwrap(), None);
    (engine, samples, written, dir)
}

fn assert_monotonic(samples: &[ChainGrowthSample]) {
    for pair in samples.windows(2) {
        assert!(pair[1].at >= pair[0].at);
        if pair[0].layer == pair[1].layer {
            assert!(
                pair[1].allocated_end >= pair[0].allocated_end,
                "{} shrank from {} to {}",
                pair[0].layer,
                pair[0].allocated_end,
                pair[1].allocated_end
            );
        }
    }
}

#[test]
fn test_growth_during_commit() {
    let (engine, samples, written, _dir) = grow_and_merge(true);
    assert_monotonic(&samples);
    // Active commit pivots: BASE takes over the writes
    assert_eq!(samples.last().unwrap().layer, "BASE");
    assert!(engine.inspect("BASE").unwrap().allocated_end >= written);
}

#[test]
fn test_growth_during_pull() {
    let (engine, samples, written, _dir) = grow_and_merge(false);
    assert_monotonic(&samples);
    assert!(samples.iter().all(|s| s.layer == "S1"));
    assert_eq!(engine.inspect("S1").unwrap().backing, None);
    assert!(engine.inspect("S1").unwrap().allocated_end >= written);
}

#[test]
fn test_volume_extended_during_pull() {
    let (engine, _dir) = engine();
    let chain = engine.create_chain();
    engine
        .create_layer(
            chain,
            LayerSpec::new("BASE", ImageFormat::Qcow2)
                .size(SIZE)
                .kind(DeviceKind::Block),
        )
        .unwrap();
    engine.write_pattern(chain, 0, 64 * 1024, 0xBA).unwrap();
    engine
        .create_layer(
            chain,
            LayerSpec::new("S1", ImageFormat::Qcow2)
                .backed_by("BASE", BackingMode::Absolute)
                .kind(DeviceKind::Block),
        )
        .unwrap();
    let before = engine.sample_growth(chain).unwrap();

    // 32 KiB/s over 64 KiB of data keeps the pull busy for about two seconds
    let job = engine.pull(chain, None, Some(32 * 1024)).unwrap();
    engine.grow_active(chain, 2 * SIZE).unwrap();
    engine.write_pattern(chain, SIZE, STRIDE, 0xEF).unwrap();
    let grown = engine.sample_growth(chain).unwrap();

    let opts = WaitOptions {
        timeout: Duration::from_secs(60),
        ..engine.wait_options()
    };
    engine
        .wait_block_job(chain, MergeDirection::Pull, &opts, None)
        .unwrap();
    let snap = engine.join(job.id).unwrap();
    assert_eq!(snap.status, JobStatus::Completed);
    assert_eq!(snap.end, 2 * SIZE);

    assert_eq!((before.layer.as_str(), before.size), ("S1", SIZE));
    assert_eq!(before.allocated_end, 0);
    assert_eq!(grown.size, 2 * SIZE);
    assert_eq!(grown.allocated_end, SIZE + STRIDE);
    assert_eq!(engine.inspect("S1").unwrap().backing, None);
    assert_eq!(engine.verify_pattern(chain, 0, 64 * 1024, 0xBA).unwrap(), None);
    assert_eq!(engine.verify_pattern(chain, SIZE, STRIDE, 0xEF).unwrap(), None);
}
