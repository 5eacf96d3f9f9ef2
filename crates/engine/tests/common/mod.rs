//! Shared helpers for engine integration tests

#![allow(dead_code)]

use livemerge_core::{BackingMode, ChainId, ImageFormat};
use livemerge_engine::{EngineConfig, JobSnapshot, LayerSpec, MergeEngine};
use livemerge_storage::DeviceKind;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

pub const KIB: u64 = 1024;

/// Route engine logs to the test writer; `RUST_LOG=livemerge=debug` to see them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn setup() -> (MergeEngine, TempDir) {
    setup_with(EngineConfig::default())
}

pub fn setup_with(config: EngineConfig) -> (MergeEngine, TempDir) {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let engine = MergeEngine::with_config(dir.path(), config).unwrap();
    (engine, dir)
}

/// Create `names` as a linear chain, the first one raw and the rest qcow2
pub fn linear_chain(engine: &MergeEngine, kind: DeviceKind, size: u64, names: &[&str]) -> ChainId {
    let chain = engine.create_chain();
    let mut below: Option<&str> = None;
    for name in names {
        let spec = match below {
            None => LayerSpec::new(*name, ImageFormat::Raw).size(size),
            Some(b) => LayerSpec::new(*name, ImageFormat::Qcow2).backed_by(b, BackingMode::Absolute),
        };
        engine.create_layer(chain, spec.kind(kind)).unwrap();
        below = Some(name);
    }
    chain
}

pub fn assert_pattern(engine: &MergeEngine, chain: ChainId, offset: u64, len: u64, pattern: u8) {
    let mismatch = engine.verify_pattern(chain, offset, len, pattern).unwrap();
    assert!(mismatch.is_none(), "unexpected data: {}", mismatch.unwrap());
}

pub fn names(v: &[&str]) -> Vec<String> {
    v.iter().map(|s| s.to_string()).collect()
}

pub fn join(engine: &MergeEngine, job: &livemerge_engine::JobHandle) -> JobSnapshot {
    engine.join(job.id).unwrap()
}

/// Put a new qcow2 layer `name` on top of `below`
pub fn add_layer(engine: &MergeEngine, chain: ChainId, name: &str, below: &str) {
    let spec = LayerSpec::new(name, ImageFormat::Qcow2).backed_by(below, BackingMode::Absolute);
    engine.create_layer(chain, spec).unwrap();
}
