//! Chain fixtures shared by the scenario suites

#![allow(dead_code)]

use livemerge::{
    BackingMode, ChainId, DeviceKind, EngineConfig, ImageFormat, LayerSpec, MergeEngine,
};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

pub const IMAGE_SIZE: u64 = 1024 * 1024;

/// One point of the permutation matrix
#[derive(Debug, Clone, Copy)]
pub struct Variant {
    pub relative: bool,
    pub base_format: ImageFormat,
    pub kind: DeviceKind,
}

impl Variant {
    pub fn mode(&self) -> BackingMode {
        if self.relative {
            BackingMode::Relative
        } else {
            BackingMode::Absolute
        }
    }

    /// Every supported combination; relative paths need image files
    pub fn all() -> Vec<Variant> {
        let mut out = Vec::new();
        for relative in [false, true] {
            for base_format in [ImageFormat::Raw, ImageFormat::Qcow2] {
                for kind in [DeviceKind::File, DeviceKind::Block] {
                    if relative && kind == DeviceKind::Block {
                        continue;
                    }
                    out.push(Variant {
                        relative,
                        base_format,
                        kind,
                    });
                }
            }
        }
        out
    }
}

impl Default for Variant {
    fn default() -> Self {
        Variant {
            relative: false,
            base_format: ImageFormat::Raw,
            kind: DeviceKind::File,
        }
    }
}

pub struct Fixture {
    pub engine: MergeEngine,
    pub chain: ChainId,
    pub variant: Variant,
    pub dir: TempDir,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn engine() -> (MergeEngine, TempDir) {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let engine = MergeEngine::with_config(dir.path(), EngineConfig::default()).unwrap();
    (engine, dir)
}

/// BASE(1 @ 0..3072) <- S1(2 @ 1024..3072) <- S2(3 @ 2048..3072), S2 active
pub fn three_layer(variant: Variant) -> Fixture {
    let (engine, dir) = engine();
    let chain = engine.create_chain();

    engine
        .create_layer(
            chain,
            LayerSpec::new("BASE", variant.base_format)
                .size(IMAGE_SIZE)
                .kind(variant.kind),
        )
        .unwrap();
    engine.write_layer_pattern("BASE", 0, 3072, 1).unwrap();

    engine
        .create_layer(
            chain,
            LayerSpec::new("S1", ImageFormat::Qcow2)
                .backed_by("BASE", variant.mode())
                .backing_format(variant.base_format)
                .kind(variant.kind),
        )
        .unwrap();
    engine.write_layer_pattern("S1", 1024, 2048, 2).unwrap();

    engine
        .create_layer(
            chain,
            LayerSpec::new("S2", ImageFormat::Qcow2)
                .backed_by("S1", variant.mode())
                .backing_format(ImageFormat::Qcow2)
                .kind(variant.kind),
        )
        .unwrap();
    engine.write_layer_pattern("S2", 2048, 1024, 3).unwrap();

    let f = Fixture {
        engine,
        chain,
        variant,
        dir,
    };
    f.assert_backing("BASE", None);
    f.assert_backing("S1", Some("BASE"));
    f.assert_backing("S2", Some("S1"));
    f
}

impl Fixture {
    /// Check the stored reference of `layer`, in the variant's path mode
    pub fn assert_backing(&self, layer: &str, expected: Option<&str>) {
        let mismatch = self
            .engine
            .check_backing(layer, expected, self.variant.mode())
            .unwrap();
        assert!(mismatch.is_none(), "{:?}: {}", self.variant, mismatch.unwrap());
    }

    pub fn assert_layer_pattern(&self, layer: &str, offset: u64, len: u64, pattern: u8) {
        let mismatch = self
            .engine
            .verify_layer_pattern(layer, offset, len, pattern)
            .unwrap();
        assert!(mismatch.is_none(), "{:?} {}: {}", self.variant, layer, mismatch.unwrap());
    }

    pub fn assert_pattern(&self, offset: u64, len: u64, pattern: u8) {
        let mismatch = self
            .engine
            .verify_pattern(self.chain, offset, len, pattern)
            .unwrap();
        assert!(mismatch.is_none(), "{:?}: {}", self.variant, mismatch.unwrap());
    }

    /// The three-layer fixture's logical content
    pub fn assert_original_content(&self) {
        self.assert_pattern(0, 1024, 1);
        self.assert_pattern(1024, 1024, 2);
        self.assert_pattern(2048, 1024, 3);
        self.assert_pattern(3072, 1024, 0);
    }
}
