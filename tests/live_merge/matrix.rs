//! Merges across the permutation matrix
//!
//! Relative or absolute backing paths x raw or qcow2 base x file or block
//! storage. The stored references must keep the path mode they were
//! created with after every relink.

use livemerge::{BackingMode, DeviceKind, ErrorKind, ImageFormat, JobStatus, LayerSpec};

use crate::harness::{engine, three_layer, Variant};

#[test]
fn test_matrix_forward_merge_one_to_active() {
    for variant in Variant::all() {
        let f = three_layer(variant);
        let job = f.engine.pull(f.chain, Some("BASE"), None).unwrap();
        assert_eq!(f.engine.join(job.id).unwrap().status, JobStatus::Completed, "{:?}", variant);

        f.assert_backing("BASE", None);
        f.assert_backing("S2", Some("BASE"));
        let info = f.engine.inspect("S2").unwrap();
        assert_eq!(info.backing.unwrap().format, variant.base_format);
        f.assert_original_content();
    }
}

#[test]
fn test_matrix_backward_merge_from_inactive() {
    for variant in Variant::all() {
        let f = three_layer(variant);
        let job = f.engine.commit(f.chain, "BASE", Some("S1"), None).unwrap();
        assert_eq!(f.engine.join(job.id).unwrap().status, JobStatus::Completed, "{:?}", variant);

        f.assert_backing("BASE", None);
        f.assert_backing("S2", Some("BASE"));
        f.assert_layer_pattern("BASE", 1024, 2048, 2);
        f.assert_original_content();
    }
}

#[test]
fn test_matrix_backward_merge_from_active() {
    for variant in Variant::all() {
        let f = three_layer(variant);
        let job = f.engine.commit(f.chain, "S1", None, None).unwrap();
        assert_eq!(f.engine.join(job.id).unwrap().status, JobStatus::Completed, "{:?}", variant);

        f.assert_backing("S1", Some("BASE"));
        assert_eq!(f.engine.active_layer(f.chain).unwrap(), "S1");
        f.engine.detach_removed(f.chain).unwrap();
        f.assert_original_content();
    }
}

#[test]
fn test_matrix_display_paths() {
    for variant in Variant::all() {
        let f = three_layer(variant);
        let backing = f.engine.inspect("S1").unwrap().backing.unwrap();
        let path = backing.display_path().to_string();
        match (variant.relative, variant.kind) {
            (true, _) => assert_eq!(path, "BASE.img"),
            (false, DeviceKind::File) => {
                assert_eq!(path, f.engine.registry().image_path("BASE").display().to_string())
            }
            (false, DeviceKind::Block) => assert!(path.starts_with("/dev/loop"), "{}", path),
        }
    }
}

#[test]
fn test_relative_paths_rejected_on_block_devices() {
    let (engine, _dir) = engine();
    let chain = engine.create_chain();
    engine
        .create_layer(
            chain,
            LayerSpec::new("BASE", ImageFormat::Raw)
                .size(64 * 1024)
                .kind(DeviceKind::Block),
        )
        .unwrap();
    let err = engine
        .create_layer(
            chain,
            LayerSpec::new("S1", ImageFormat::Qcow2)
                .backed_by("BASE", BackingMode::Relative)
                .kind(DeviceKind::Block),
        )
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert!(engine.layer_id("S1").is_err());
}
