//! Compare-Warp artifact rejection against a static-sky template

use approx::assert_relative_eq;
use coadd::compare_warp::CompareWarpAssembler;
use coadd::{CompareWarpConfig, Epoch, EpochId, InMemoryEpochs, PreparedInputs};
use shared::image_proc::mask::planes;
use shared::image_proc::{MaskPlaneRegistry, SpanSet, AABB};
use shared::test_util::flat_image;

const N_EPOCHS: usize = 10;

fn bbox() -> AABB {
    AABB::from_origin_size(0, 0, 32, 32)
}

fn artifact_region() -> AABB {
    AABB::from_origin_size(10, 10, 3, 3)
}

fn config() -> CompareWarpConfig {
    let mut config = CompareWarpConfig::default();
    config.template.calc_error_from_input_variance = true;
    config
}

/// Flat epochs whose first `n_hit` carry the same 3x3 bump of amplitude 100.
fn epochs(n_hit: usize) -> InMemoryEpochs {
    let region = SpanSet::from_bbox(&artifact_region());
    let epochs = (0..N_EPOCHS)
        .map(|k| {
            let mut image = flat_image(bbox(), 0.0, 1.0);
            if k < n_hit {
                region.set_image(&mut image, 100.0);
            }
            Epoch::new(EpochId(k as u64), image.clone()).with_psf_matched(image)
        })
        .collect();
    InMemoryEpochs::new("i", epochs)
}

#[test]
fn test_single_epoch_artifact_is_clipped() {
    let _ = env_logger::builder().is_test(true).try_init();
    let registry = MaskPlaneRegistry::new();
    let source = epochs(1);
    let inputs = PreparedInputs::uniform(&source).unwrap();
    let assembler = CompareWarpAssembler::new(config()).unwrap();

    let supplementary = assembler
        .make_supplementary_data(&source, &bbox(), &registry)
        .unwrap();
    // The lone bump is clipped out of the template
    assert_relative_eq!(supplementary.template.image.image[[11, 11]], 0.0);

    let artifacts = assembler
        .find_artifacts(&source, &inputs, &supplementary.template.image, &registry)
        .unwrap();
    assert_eq!(artifacts.artifacts[0].len(), 1);
    assert!(artifacts.artifacts[0][0].contains(&SpanSet::from_bbox(&artifact_region())));
    assert!(artifacts.artifacts[1..].iter().all(|a| a.is_empty()));
    assert_eq!(artifacts.n_image[[11, 11]], N_EPOCHS as u16);
    assert_eq!(artifacts.epoch_count[[11, 11]], 1);

    let coadd = assembler
        .assemble(&source, &inputs, &bbox(), &registry, &supplementary)
        .unwrap();
    let clipped = registry.plane_bit(planes::CLIPPED).unwrap();
    for row in 10..13 {
        for col in 10..13 {
            assert_relative_eq!(coadd.image.image[[row, col]], 0.0);
            assert_ne!(coadd.image.mask[[row, col]] & clipped, 0);
        }
    }
    assert_eq!(coadd.image.mask[[25, 25]] & clipped, 0);
}

#[test]
fn test_persistent_source_is_kept() {
    let _ = env_logger::builder().is_test(true).try_init();
    let registry = MaskPlaneRegistry::new();
    let source = epochs(6);
    let inputs = PreparedInputs::uniform(&source).unwrap();
    let assembler = CompareWarpAssembler::new(config()).unwrap();

    let supplementary = assembler
        .make_supplementary_data(&source, &bbox(), &registry)
        .unwrap();
    let artifacts = assembler
        .find_artifacts(&source, &inputs, &supplementary.template.image, &registry)
        .unwrap();
    assert!(artifacts.artifacts.iter().all(|a| a.is_empty()));

    let coadd = assembler
        .assemble(&source, &inputs, &bbox(), &registry, &supplementary)
        .unwrap();
    let clipped = registry.plane_bit(planes::CLIPPED).unwrap();
    assert_relative_eq!(coadd.image.image[[11, 11]], 60.0, epsilon = 1e-9);
    assert_eq!(coadd.image.mask[[11, 11]] & clipped, 0);
}

#[test]
fn test_missing_psf_matched_warps_fail_template() {
    let _ = env_logger::builder().is_test(true).try_init();
    let registry = MaskPlaneRegistry::new();
    let epochs = (0..3)
        .map(|k| Epoch::new(EpochId(k), flat_image(bbox(), 0.0, 1.0)))
        .collect();
    let source = InMemoryEpochs::new("i", epochs);
    let assembler = CompareWarpAssembler::new(config()).unwrap();
    assert!(assembler
        .make_supplementary_data(&source, &bbox(), &registry)
        .is_err());
}
