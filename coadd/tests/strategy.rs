//! End-to-end runs of every strategy on synthetic patches

use coadd::config::{AssembleCoaddConfig, CompareWarpConfig, DcrConfig, SafeClipConfig};
use coadd::epoch::{VisitInfo, Weather};
use coadd::scene::{Artifact, DcrOptics, Scene};
use coadd::strategy::BaseAssembler;
use coadd::{AssemblyMethod, CoaddOutput, CoaddStrategy};
use shared::image_proc::mask::planes;
use shared::image_proc::{MaskPlaneRegistry, SpanSet, AABB};
use shared::ImageSize;

const BACKGROUND: f64 = 100.0;

fn bbox() -> AABB {
    AABB::from_origin_size(0, 0, 64, 64)
}

fn artifact() -> Artifact {
    Artifact {
        epoch: 0,
        region: AABB::from_origin_size(40, 40, 3, 3),
        amplitude: 200.0,
    }
}

/// Ten noisy background-subtracted visits of an empty sky, the first carrying
/// a bright artifact.
fn scene() -> Scene {
    Scene::new(bbox(), 0.0, BACKGROUND, 10)
        .with_artifact(artifact())
        .with_noise(3)
}

fn mean_over(image: &ndarray::Array2<f64>, region: &AABB) -> f64 {
    let spans = SpanSet::from_bbox(region);
    spans.local_indices(&bbox()).map(|idx| image[idx]).sum::<f64>() / spans.area() as f64
}

#[test]
fn test_base_strategy_run() {
    let _ = env_logger::builder().is_test(true).try_init();
    let registry = MaskPlaneRegistry::new();
    let source = Scene::new(bbox(), BACKGROUND, BACKGROUND, 6)
        .with_noise(11)
        .epochs("r")
        .unwrap();
    let assembler = BaseAssembler::new(AssembleCoaddConfig::default()).unwrap();

    let coadd = assembler.run(&source, &bbox(), &registry).unwrap();
    assert_eq!(coadd.metadata.n_epochs, 6);
    assert_eq!(coadd.metadata.filter, "r");
    let mean = coadd.image.image.mean().unwrap();
    assert!((mean - BACKGROUND).abs() < 1.0, "mean {mean}");
}

#[test]
fn test_compare_warp_removes_artifact() {
    let _ = env_logger::builder().is_test(true).try_init();
    let registry = MaskPlaneRegistry::new();
    let source = scene().epochs("r").unwrap();
    let method = AssemblyMethod::CompareWarp(CompareWarpConfig::default());

    let output = method.run(&source, &bbox(), &registry).unwrap();
    let CoaddOutput::Single(coadd) = output else {
        panic!("Compare-Warp returned a DCR result");
    };
    // Unrejected, the artifact would add 20 to the mean
    let residual = mean_over(&coadd.image.image, &artifact().region);
    assert!(residual.abs() < 8.0, "residual {residual}");
    let clipped = registry.plane_bit(planes::CLIPPED).unwrap();
    assert_ne!(coadd.image.mask[[41, 41]] & clipped, 0);
}

#[test]
fn test_safe_clip_runs_through_dispatch() {
    let _ = env_logger::builder().is_test(true).try_init();
    let registry = MaskPlaneRegistry::new();
    let source = scene().epochs("r").unwrap();
    let method = AssemblyMethod::SafeClip(SafeClipConfig::default());

    let output = method.run(&source, &bbox(), &registry).unwrap();
    let coadds = output.coadds();
    assert_eq!(coadds.len(), 1);
    assert_eq!(coadds[0].metadata.n_epochs, 10);
    assert!(coadds[0].image.image.iter().all(|v| v.is_finite()));
}

#[test]
fn test_dcr_on_refracted_scene() {
    let _ = env_logger::builder().is_test(true).try_init();
    let registry = MaskPlaneRegistry::new();
    let mut config = DcrConfig::default();
    config.compare_warp.assemble.subregion_size = ImageSize::from_width_height(32, 32);
    config.max_num_iter = 4;

    let visits = (0..6)
        .map(|k| VisitInfo {
            elevation_deg: 80.0 - 8.0 * k as f64,
            parallactic_angle_deg: 60.0 * k as f64,
            rotator_angle_deg: 0.0,
            weather: Weather::default(),
        })
        .collect();
    let source = Scene::new(bbox(), BACKGROUND, BACKGROUND, 6)
        .with_random_stars(5, (2000.0, 5000.0), 1.5, 8.0, 5)
        .with_visits(visits)
        .with_dcr(DcrOptics {
            lambda_eff: config.lambda_eff,
            filter_width: config.filter_width(),
            n_subbands: config.dcr_num_subbands,
            pixel_scale: config.pixel_scale,
        })
        .with_noise(17)
        .epochs("g")
        .unwrap();

    let output = AssemblyMethod::Dcr(config.clone())
        .run(&source, &bbox(), &registry)
        .unwrap();
    let CoaddOutput::Dcr(coadds) = output else {
        panic!("DCR returned a single coadd");
    };
    assert_eq!(coadds.len(), config.dcr_num_subbands);
    assert_eq!(coadds.wavelengths.len(), config.dcr_num_subbands);
    assert_eq!(coadds.convergence.len(), 4);
    for state in &coadds.convergence {
        assert!(!state.history.is_empty());
        assert!(state.iterations <= config.max_num_iter);
        assert!(state.history.windows(2).all(|w| w[1] <= w[0]));
    }
    let combined = coadds.combined().unwrap();
    assert!(combined.image.iter().all(|v| v.is_finite()));
}
