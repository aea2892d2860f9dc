//! Assemble a coadd of a synthetic patch
//!
//! Renders a star field seen by a number of visits, injects transient
//! artifacts into some of them, and runs the selected assembly strategy.
//! Reports how much of each artifact survives in the coadd and, for DCR, the
//! convergence of every tile.
//!
//! # Usage
//!
//! ```bash
//! # Compare-Warp on a 128x128 patch of 12 visits
//! cargo run --release --bin assemble_synthetic -- --epochs 12
//!
//! # Safe-Clip with a custom configuration
//! cargo run --release --bin assemble_synthetic -- --method safe-clip --config safe_clip.json
//!
//! # DCR with visits spread over airmass
//! RUST_LOG=info cargo run --release --bin assemble_synthetic -- --method dcr --tile 64x64
//! ```

use clap::Parser;
use coadd::epoch::{VisitInfo, Weather};
use coadd::scene::{Artifact, DcrOptics, Scene};
use coadd::shared_args::SharedCoaddArgs;
use coadd::{AssemblyMethod, CoaddOutput};
use shared::image_proc::mask::planes;
use shared::image_proc::{MaskPlaneRegistry, SpanSet, AABB};
use shared::ImageSize;

#[derive(Parser, Debug)]
#[command(author, version, about = "Assemble a coadd of a synthetic patch")]
struct Args {
    #[command(flatten)]
    shared: SharedCoaddArgs,

    /// Number of visits
    #[arg(long, default_value_t = 10)]
    epochs: usize,

    /// Patch size (e.g., "128x128")
    #[arg(long, default_value = "128x128")]
    size: ImageSize,

    /// Number of stars
    #[arg(long, default_value_t = 20)]
    stars: usize,

    /// Number of visits carrying one artifact each
    #[arg(long, default_value_t = 2)]
    artifacts: usize,

    /// Sky level; images are background-subtracted, so it sets the noise variance
    #[arg(long, default_value_t = 100.0)]
    background: f64,

    /// Random seed for stars and noise
    #[arg(long, default_value_t = 7)]
    seed: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();
    let method = args.shared.load_method()?;

    let bbox = AABB::from_origin_size(0, 0, args.size.height, args.size.width);
    let mut scene = Scene::new(bbox, 0.0, args.background, args.epochs)
        .with_random_stars(args.stars, (500.0, 5000.0), 1.5, 8.0, args.seed)
        .with_noise(args.seed);

    for k in 0..args.artifacts.min(args.epochs) {
        let row = (k * 17 + 11) % args.size.height.saturating_sub(4).max(1);
        let col = (k * 29 + 5) % args.size.width.saturating_sub(4).max(1);
        scene = scene.with_artifact(Artifact {
            epoch: k,
            region: AABB::from_origin_size(row, col, 3, 3),
            amplitude: 20.0 * args.background.sqrt(),
        });
    }

    if let AssemblyMethod::Dcr(config) = &method {
        let visits = (0..args.epochs)
            .map(|k| VisitInfo {
                elevation_deg: 85.0 - 40.0 * k as f64 / args.epochs.max(1) as f64,
                parallactic_angle_deg: 30.0 * k as f64,
                rotator_angle_deg: 0.0,
                weather: Weather::default(),
            })
            .collect();
        scene = scene.with_visits(visits).with_dcr(DcrOptics {
            lambda_eff: config.lambda_eff,
            filter_width: config.filter_width(),
            n_subbands: config.dcr_num_subbands,
            pixel_scale: config.pixel_scale,
        });
    }

    println!("Synthetic Coadd Assembly");
    println!("========================");
    println!("Method: {}", method.name());
    println!("Patch: {} with {} visits", args.size, args.epochs);
    println!("Stars: {}  Artifacts: {}", args.stars, scene.artifacts.len());
    println!();

    let source = scene.epochs("g")?;
    let registry = MaskPlaneRegistry::new();
    let output = method.run(&source, &bbox, &registry)?;

    let clipped = registry.plane_bit(planes::CLIPPED)?;
    let no_data = registry.plane_bit(planes::NO_DATA)?;
    let sky = scene.sky();

    for (k, coadd) in output.coadds().iter().enumerate() {
        let image = &coadd.image;
        let n_clipped = image.mask.iter().filter(|&&m| m & clipped != 0).count();
        let n_no_data = image.mask.iter().filter(|&&m| m & no_data != 0).count();
        println!(
            "Coadd {k}: {} epochs, {n_clipped} CLIPPED pixels, {n_no_data} NO_DATA pixels",
            coadd.metadata.n_epochs
        );
    }

    match &output {
        CoaddOutput::Single(coadd) => {
            println!();
            println!("{:<10} {:<15} {:<15}", "Artifact", "Injected", "Residual");
            for artifact in &scene.artifacts {
                let residual: f64 = SpanSet::from_bbox(&artifact.region)
                    .local_indices(&bbox)
                    .map(|idx| coadd.image.image[idx] - sky[idx])
                    .sum::<f64>()
                    / artifact.region.area() as f64;
                println!(
                    "{:<10} {:<15.2} {:<15.2}",
                    artifact.epoch,
                    artifact.amplitude / args.epochs as f64,
                    residual
                );
            }
        }
        CoaddOutput::Dcr(coadds) => {
            println!();
            println!("{:<25} {:<12} {:<12} {:<10}", "Tile", "Iterations", "Metric", "Status");
            for state in &coadds.convergence {
                println!(
                    "{:<25} {:<12} {:<12.6} {:<10}",
                    state.bbox.to_string(),
                    state.iterations,
                    state.final_metric().unwrap_or(f64::NAN),
                    state.reason.to_string()
                );
            }
            if let Some(combined) = coadds.combined() {
                let error = (&combined.image - &sky).mapv(f64::abs).sum() / sky.sum();
                println!();
                println!("Relative error of the combined model: {error:.5}");
            }
        }
    }
    Ok(())
}
