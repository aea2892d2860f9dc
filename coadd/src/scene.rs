//! Synthetic patches for demos and end-to-end tests.
//!
//! A [`Scene`] is a static sky of Gaussian stars on a flat background, seen by
//! a list of visits. Each visit can carry transient artifacts and, when DCR
//! optics are attached, sees every star split across sub-bands and displaced
//! by that visit's refraction.

use log::debug;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::NormalError;
use shared::image_proc::noise::add_gaussian_noise;
use shared::image_proc::{MaskedImage, SpanSet, AABB};
use shared::test_util::gaussian_source;

use crate::dcr::{dcr_shifts, subband_edges};
use crate::epoch::{Epoch, EpochId, InMemoryEpochs, VisitInfo};

/// A circular Gaussian star in patch coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Star {
    pub row: f64,
    pub col: f64,
    pub flux: f64,
    pub sigma: f64,
}

/// A constant offset added to one region of one visit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Artifact {
    pub epoch: usize,
    pub region: AABB,
    pub amplitude: f64,
}

/// Wavelength layout used to displace stars per visit.
#[derive(Debug, Clone, PartialEq)]
pub struct DcrOptics {
    pub lambda_eff: f64,
    pub filter_width: f64,
    pub n_subbands: usize,
    pub pixel_scale: f64,
}

#[derive(Debug, Clone)]
pub struct Scene {
    pub bbox: AABB,
    pub background: f64,
    pub variance: f64,
    pub stars: Vec<Star>,
    pub artifacts: Vec<Artifact>,
    pub visits: Vec<VisitInfo>,
    pub dcr: Option<DcrOptics>,
    /// Seed of the per-visit noise; `None` renders noise-free images
    pub noise_seed: Option<u64>,
}

impl Scene {
    /// Empty sky seen by `n_epochs` zenith visits.
    pub fn new(bbox: AABB, background: f64, variance: f64, n_epochs: usize) -> Self {
        Self {
            bbox,
            background,
            variance,
            stars: Vec::new(),
            artifacts: Vec::new(),
            visits: vec![VisitInfo::zenith(); n_epochs],
            dcr: None,
            noise_seed: None,
        }
    }

    pub fn with_star(mut self, star: Star) -> Self {
        self.stars.push(star);
        self
    }

    /// Scatter `n` stars at least `margin` pixels inside the patch.
    pub fn with_random_stars(
        mut self,
        n: usize,
        flux: (f64, f64),
        sigma: f64,
        margin: f64,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let (rows, cols) = self.bbox.shape();
        let row0 = self.bbox.min_row as f64;
        let col0 = self.bbox.min_col as f64;
        let span_r = (rows as f64 - 2.0 * margin).max(1.0);
        let span_c = (cols as f64 - 2.0 * margin).max(1.0);
        for _ in 0..n {
            self.stars.push(Star {
                row: row0 + margin + rng.random::<f64>() * span_r,
                col: col0 + margin + rng.random::<f64>() * span_c,
                flux: flux.0 + rng.random::<f64>() * (flux.1 - flux.0),
                sigma,
            });
        }
        self
    }

    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    pub fn with_visits(mut self, visits: Vec<VisitInfo>) -> Self {
        self.visits = visits;
        self
    }

    pub fn with_dcr(mut self, optics: DcrOptics) -> Self {
        self.dcr = Some(optics);
        self
    }

    pub fn with_noise(mut self, seed: u64) -> Self {
        self.noise_seed = Some(seed);
        self
    }

    /// The static sky without refraction or artifacts.
    pub fn sky(&self) -> Array2<f64> {
        let mut sky = Array2::from_elem(self.bbox.shape(), self.background);
        for star in &self.stars {
            sky += &gaussian_source(&self.bbox, star.row, star.col, star.flux, star.sigma);
        }
        sky
    }

    fn stars_for_visit(&self, visit: &VisitInfo, sky: &mut Array2<f64>) {
        let Some(optics) = &self.dcr else {
            for star in &self.stars {
                *sky += &gaussian_source(&self.bbox, star.row, star.col, star.flux, star.sigma);
            }
            return;
        };
        let edges = subband_edges(optics.lambda_eff, optics.filter_width, optics.n_subbands);
        let shifts = dcr_shifts(visit, &edges, optics.lambda_eff, optics.pixel_scale);
        let share = 1.0 / optics.n_subbands as f64;
        for star in &self.stars {
            for shift in &shifts {
                *sky += &gaussian_source(
                    &self.bbox,
                    star.row + shift.dy,
                    star.col + shift.dx,
                    star.flux * share,
                    star.sigma,
                );
            }
        }
    }

    /// Image of visit `k`.
    pub fn render_epoch(&self, k: usize) -> Result<MaskedImage, NormalError> {
        let visit = self.visits.get(k).copied().unwrap_or_else(VisitInfo::zenith);
        let mut image = MaskedImage::filled(self.bbox, self.background, self.variance, 0);
        self.stars_for_visit(&visit, &mut image.image);
        for artifact in self.artifacts.iter().filter(|a| a.epoch == k) {
            for idx in SpanSet::from_bbox(&artifact.region).local_indices(&self.bbox) {
                image.image[idx] += artifact.amplitude;
            }
        }
        if let Some(seed) = self.noise_seed {
            add_gaussian_noise(&mut image, seed.wrapping_add(k as u64))?;
        }
        Ok(image)
    }

    /// Every visit as an in-memory epoch; the PSF-matched warp is the direct
    /// image.
    pub fn epochs(&self, filter: &str) -> Result<InMemoryEpochs, NormalError> {
        let mut epochs = Vec::with_capacity(self.visits.len());
        for (k, visit) in self.visits.iter().enumerate() {
            let image = self.render_epoch(k)?;
            epochs.push(
                Epoch::new(EpochId(k as u64), image.clone())
                    .with_psf_matched(image)
                    .with_visit_info(*visit),
            );
        }
        debug!(
            "Rendered {} epochs of {} with {} stars and {} artifacts",
            epochs.len(),
            self.bbox,
            self.stars.len(),
            self.artifacts.len()
        );
        Ok(InMemoryEpochs::new(filter, epochs))
    }
}
