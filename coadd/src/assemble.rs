//! Tiled coadd assembly.
//!
//! The output patch is processed in raster-ordered tiles of
//! [`AssembleCoaddConfig::subregion_size`]. For every tile each epoch window is
//! read, its alternate mask overlay applied, removed planes cleared, and the
//! stack reduced with [`statistics_stack`]. A tile that fails is logged and
//! left as NO_DATA; the remaining tiles are unaffected.
//!
//! After all tiles the coadd is post-processed: pixels built from rejected or
//! edge inputs are flagged INEXACT_PSF, pixels without a usable variance are
//! flagged NO_DATA, and NO_DATA pixels are optionally interpolated.

use log::{debug, error, info};
use ndarray::{s, Array2, Zip};
use shared::image_proc::interp::interpolate_rows;
use shared::image_proc::mask::planes;
use shared::image_proc::{MaskError, MaskPlaneRegistry, MaskedImage, SpanSet, AABB};
use shared::ImageSize;
use std::collections::BTreeMap;

use crate::config::AssembleCoaddConfig;
use crate::epoch::{EpochId, EpochSource, PreparedInputs, WarpType};
use crate::error::{CoaddError, ConfigError};
use crate::stack::{statistics_stack, Statistic, StatsControl};

/// Per-epoch regions to OR into named mask planes before stacking.
pub type AltMaskOverlay = BTreeMap<String, Vec<SpanSet>>;

/// Provenance of a coadd.
#[derive(Debug, Clone, PartialEq)]
pub struct CoaddMetadata {
    pub filter: String,
    pub epoch_ids: Vec<EpochId>,
    pub weights: Vec<f64>,
    pub n_epochs: usize,
}

impl CoaddMetadata {
    pub fn new(source: &dyn EpochSource, inputs: &PreparedInputs) -> Self {
        Self {
            filter: source.filter_name().to_string(),
            epoch_ids: inputs.ids.clone(),
            weights: inputs.weights.clone(),
            n_epochs: inputs.len(),
        }
    }
}

/// An assembled coadd.
#[derive(Debug, Clone, PartialEq)]
pub struct CoaddResult {
    pub image: MaskedImage,
    /// Number of epochs contributing to each pixel, when requested
    pub n_image: Option<Array2<u16>>,
    pub metadata: CoaddMetadata,
}

/// Bits of the planes the assembler reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoaddBits {
    pub no_data: u32,
    pub edge: u32,
    pub intrp: u32,
    pub rejected: u32,
    pub clipped: u32,
    pub sensor_edge: u32,
    pub inexact_psf: u32,
}

impl CoaddBits {
    /// Look up the standard planes, registering the coadd-specific ones.
    pub fn register(registry: &MaskPlaneRegistry) -> Result<Self, MaskError> {
        let bit = |name: &str| registry.add_plane(name).map(|idx| 1u32 << idx);
        Ok(Self {
            no_data: bit(planes::NO_DATA)?,
            edge: bit(planes::EDGE)?,
            intrp: bit(planes::INTRP)?,
            rejected: bit(planes::REJECTED)?,
            clipped: bit(planes::CLIPPED)?,
            sensor_edge: bit(planes::SENSOR_EDGE)?,
            inexact_psf: bit(planes::INEXACT_PSF)?,
        })
    }

    /// Substitutions applied to inputs excluded by `bad_mask`.
    pub fn mask_map(&self, bad_mask: u32) -> Vec<(u32, u32)> {
        vec![
            (
                bad_mask & !self.no_data & !self.edge & !self.clipped,
                self.rejected,
            ),
            (self.edge, self.sensor_edge),
            (self.clipped, self.clipped),
        ]
    }
}

/// Raster-ordered tiles covering a bounding box.
#[derive(Debug, Clone)]
pub struct SubBBoxIter {
    bbox: AABB,
    size: ImageSize,
    row: usize,
    col: usize,
}

impl Iterator for SubBBoxIter {
    type Item = AABB;

    fn next(&mut self) -> Option<AABB> {
        if self.row > self.bbox.max_row {
            return None;
        }
        let tile = AABB::from_origin_size(self.row, self.col, self.size.height, self.size.width)
            .intersection(&self.bbox)?;
        self.col += self.size.width;
        if self.col > self.bbox.max_col {
            self.col = self.bbox.min_col;
            self.row += self.size.height;
        }
        Some(tile)
    }
}

/// Iterate over `size` tiles of `bbox`, clipped at its far edges.
pub fn sub_bbox_iter(bbox: &AABB, size: ImageSize) -> Result<SubBBoxIter, CoaddError> {
    if !bbox.is_valid() {
        return Err(CoaddError::EmptyRegion(*bbox));
    }
    if size.is_empty() {
        return Err(ConfigError::EmptySubregion(size.to_string()).into());
    }
    Ok(SubBBoxIter {
        bbox: *bbox,
        size,
        row: bbox.min_row,
        col: bbox.min_col,
    })
}

/// OR each overlay's regions into its plane.
///
/// With `use_psf_matched_polygons`, the configured bad bits are first cleared
/// inside the NO_DATA regions: those pixels are rejected as NO_DATA instead of
/// being counted as REJECTED. CLIPPED is not a configured bad plane and
/// survives.
pub fn apply_alt_mask_planes(
    image: &mut MaskedImage,
    overlay: &AltMaskOverlay,
    registry: &MaskPlaneRegistry,
    bad_mask: u32,
    use_psf_matched_polygons: bool,
) -> Result<(), MaskError> {
    if use_psf_matched_polygons {
        let no_data = registry.plane_bit(planes::NO_DATA)?;
        let base_bad = bad_mask & !(1u32 << registry.add_plane(planes::CLIPPED)?);
        if bad_mask & no_data != 0 {
            if let Some(regions) = overlay.get(planes::NO_DATA) {
                for region in regions {
                    region.clear_mask(image, base_bad);
                }
            }
        }
    }
    for (plane, regions) in overlay {
        let bit = 1u32 << registry.add_plane(plane)?;
        for region in regions {
            region.set_mask(image, bit);
        }
    }
    Ok(())
}

/// Flag pixels built from edge, clipped or rejected inputs as INEXACT_PSF.
pub fn set_inexact_psf(image: &mut MaskedImage, bits: &CoaddBits) {
    let trigger = bits.sensor_edge | bits.clipped | bits.rejected;
    image.mask.mapv_inplace(|m| {
        if m & trigger != 0 {
            m | bits.inexact_psf
        } else {
            m
        }
    });
}

/// Flag pixels whose variance is not finite and positive as NO_DATA.
pub fn set_coadd_edge_bits(image: &mut MaskedImage, no_data: u32) {
    Zip::from(&mut image.mask)
        .and(&image.variance)
        .for_each(|m, &var| {
            if !(var.is_finite() && var > 0.0) {
                *m |= no_data;
            }
        });
}

/// Interpolate the image and variance over NO_DATA pixels row by row.
///
/// Filled pixels gain `intrp`. Afterwards every variance that is not positive
/// becomes +∞. Returns the number of pixels filled.
pub fn interpolate_no_data(image: &mut MaskedImage, no_data: u32, intrp: u32) -> usize {
    let bad = image.mask.mapv(|m| m & no_data != 0);
    let filled = {
        let mut planes = [image.image.view_mut(), image.variance.view_mut()];
        interpolate_rows(&mut planes, &bad)
    };
    // Rows without a single good pixel are not filled.
    for (mut mask_row, bad_row) in image.mask.rows_mut().into_iter().zip(bad.rows()) {
        if bad_row.iter().any(|&b| !b) {
            Zip::from(&mut mask_row).and(&bad_row).for_each(|m, &b| {
                if b {
                    *m |= intrp;
                }
            });
        }
    }
    image.variance.mapv_inplace(|v| if v > 0.0 { v } else { f64::INFINITY });
    filled
}

/// Reads, masks and stacks the epochs of one tile.
struct TileAssembler<'a> {
    source: &'a dyn EpochSource,
    inputs: &'a PreparedInputs,
    registry: &'a MaskPlaneRegistry,
    overlays: Option<&'a [AltMaskOverlay]>,
    warp: WarpType,
    statistic: Statistic,
    ctrl: StatsControl,
    mask_map: Vec<(u32, u32)>,
    remove_mask: u32,
    clipped_bit: u32,
    use_psf_matched_polygons: bool,
    do_n_image: bool,
}

impl TileAssembler<'_> {
    fn assemble(&self, tile: &AABB) -> Result<(MaskedImage, Option<Array2<u16>>), CoaddError> {
        let mut n_image = self.do_n_image.then(|| Array2::<u16>::zeros(tile.shape()));
        let mut images = Vec::with_capacity(self.inputs.len());
        for (k, &index) in self.inputs.indices.iter().enumerate() {
            let mut image = self.source.read(index, tile, self.warp)?;
            if let Some(overlay) = self.overlays.and_then(|o| o.get(k)) {
                apply_alt_mask_planes(
                    &mut image,
                    overlay,
                    self.registry,
                    self.ctrl.and_mask,
                    self.use_psf_matched_polygons,
                )?;
            }
            if let Some(counts) = n_image.as_mut() {
                let and_mask = self.ctrl.and_mask;
                Zip::from(counts)
                    .and(&image.image)
                    .and(&image.mask)
                    .for_each(|n, &value, &mask| {
                        if value.is_finite() && mask & and_mask == 0 {
                            *n += 1;
                        }
                    });
            }
            image.clear_mask(self.remove_mask);
            images.push(image);
        }
        let stacked = statistics_stack(
            &images,
            self.statistic,
            &self.ctrl,
            &self.inputs.weights,
            self.clipped_bit,
            &self.mask_map,
        )?;
        Ok((stacked, n_image))
    }
}

/// Assemble a coadd of `bbox` from the prepared epochs.
///
/// `overlays`, when given, is indexed like `inputs`. Bad planes come from
/// `config`; strategies add CLIPPED there before calling this.
pub fn assemble_coadd(
    source: &dyn EpochSource,
    inputs: &PreparedInputs,
    bbox: &AABB,
    config: &AssembleCoaddConfig,
    registry: &MaskPlaneRegistry,
    overlays: Option<&[AltMaskOverlay]>,
    warp: WarpType,
) -> Result<CoaddResult, CoaddError> {
    config.validate()?;
    if inputs.is_empty() {
        return Err(CoaddError::NoInputs);
    }
    let tiles = sub_bbox_iter(bbox, config.subregion_size)?;
    let bits = CoaddBits::register(registry)?;
    let ctrl = config.stats_control(registry)?;
    let assembler = TileAssembler {
        source,
        inputs,
        registry,
        overlays,
        warp,
        statistic: config.statistic,
        mask_map: bits.mask_map(ctrl.and_mask),
        ctrl,
        remove_mask: config.remove_mask(registry)?,
        clipped_bit: bits.clipped,
        use_psf_matched_polygons: config.use_psf_matched_polygons,
        do_n_image: config.do_n_image,
    };

    info!(
        "Assembling {} coadd of {} from {} {warp} warps",
        config.statistic,
        bbox,
        inputs.len()
    );
    let mut coadd = MaskedImage::filled(*bbox, 0.0, f64::INFINITY, bits.no_data);
    let mut n_image = config.do_n_image.then(|| Array2::<u16>::zeros(bbox.shape()));
    for tile in tiles {
        debug!("Computing coadd over {tile}");
        match assembler.assemble(&tile) {
            Ok((stacked, counts)) => {
                coadd.assign(&stacked)?;
                if let (Some(total), Some(counts)) = (n_image.as_mut(), counts) {
                    let r0 = tile.min_row - bbox.min_row;
                    let c0 = tile.min_col - bbox.min_col;
                    total
                        .slice_mut(s![r0..r0 + tile.height(), c0..c0 + tile.width()])
                        .assign(&counts);
                }
            }
            Err(e) => error!("Error assembling coadd tile {tile}: {e}"),
        }
    }

    set_inexact_psf(&mut coadd, &bits);
    set_coadd_edge_bits(&mut coadd, bits.no_data);
    if config.do_interp {
        let filled = interpolate_no_data(&mut coadd, bits.no_data, bits.intrp);
        debug!("Interpolated {filled} NO_DATA pixels");
    }

    Ok(CoaddResult {
        image: coadd,
        n_image,
        metadata: CoaddMetadata::new(source, inputs),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::image_proc::Span;

    #[test]
    fn test_sub_bbox_iter_raster_order() {
        let bbox = AABB::from_origin_size(10, 20, 5, 7);
        let tiles: Vec<AABB> = sub_bbox_iter(&bbox, ImageSize::from_width_height(4, 3))
            .unwrap()
            .collect();
        assert_eq!(
            tiles,
            vec![
                AABB::from_origin_size(10, 20, 3, 4),
                AABB::from_origin_size(10, 24, 3, 3),
                AABB::from_origin_size(13, 20, 2, 4),
                AABB::from_origin_size(13, 24, 2, 3),
            ]
        );
        assert_eq!(tiles.iter().map(|t| t.area()).sum::<usize>(), bbox.area());
    }

    #[test]
    fn test_sub_bbox_iter_narrow_and_empty() {
        let narrow = AABB::from_origin_size(0, 0, 3, 2);
        let tiles: Vec<AABB> = sub_bbox_iter(&narrow, ImageSize::from_width_height(100, 100))
            .unwrap()
            .collect();
        assert_eq!(tiles, vec![narrow]);

        let empty = AABB::from_origin_size(0, 0, 0, 5);
        assert!(matches!(
            sub_bbox_iter(&empty, ImageSize::from_width_height(10, 10)),
            Err(CoaddError::EmptyRegion(_))
        ));
        assert!(matches!(
            sub_bbox_iter(&narrow, ImageSize::from_width_height(0, 10)),
            Err(CoaddError::Config(ConfigError::EmptySubregion(_)))
        ));
    }

    #[test]
    fn test_mask_map() {
        let registry = MaskPlaneRegistry::new();
        let bits = CoaddBits::register(&registry).unwrap();
        let bad = registry
            .plane_bitmask(&["NO_DATA", "BAD", "SAT", "EDGE", "CLIPPED"])
            .unwrap();
        let map = bits.mask_map(bad);
        let bad_sat = registry.plane_bitmask(&["BAD", "SAT"]).unwrap();
        assert_eq!(map[0], (bad_sat, bits.rejected));
        assert_eq!(map[1], (bits.edge, bits.sensor_edge));
        assert_eq!(map[2], (bits.clipped, bits.clipped));
    }

    #[test]
    fn test_apply_alt_mask_planes_with_polygons() {
        let registry = MaskPlaneRegistry::new();
        let bad = registry.plane_bitmask(&["NO_DATA", "BAD"]).unwrap();
        let bad_bit = registry.plane_bit("BAD").unwrap();
        let bbox = AABB::from_origin_size(0, 0, 2, 4);
        let mut image = MaskedImage::filled(bbox, 0.0, 1.0, bad_bit);

        let mut overlay = AltMaskOverlay::new();
        overlay.insert(
            "NO_DATA".to_string(),
            vec![SpanSet::from_spans(vec![Span::new(0, 0, 1)])],
        );
        overlay.insert(
            "CLIPPED".to_string(),
            vec![SpanSet::from_spans(vec![Span::new(1, 3, 9)])],
        );
        apply_alt_mask_planes(&mut image, &overlay, &registry, bad, true).unwrap();

        let no_data = registry.plane_bit("NO_DATA").unwrap();
        let clipped = registry.plane_bit("CLIPPED").unwrap();
        assert_eq!(image.mask[[0, 0]], no_data);
        assert_eq!(image.mask[[0, 2]], bad_bit);
        assert_eq!(image.mask[[1, 3]], bad_bit | clipped);
    }

    #[test]
    fn test_no_data_regions_keep_clipped() {
        let registry = MaskPlaneRegistry::new();
        let bad = registry.add_planes(&["NO_DATA", "BAD", "CLIPPED"]).unwrap();
        let bad_bit = registry.plane_bit("BAD").unwrap();
        let clipped = registry.plane_bit("CLIPPED").unwrap();
        let no_data = registry.plane_bit("NO_DATA").unwrap();
        let bbox = AABB::from_origin_size(0, 0, 1, 4);
        let mut image = MaskedImage::filled(bbox, 0.0, 1.0, bad_bit | clipped);

        let mut overlay = AltMaskOverlay::new();
        overlay.insert(
            "NO_DATA".to_string(),
            vec![SpanSet::from_spans(vec![Span::new(0, 0, 1)])],
        );
        apply_alt_mask_planes(&mut image, &overlay, &registry, bad, true).unwrap();

        assert_eq!(image.mask[[0, 1]], clipped | no_data);
        assert_eq!(image.mask[[0, 3]], bad_bit | clipped);
    }

    #[test]
    fn test_edge_bits_and_interpolation() {
        let registry = MaskPlaneRegistry::new();
        let bits = CoaddBits::register(&registry).unwrap();
        let bbox = AABB::from_origin_size(0, 0, 2, 5);
        let mut image = MaskedImage::filled(bbox, 0.0, 1.0, 0);
        for c in 0..5 {
            image.image[[0, c]] = c as f64;
        }
        image.variance[[0, 2]] = f64::INFINITY;
        image.variance[[1, 1]] = 0.0;
        image.variance.row_mut(1).fill(f64::NAN);

        set_coadd_edge_bits(&mut image, bits.no_data);
        assert_eq!(image.mask[[0, 2]], bits.no_data);
        assert_eq!(image.mask[[0, 1]], 0);

        image.image[[0, 2]] = 0.0;
        let filled = interpolate_no_data(&mut image, bits.no_data, bits.intrp);
        assert_eq!(filled, 1);
        assert_eq!(image.image[[0, 2]], 2.0);
        assert_eq!(image.variance[[0, 2]], 1.0);
        assert_eq!(image.mask[[0, 2]], bits.no_data | bits.intrp);
        // A row with no good pixel is left alone with infinite variance.
        assert_eq!(image.variance[[1, 1]], f64::INFINITY);
        assert_eq!(image.mask[[1, 1]] & bits.intrp, 0);
    }

    #[test]
    fn test_set_inexact_psf() {
        let registry = MaskPlaneRegistry::new();
        let bits = CoaddBits::register(&registry).unwrap();
        let mut image = MaskedImage::filled(AABB::from_origin_size(0, 0, 1, 2), 0.0, 1.0, 0);
        image.mask[[0, 1]] = bits.rejected;
        set_inexact_psf(&mut image, &bits);
        assert_eq!(image.mask[[0, 0]], 0);
        assert_eq!(image.mask[[0, 1]], bits.rejected | bits.inexact_psf);
    }
}
