//! Atmospheric refraction and the per-sub-band shifts it causes.
//!
//! Refractivity follows Owens (1967) as used by Stone (1996): separate dry-air
//! and water-vapour dispersion terms, each scaled by its density factor. The
//! refraction angle uses Stone's two-term expansion in `tan(z)`.

use crate::epoch::{VisitInfo, Weather};

const ARCSEC_PER_RADIAN: f64 = 206_264.806_247_096_36;
const KELVIN_OFFSET: f64 = 273.15;

/// Saturation vapour pressure over water in mbar at `temperature_k`.
fn saturation_vapor_pressure_mbar(temperature_k: f64) -> f64 {
    let t = temperature_k;
    let pascal =
        (1.237_884_7e-5 * t * t - 1.912_131_6e-2 * t + 33.937_110_47 - 6.343_164_5e3 / t).exp();
    pascal / 100.0
}

/// Partial pressure of water vapour in mbar.
fn water_vapor_pressure_mbar(weather: &Weather) -> f64 {
    if weather.humidity_pct <= 0.0 {
        return 0.0;
    }
    let t = weather.temperature_c + KELVIN_OFFSET;
    weather.humidity_pct.min(100.0) / 100.0 * saturation_vapor_pressure_mbar(t)
}

fn density_factor_dry(weather: &Weather) -> f64 {
    let t = weather.temperature_c + KELVIN_OFFSET;
    let p = weather.pressure_hpa - water_vapor_pressure_mbar(weather);
    (1.0 + p * (57.90e-8 - 9.325e-4 / t + 0.25844 / (t * t))) * p / t
}

fn density_factor_water(weather: &Weather) -> f64 {
    let t = weather.temperature_c + KELVIN_OFFSET;
    let p = water_vapor_pressure_mbar(weather);
    let eqn1 = -2.37321e-3 + 2.23366 / t - 710.792 / (t * t) + 7.75141e-4 / (t * t * t);
    let eqn2 = p * (1.0 + 3.7e-4 * p);
    (1.0 + eqn2 * eqn1) * p / t
}

/// Refractivity `n - 1` of moist air at `wavelength_nm`.
pub fn refractivity(wavelength_nm: f64, weather: &Weather) -> f64 {
    // Wave number in inverse microns.
    let sigma2 = (1.0e3 / wavelength_nm).powi(2);
    let dry = 2371.34 + 683_939.7 / (130.0 - sigma2) + 4547.3 / (38.9 - sigma2);
    let wet = 6487.31 + 58.058 * sigma2 - 0.71150 * sigma2.powi(2) + 0.08851 * sigma2.powi(3);
    (dry * density_factor_dry(weather) + wet * density_factor_water(weather)) * 1.0e-8
}

/// Refraction angle in arcseconds at `wavelength_nm` for a source at
/// `elevation_deg`.
pub fn refraction_arcsec(wavelength_nm: f64, elevation_deg: f64, weather: &Weather) -> f64 {
    let n = refractivity(wavelength_nm, weather);
    let beta = 4.5908e-6 * (weather.temperature_c + KELVIN_OFFSET);
    let tan_z = (90.0 - elevation_deg).to_radians().tan();
    let radians = n * (1.0 - beta) * tan_z + n * (beta - n / 2.0) * tan_z.powi(3);
    radians * ARCSEC_PER_RADIAN
}

/// Refraction at `wavelength_nm` relative to `reference_nm`, in arcseconds.
pub fn differential_refraction_arcsec(
    wavelength_nm: f64,
    reference_nm: f64,
    elevation_deg: f64,
    weather: &Weather,
) -> f64 {
    refraction_arcsec(wavelength_nm, elevation_deg, weather)
        - refraction_arcsec(reference_nm, elevation_deg, weather)
}

/// `(start, end)` wavelengths of `n` equal sub-bands spanning the filter.
pub fn subband_edges(lambda_eff: f64, filter_width: f64, n: usize) -> Vec<(f64, f64)> {
    let start = lambda_eff - filter_width / 2.0;
    let step = filter_width / n as f64;
    (0..n)
        .map(|k| (start + k as f64 * step, start + (k + 1) as f64 * step))
        .collect()
}

/// Shift of one sub-band image in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DcrShift {
    pub dx: f64,
    pub dy: f64,
}

impl DcrShift {
    pub fn inverse(&self) -> Self {
        Self {
            dx: -self.dx,
            dy: -self.dy,
        }
    }
}

/// Per-sub-band shifts for one visit.
///
/// Each sub-band moves by the mean differential refraction of its two edge
/// wavelengths, projected on the pixel grid by the parallactic plus rotator
/// angle.
pub fn dcr_shifts(
    visit: &VisitInfo,
    subbands: &[(f64, f64)],
    lambda_eff: f64,
    pixel_scale: f64,
) -> Vec<DcrShift> {
    let rotation = visit.rotation_rad();
    subbands
        .iter()
        .map(|&(start, end)| {
            let arcsec = 0.5
                * (differential_refraction_arcsec(start, lambda_eff, visit.elevation_deg, &visit.weather)
                    + differential_refraction_arcsec(end, lambda_eff, visit.elevation_deg, &visit.weather));
            let pixels = arcsec / pixel_scale;
            DcrShift {
                dx: pixels * rotation.sin(),
                dy: pixels * rotation.cos(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn standard_air() -> Weather {
        Weather {
            temperature_c: 15.0,
            pressure_hpa: 1013.25,
            humidity_pct: 0.0,
        }
    }

    #[test]
    fn test_refractivity_of_standard_air() {
        // Dry air at sea level is close to 2.78e-4 in the visible.
        let n = refractivity(550.0, &standard_air());
        assert!((2.7e-4..2.9e-4).contains(&n), "n - 1 = {n}");
        assert!(refractivity(400.0, &standard_air()) > refractivity(700.0, &standard_air()));
    }

    #[test]
    fn test_refraction_at_45_degrees() {
        let r = refraction_arcsec(550.0, 45.0, &standard_air());
        assert!((55.0..60.0).contains(&r), "refraction = {r}");
        assert_relative_eq!(refraction_arcsec(550.0, 90.0, &standard_air()), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_humidity_lowers_refractivity() {
        let dry = standard_air();
        let humid = Weather {
            humidity_pct: 80.0,
            ..dry
        };
        assert!(refractivity(500.0, &humid) < refractivity(500.0, &dry));
    }

    #[test]
    fn test_subband_edges() {
        let edges = subband_edges(500.0, 90.0, 3);
        assert_eq!(edges.len(), 3);
        assert_relative_eq!(edges[0].0, 455.0);
        assert_relative_eq!(edges[1].0, 485.0);
        assert_relative_eq!(edges[2].1, 545.0);
    }

    #[test]
    fn test_shifts_direction_and_order() {
        let visit = VisitInfo {
            elevation_deg: 50.0,
            parallactic_angle_deg: 90.0,
            rotator_angle_deg: 0.0,
            weather: Weather::default(),
        };
        let edges = subband_edges(478.0, 95.6, 3);
        let shifts = dcr_shifts(&visit, &edges, 478.0, 0.2);
        // Blue refracts more than the reference, red less.
        assert!(shifts[0].dx > 0.0);
        assert!(shifts[2].dx < 0.0);
        assert!(shifts[0].dx > shifts[1].dx);
        for shift in &shifts {
            assert!(shift.dy.abs() < 1e-12);
        }
    }

    #[test]
    fn test_no_shift_at_zenith() {
        let edges = subband_edges(478.0, 95.6, 3);
        for shift in dcr_shifts(&VisitInfo::zenith(), &edges, 478.0, 0.2) {
            assert_relative_eq!(shift.dx, 0.0, epsilon = 1e-12);
            assert_relative_eq!(shift.dy, 0.0, epsilon = 1e-12);
        }
    }
}
