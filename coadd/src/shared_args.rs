use crate::config::{load_config, AssembleCoaddConfig, CompareWarpConfig, DcrConfig, SafeClipConfig};
use crate::error::ConfigError;
use crate::strategy::AssemblyMethod;
use clap::{Parser, ValueEnum};
use log::warn;
use shared::ImageSize;
use std::path::PathBuf;

/// Parse a size string in format "WIDTHxHEIGHT"
fn parse_image_size(s: &str) -> Result<ImageSize, String> {
    let size: ImageSize = s.parse()?;
    if size.is_empty() {
        return Err(format!("Size must be non-empty, got '{s}'"));
    }
    Ok(size)
}

/// Available coadd strategies for selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MethodArg {
    /// Plain statistic stacking
    Base,
    /// Clip outliers detected in one or two epochs of a mean/clipped-mean difference
    SafeClip,
    /// Mask transients found against a PSF-matched template - Default
    CompareWarp,
    /// Forward model of differential chromatic refraction sub-bands
    Dcr,
}

impl std::fmt::Display for MethodArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MethodArg::Base => write!(f, "base"),
            MethodArg::SafeClip => write!(f, "safe_clip"),
            MethodArg::CompareWarp => write!(f, "compare_warp"),
            MethodArg::Dcr => write!(f, "dcr"),
        }
    }
}

impl MethodArg {
    /// Default configuration of the selected strategy
    pub fn to_method(&self) -> AssemblyMethod {
        match self {
            MethodArg::Base => AssemblyMethod::Base(AssembleCoaddConfig::default()),
            MethodArg::SafeClip => AssemblyMethod::SafeClip(SafeClipConfig::default()),
            MethodArg::CompareWarp => AssemblyMethod::CompareWarp(CompareWarpConfig::default()),
            MethodArg::Dcr => AssemblyMethod::Dcr(DcrConfig::default()),
        }
    }
}

/// Common arguments shared across coadd binaries
#[derive(Parser, Debug, Clone)]
pub struct SharedCoaddArgs {
    /// Assembly strategy
    #[arg(long, value_enum, default_value_t = MethodArg::CompareWarp)]
    pub method: MethodArg,

    /// JSON configuration file; its "method" field overrides --method
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Tile size used while assembling (e.g., "64x64")
    #[arg(long, value_parser = parse_image_size)]
    pub tile: Option<ImageSize>,

    /// Enable debug output
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

impl SharedCoaddArgs {
    /// Resolve the strategy configuration from the command line.
    pub fn load_method(&self) -> Result<AssemblyMethod, ConfigError> {
        let mut method = match &self.config {
            Some(path) => {
                let method: AssemblyMethod = load_config(path)?;
                if method.name() != self.method.to_string() {
                    warn!(
                        "Configuration {} selects {}; ignoring --method {}",
                        path.display(),
                        method.name(),
                        self.method
                    );
                }
                method
            }
            None => self.method.to_method(),
        };
        if let Some(tile) = self.tile {
            set_tile_size(&mut method, tile);
        }
        method.validate()?;
        Ok(method)
    }
}

/// Override the tile size of every assembly stage of `method`.
pub fn set_tile_size(method: &mut AssemblyMethod, tile: ImageSize) {
    match method {
        AssemblyMethod::Base(config) => config.subregion_size = tile,
        AssemblyMethod::SafeClip(config) => config.assemble.subregion_size = tile,
        AssemblyMethod::CompareWarp(config) => {
            config.assemble.subregion_size = tile;
            config.template.subregion_size = tile;
        }
        AssemblyMethod::Dcr(config) => {
            config.compare_warp.assemble.subregion_size = tile;
            config.compare_warp.template.subregion_size = tile;
        }
    }
}
