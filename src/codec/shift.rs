//! Shift-to-depth calibration table.

use serde::{Deserialize, Serialize};

use super::depth::NO_DEPTH;

/// Device calibration constants used to build the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShiftToDepthConfig {
    /// Reference plane distance (mm)
    pub zero_plane_distance: u32,
    /// Reference plane pixel size (mm)
    pub zero_plane_pixel_size: f64,
    /// Emitter to CMOS distance (cm)
    pub emitter_dcmos_distance: f64,
    pub param_coeff: u32,
    pub const_shift: u32,
    pub pixel_size_factor: u32,
    pub shift_scale: u32,
    /// Number of shift values the device can produce
    pub max_shift: u32,
    pub min_depth: u32,
    pub max_depth: u32,
}

impl Default for ShiftToDepthConfig {
    fn default() -> Self {
        Self {
            zero_plane_distance: 120,
            zero_plane_pixel_size: 0.1042,
            emitter_dcmos_distance: 7.5,
            param_coeff: 4,
            const_shift: 200,
            pixel_size_factor: 1,
            shift_scale: 10,
            max_shift: 2048,
            min_depth: 0,
            max_depth: 10_000,
        }
    }
}

/// Lookup from raw shift to depth in millimetres.
#[derive(Debug, Clone)]
pub struct ShiftToDepth {
    table: Vec<u16>,
}

impl ShiftToDepth {
    pub fn new(config: &ShiftToDepthConfig) -> Self {
        let factor = config.pixel_size_factor.max(1);
        let coeff = config.param_coeff.max(1) as f64;
        let pixel_size = config.zero_plane_pixel_size * factor as f64;
        let plane_distance = config.zero_plane_distance as f64;
        let dcmos = config.emitter_dcmos_distance;
        let const_shift = (config.param_coeff * config.const_shift / factor) as f64;

        let mut table = vec![NO_DEPTH; config.max_shift as usize];
        for (shift, entry) in table.iter_mut().enumerate().skip(1) {
            let reference = (shift as f64 - const_shift) / coeff - 0.375;
            let metric = reference * pixel_size;
            let depth = config.shift_scale as f64
                * ((metric * plane_distance / (dcmos - metric)) + plane_distance);
            if depth > config.min_depth as f64 && depth < config.max_depth as f64 {
                *entry = depth as u16;
            }
        }
        Self { table }
    }

    /// Builds a table from explicit entries.
    pub fn from_table(table: Vec<u16>) -> Self {
        Self { table }
    }

    pub fn max_shift(&self) -> usize {
        self.table.len()
    }

    /// Depth for `shift`; shifts at or past the table end map to [`NO_DEPTH`].
    #[inline]
    pub fn depth(&self, shift: u16) -> u16 {
        self.table.get(shift as usize).copied().unwrap_or(NO_DEPTH)
    }

    /// Rewrites little-endian shift samples as depth samples.
    pub fn apply_in_place(&self, samples: &mut [u8]) {
        for sample in samples.chunks_exact_mut(2) {
            let shift = u16::from_le_bytes([sample[0], sample[1]]);
            sample.copy_from_slice(&self.depth(shift).to_le_bytes());
        }
    }
}

impl Default for ShiftToDepth {
    fn default() -> Self {
        Self::new(&ShiftToDepthConfig::default())
    }
}
