//! Near-white probe for isolation results.
//!
//! A failed segmentation tends to come back as an almost solid white canvas.
//! Sampling a fixed number of pixels catches that without the model having to
//! report anything. This is statistical: a genuine photo on a white wall with a
//! very small subject can be rejected too.

use crate::types::Bitmap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

pub const DEFAULT_SAMPLE_COUNT: usize = 1000;
pub const DEFAULT_WHITE_THRESHOLD: u8 = 245;
pub const DEFAULT_MAX_WHITE_FRACTION: f32 = 0.95;
pub const DEFAULT_SEED: u64 = 0x1D_CA4D;

#[derive(Debug, Clone, Copy)]
pub struct QualityGate {
    /// A pixel is near-white when every channel is strictly above this.
    pub white_threshold: u8,
    /// Surfaces whose near-white fraction reaches this are rejected.
    pub max_white_fraction: f32,
    /// Seed for the sample coordinates; same seed, same verdict.
    pub seed: u64,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            white_threshold: DEFAULT_WHITE_THRESHOLD,
            max_white_fraction: DEFAULT_MAX_WHITE_FRACTION,
            seed: DEFAULT_SEED,
        }
    }
}

impl QualityGate {
    /// Fraction (0.0–1.0) of `sample_count` uniformly drawn pixels that are near-white.
    pub fn near_white_fraction(&self, bitmap: &Bitmap, sample_count: usize) -> f32 {
        if sample_count == 0 {
            return 0.0;
        }
        let img = bitmap.as_rgb();
        let (w, h) = img.dimensions();
        let mut rng = StdRng::seed_from_u64(self.seed);

        let white = (0..sample_count)
            .filter(|_| {
                let px = img.get_pixel(rng.gen_range(0..w), rng.gen_range(0..h));
                px.0.iter().all(|&c| c > self.white_threshold)
            })
            .count();

        white as f32 / sample_count as f32
    }

    /// Sample once and judge: the near-white fraction with its verdict.
    pub fn evaluate(&self, bitmap: &Bitmap, sample_count: usize) -> GateReport {
        if sample_count == 0 {
            return GateReport {
                near_white: 0.0,
                acceptable: true,
            };
        }
        let near_white = self.near_white_fraction(bitmap, sample_count);
        GateReport {
            near_white,
            acceptable: near_white < self.max_white_fraction,
        }
    }

    /// Whether `bitmap` looks like a usable isolation result.
    pub fn is_acceptable(&self, bitmap: &Bitmap, sample_count: usize) -> bool {
        self.evaluate(bitmap, sample_count).acceptable
    }
}

/// Outcome of one gate evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GateReport {
    pub near_white: f32,
    pub acceptable: bool,
}
