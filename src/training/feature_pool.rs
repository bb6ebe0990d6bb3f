//! Feature pool sampling and split candidate generation.

use crate::rng::SeededRng;
use crate::tree::SplitFeature;
use crate::types::{Point, Shape};

use super::options::{PaddingMode, TrainingOptions};
use super::split::SplitCandidate;

/// Draw `feature_pool_size` pixel coordinates, normalized to the bounding box.
///
/// Coordinates are uniform over the sampling region chosen by the padding
/// mode, grown by `feature_pool_region_padding` on every side.
pub(crate) fn sample_pixel_coordinates(
    mean_shape: &Shape,
    options: &TrainingOptions,
    rng: &mut SeededRng,
) -> Vec<Point> {
    let padding = options.feature_pool_region_padding as f32;
    let (lo, hi) = match options.padding_mode {
        PaddingMode::LandmarkRelative => mean_shape
            .bounds()
            .unwrap_or((Point::zero(), Point::new(1.0, 1.0))),
        PaddingMode::BoundingBoxRelative => (Point::zero(), Point::new(1.0, 1.0)),
    };
    let lo = Point::new(lo.x - padding, lo.y - padding);
    let hi = Point::new(hi.x + padding, hi.y + padding);

    (0..options.feature_pool_size)
        .map(|_| {
            let x = rng.uniform_range(f64::from(lo.x), f64::from(hi.x)) as f32;
            let y = rng.uniform_range(f64::from(lo.y), f64::from(hi.y)) as f32;
            Point::new(x, y)
        })
        .collect()
}

/// Upper bound on rejected pixel pairs per split test. With a tiny `lambda`
/// the acceptance probability underflows to zero for every distinct pair.
const MAX_PAIR_DRAWS: usize = 1000;

/// Generate one random split test.
///
/// Two distinct pool entries are drawn and kept with probability
/// `exp(-distance / lambda)`, so nearby pixel pairs dominate. After
/// `MAX_PAIR_DRAWS` rejections the last drawn pair is used. The threshold is
/// uniform in `[-64, 64)` intensity levels.
pub(crate) fn generate_split(
    rng: &mut SeededRng,
    pixel_coordinates: &[Point],
    lambda: f64,
) -> SplitCandidate {
    let n = pixel_coordinates.len();
    debug_assert!(n >= 2);

    let mut feature = SplitFeature { idx1: 0, idx2: 1 };
    for _ in 0..MAX_PAIR_DRAWS {
        let idx1 = rng.index(n);
        let mut idx2 = rng.index(n);
        while idx2 == idx1 {
            idx2 = rng.index(n);
        }
        feature = SplitFeature {
            idx1: idx1 as u32,
            idx2: idx2 as u32,
        };
        let dist = f64::from(pixel_coordinates[idx1].distance(&pixel_coordinates[idx2]));
        let accept_prob = (-dist / lambda).exp();
        if accept_prob >= rng.uniform() {
            break;
        }
    }

    let threshold = ((rng.uniform() * 256.0 - 128.0) / 2.0) as f32;
    SplitCandidate { feature, threshold }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mean() -> Shape {
        Shape::new(vec![Point::new(0.3, 0.4), Point::new(0.7, 0.6)])
    }

    #[test]
    fn landmark_relative_pool_stays_in_padded_hull() {
        let options = TrainingOptions {
            feature_pool_size: 500,
            feature_pool_region_padding: 0.1,
            ..Default::default()
        };
        let mut rng = SeededRng::from_seed_str("pool");
        let coords = sample_pixel_coordinates(&mean(), &options, &mut rng);

        assert_eq!(coords.len(), 500);
        for p in &coords {
            assert!(p.x >= 0.2 - 1e-6 && p.x <= 0.8 + 1e-6);
            assert!(p.y >= 0.3 - 1e-6 && p.y <= 0.7 + 1e-6);
        }
    }

    #[test]
    fn box_relative_pool_covers_unit_square() {
        let options = TrainingOptions {
            feature_pool_size: 500,
            padding_mode: PaddingMode::BoundingBoxRelative,
            ..Default::default()
        };
        let mut rng = SeededRng::from_seed_str("pool");
        let coords = sample_pixel_coordinates(&mean(), &options, &mut rng);

        assert!(coords.iter().all(|p| (0.0..=1.0).contains(&p.x) && (0.0..=1.0).contains(&p.y)));
        // The landmark hull is [0.3, 0.7]; a box-relative pool reaches outside it
        assert!(coords.iter().any(|p| p.x < 0.3 || p.x > 0.7));
    }

    #[test]
    fn pool_sampling_is_deterministic() {
        let options = TrainingOptions {
            feature_pool_size: 50,
            ..Default::default()
        };
        let a = sample_pixel_coordinates(&mean(), &options, &mut SeededRng::from_seed_str("x"));
        let b = sample_pixel_coordinates(&mean(), &options, &mut SeededRng::from_seed_str("x"));
        assert_eq!(a, b);
    }

    #[test]
    fn splits_use_distinct_indices_and_bounded_thresholds() {
        let coords: Vec<Point> = (0..20)
            .map(|i| Point::new(i as f32 * 0.05, 0.5))
            .collect();
        let mut rng = SeededRng::from_seed_str("splits");
        for _ in 0..200 {
            let split = generate_split(&mut rng, &coords, 0.1);
            assert_ne!(split.feature.idx1, split.feature.idx2);
            assert!((split.feature.idx1 as usize) < coords.len());
            assert!((split.feature.idx2 as usize) < coords.len());
            assert!(split.threshold >= -64.0 && split.threshold < 64.0);
        }
    }

    #[test]
    fn small_lambda_prefers_close_pairs() {
        let coords: Vec<Point> = (0..20)
            .map(|i| Point::new(i as f32 * 0.05, 0.5))
            .collect();
        let mean_distance = |lambda: f64| {
            let mut rng = SeededRng::from_seed_str("lambda");
            let total: f32 = (0..400)
                .map(|_| {
                    let s = generate_split(&mut rng, &coords, lambda);
                    coords[s.feature.idx1 as usize].distance(&coords[s.feature.idx2 as usize])
                })
                .sum();
            total / 400.0
        };
        assert!(mean_distance(0.05) < mean_distance(10.0));
    }

    #[test]
    fn vanishing_lambda_still_produces_splits() {
        let coords: Vec<Point> = (0..50)
            .map(|i| Point::new(i as f32 * 0.02, 0.5))
            .collect();
        let mut rng = SeededRng::from_seed_str("tiny-lambda");
        for _ in 0..20 {
            let split = generate_split(&mut rng, &coords, 1e-9);
            assert_ne!(split.feature.idx1, split.feature.idx2);
            assert!((split.feature.idx1 as usize) < coords.len());
            assert!((split.feature.idx2 as usize) < coords.len());
        }
    }
}
