//! Sample store: the training examples and their evolving shape estimates.

use crate::dataset::ObjectDetection;
use crate::error::{Error, Result};
use crate::rng::SeededRng;
use crate::types::{BoundingBox, Point, Shape};

use super::options::TrainingOptions;

/// One (possibly oversampled) training example.
///
/// All shapes are normalized to `rect`. `target_shape` and `present` are
/// fixed at construction; `current_shape` and `feature_pixel_values` are
/// rewritten by the trainer, one writer per sample.
#[derive(Debug, Clone)]
pub(crate) struct TrainingSample {
    pub image_idx: usize,
    pub rect: BoundingBox,
    pub target_shape: Shape,
    pub present: Vec<bool>,
    pub current_shape: Shape,
    pub feature_pixel_values: Vec<f32>,
}

impl TrainingSample {
    /// Residual `target - current` of landmark `k`, zero when it is missing.
    #[inline]
    pub fn residual(&self, k: usize) -> Point {
        if self.present[k] {
            self.target_shape[k] - self.current_shape[k]
        } else {
            Point::zero()
        }
    }

    /// Sum of residual lengths over present landmarks, and their count.
    pub fn residual_distance(&self) -> (f64, usize) {
        (0..self.present.len())
            .filter(|&k| self.present[k])
            .fold((0.0, 0), |(sum, n), k| {
                (sum + f64::from(self.residual(k).length()), n + 1)
            })
    }
}

/// A ground-truth object before oversampling.
struct BaseObject {
    image_idx: usize,
    rect: BoundingBox,
    target: Shape,
    present: Vec<bool>,
}

impl BaseObject {
    /// Target with missing landmarks filled in from `mean`.
    fn filled_target(&self, mean: &Shape) -> Shape {
        Shape::new(
            self.target
                .points
                .iter()
                .zip(self.present.iter())
                .zip(mean.points.iter())
                .map(|((t, &present), m)| if present { *t } else { *m })
                .collect(),
        )
    }
}

fn collect_base_objects(objects: &[Vec<ObjectDetection>]) -> Result<(Vec<BaseObject>, usize)> {
    let mut num_landmarks: Option<usize> = None;
    let mut base = Vec::new();

    for (image_idx, image_objects) in objects.iter().enumerate() {
        for (object_idx, object) in image_objects.iter().enumerate() {
            if !object.rect.is_valid() {
                return Err(Error::Dataset(format!(
                    "image {} object {}: invalid bounding box {:?}",
                    image_idx, object_idx, object.rect
                )));
            }
            let n = *num_landmarks.get_or_insert(object.parts.len());
            if object.parts.len() != n {
                return Err(Error::Dataset(format!(
                    "image {} object {}: has {} landmarks, expected {}",
                    image_idx,
                    object_idx,
                    object.parts.len(),
                    n
                )));
            }

            let mut present = Vec::with_capacity(n);
            let mut points = Vec::with_capacity(n);
            for part in &object.parts {
                match part {
                    Some(p) if p.x.is_finite() && p.y.is_finite() => {
                        present.push(true);
                        points.push(object.rect.normalize_point(*p));
                    }
                    _ => {
                        present.push(false);
                        points.push(Point::zero());
                    }
                }
            }

            base.push(BaseObject {
                image_idx,
                rect: object.rect,
                target: Shape::new(points),
                present,
            });
        }
    }

    match num_landmarks {
        None => Err(Error::Dataset("dataset contains no objects".into())),
        Some(0) => Err(Error::Dataset("objects have no landmarks".into())),
        Some(n) => Ok((base, n)),
    }
}

fn compute_mean_shape(base: &[BaseObject], num_landmarks: usize) -> Result<Shape> {
    let mut sums = vec![Point::zero(); num_landmarks];
    let mut counts = vec![0usize; num_landmarks];

    for object in base {
        for k in 0..num_landmarks {
            if object.present[k] {
                sums[k] += object.target[k];
                counts[k] += 1;
            }
        }
    }

    if let Some(k) = counts.iter().position(|&c| c == 0) {
        return Err(Error::Dataset(format!(
            "landmark {} is missing from every object",
            k
        )));
    }

    Ok(Shape::new(
        sums.into_iter()
            .zip(counts)
            .map(|(s, c)| s * (1.0 / c as f32))
            .collect(),
    ))
}

/// Build the mean shape and the oversampled training set.
///
/// Copy 0 of every object starts at the mean shape. Further copies either
/// jitter the box (when `oversampling_translation_jitter > 0`) or start from
/// a random blend of two ground-truth shapes.
pub(crate) fn build_samples(
    objects: &[Vec<ObjectDetection>],
    options: &TrainingOptions,
    rng: &mut SeededRng,
) -> Result<(Shape, Vec<TrainingSample>)> {
    let (base, num_landmarks) = collect_base_objects(objects)?;
    let mean_shape = compute_mean_shape(&base, num_landmarks)?;

    let jitter = options.oversampling_translation_jitter;
    let copies = options.oversampling_amount as usize;
    let mut samples = Vec::with_capacity(base.len() * copies);

    for object in &base {
        for itr in 0..copies {
            let mut sample = TrainingSample {
                image_idx: object.image_idx,
                rect: object.rect,
                target_shape: object.target.clone(),
                present: object.present.clone(),
                current_shape: mean_shape.clone(),
                feature_pixel_values: Vec::new(),
            };

            if itr > 0 {
                if jitter > 0.0 {
                    let dx = rng.uniform_range(-jitter, jitter) as f32 * object.rect.width;
                    let dy = rng.uniform_range(-jitter, jitter) as f32 * object.rect.height;
                    let rect = object.rect.translated(dx, dy);
                    for (t, &present) in sample.target_shape.points.iter_mut().zip(&object.present) {
                        if present {
                            *t = rect.normalize_point(object.rect.denormalize_point(*t));
                        }
                    }
                    sample.rect = rect;
                } else {
                    let a = &base[rng.index(base.len())];
                    let b = &base[rng.index(base.len())];
                    let alpha = rng.uniform() as f32;
                    sample.current_shape = a
                        .filled_target(&mean_shape)
                        .blend(&b.filled_target(&mean_shape), alpha);
                }
            }

            samples.push(sample);
        }
    }

    Ok((mean_shape, samples))
}

/// Mean distance between current and target over all present landmarks,
/// in normalized box units.
pub(crate) fn mean_training_error(samples: &[TrainingSample]) -> f64 {
    let (sum, n) = samples
        .iter()
        .map(TrainingSample::residual_distance)
        .fold((0.0, 0), |(s, n), (ds, dn)| (s + ds, n + dn));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(rect: BoundingBox, parts: &[Option<(f32, f32)>]) -> ObjectDetection {
        ObjectDetection::new(
            rect,
            parts.iter().map(|p| p.map(|(x, y)| Point::new(x, y))).collect(),
        )
    }

    fn options(copies: u32, jitter: f64) -> TrainingOptions {
        TrainingOptions {
            oversampling_amount: copies,
            oversampling_translation_jitter: jitter,
            ..Default::default()
        }
    }

    #[test]
    fn mean_shape_ignores_missing_landmarks() {
        let rect = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let objects = vec![
            vec![object(rect, &[Some((2.0, 2.0)), Some((8.0, 8.0))])],
            vec![object(rect, &[Some((4.0, 4.0)), None])],
        ];
        let mut rng = SeededRng::from_seed_str("");
        let (mean, samples) = build_samples(&objects, &options(1, 0.0), &mut rng).unwrap();

        assert!((mean[0].x - 0.3).abs() < 1e-6);
        assert!((mean[1].x - 0.8).abs() < 1e-6);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[1].present, vec![true, false]);
        assert_eq!(samples[1].residual(1), Point::zero());
        assert!(samples.iter().all(|s| s.current_shape == mean));
    }

    #[test]
    fn oversampling_multiplies_samples() {
        let rect = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let objects = vec![
            vec![object(rect, &[Some((2.0, 2.0))]), object(rect, &[Some((3.0, 3.0))])],
            vec![object(rect, &[Some((4.0, 4.0))])],
        ];
        let mut rng = SeededRng::from_seed_str("");
        let (mean, samples) = build_samples(&objects, &options(5, 0.0), &mut rng).unwrap();

        assert_eq!(samples.len(), 15);
        assert_eq!(samples[0].current_shape, mean);
        assert_eq!(samples[5].current_shape, mean);
        // Blended starts stay inside the hull of the targets
        for s in &samples {
            assert!(s.current_shape[0].x >= 0.2 - 1e-6 && s.current_shape[0].x <= 0.4 + 1e-6);
        }
    }

    #[test]
    fn jitter_moves_box_and_keeps_target_in_place() {
        let rect = BoundingBox::new(10.0, 10.0, 20.0, 20.0);
        let objects = vec![vec![object(rect, &[Some((15.0, 25.0)), Some((25.0, 15.0))])]];
        let mut rng = SeededRng::from_seed_str("jitter");
        let (mean, samples) = build_samples(&objects, &options(4, 0.1), &mut rng).unwrap();

        for s in &samples[1..] {
            assert_eq!(s.current_shape, mean);
            assert!((s.rect.x - rect.x).abs() <= 2.0 + 1e-4);
            assert!((s.rect.y - rect.y).abs() <= 2.0 + 1e-4);
            // Ground truth is the same image point in the new frame
            let p = s.rect.denormalize_point(s.target_shape[0]);
            assert!(p.distance(&Point::new(15.0, 25.0)) < 1e-3);
        }
    }

    #[test]
    fn rejects_inconsistent_and_empty_datasets() {
        let rect = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let mut rng = SeededRng::from_seed_str("");

        let empty: Vec<Vec<ObjectDetection>> = vec![vec![], vec![]];
        assert!(matches!(
            build_samples(&empty, &options(1, 0.0), &mut rng),
            Err(Error::Dataset(_))
        ));

        let mismatched = vec![vec![
            object(rect, &[Some((1.0, 1.0))]),
            object(rect, &[Some((1.0, 1.0)), Some((2.0, 2.0))]),
        ]];
        assert!(matches!(
            build_samples(&mismatched, &options(1, 0.0), &mut rng),
            Err(Error::Dataset(_))
        ));

        let never_seen = vec![vec![object(rect, &[Some((1.0, 1.0)), None])]];
        assert!(matches!(
            build_samples(&never_seen, &options(1, 0.0), &mut rng),
            Err(Error::Dataset(_))
        ));

        let bad_box = vec![vec![object(BoundingBox::new(0.0, 0.0, 0.0, 5.0), &[Some((1.0, 1.0))])]];
        assert!(matches!(
            build_samples(&bad_box, &options(1, 0.0), &mut rng),
            Err(Error::Dataset(_))
        ));
    }

    #[test]
    fn training_error_averages_present_landmarks() {
        let rect = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let objects = vec![
            vec![object(rect, &[Some((2.0, 5.0))])],
            vec![object(rect, &[Some((4.0, 5.0))])],
        ];
        let mut rng = SeededRng::from_seed_str("");
        let (_, samples) = build_samples(&objects, &options(1, 0.0), &mut rng).unwrap();
        // Mean at x=0.3, both samples 0.1 away
        assert!((mean_training_error(&samples) - 0.1).abs() < 1e-6);
    }
}
