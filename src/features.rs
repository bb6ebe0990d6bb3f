use serde::{Deserialize, Serialize};

use crate::types::{BoundingBox, Point, Shape};

/// Trait for accessing pixel intensities from an image.
pub trait ImageAccess {
    /// Get the grayscale intensity at (x, y). Returns 0 for out-of-bounds pixels.
    /// Coordinates are in image space (not normalized).
    fn get_pixel(&self, x: i32, y: i32) -> u8;

    /// Image dimensions.
    fn width(&self) -> u32;
    fn height(&self) -> u32;
}

/// A simple grayscale image buffer implementing ImageAccess.
#[derive(Debug, Clone, PartialEq)]
pub struct GrayImage {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl GrayImage {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        debug_assert_eq!(data.len(), (width * height) as usize);
        Self {
            data,
            width,
            height,
        }
    }

    pub fn from_fn<F>(width: u32, height: u32, f: F) -> Self
    where
        F: Fn(u32, u32) -> u8,
    {
        let mut data = Vec::with_capacity((width * height) as usize);
        for y in 0..height {
            for x in 0..width {
                data.push(f(x, y));
            }
        }
        Self { data, width, height }
    }
}

impl From<image::GrayImage> for GrayImage {
    fn from(img: image::GrayImage) -> Self {
        let (width, height) = img.dimensions();
        Self::new(img.into_raw(), width, height)
    }
}

impl ImageAccess for GrayImage {
    fn get_pixel(&self, x: i32, y: i32) -> u8 {
        if x < 0 || y < 0 || x >= self.width as i32 || y >= self.height as i32 {
            return 0;
        }
        self.data[(y as u32 * self.width + x as u32) as usize]
    }

    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }
}

/// Sample a pixel with bilinear interpolation for sub-pixel accuracy.
#[inline]
fn sample_bilinear<I: ImageAccess>(image: &I, x: f32, y: f32) -> f32 {
    // Get integer coordinates of the four surrounding pixels
    let x0 = x.floor() as i32;
    let y0 = y.floor() as i32;
    let x1 = x0 + 1;
    let y1 = y0 + 1;

    // Compute fractional parts
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    let p00 = image.get_pixel(x0, y0) as f32;
    let p10 = image.get_pixel(x1, y0) as f32;
    let p01 = image.get_pixel(x0, y1) as f32;
    let p11 = image.get_pixel(x1, y1) as f32;

    let top = p00 * (1.0 - fx) + p10 * fx;
    let bottom = p01 * (1.0 - fx) + p11 * fx;
    top * (1.0 - fy) + bottom * fy
}

/// A 2D similarity transform `p -> [[a, -b], [b, a]] * p + t`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityTransform2D {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl SimilarityTransform2D {
    pub const IDENTITY: Self = Self {
        a: 1.0,
        b: 0.0,
        tx: 0.0,
        ty: 0.0,
    };

    /// Apply rotation and scale only.
    #[inline]
    pub fn apply_linear(&self, p: Point) -> Point {
        Point::new(self.a * p.x - self.b * p.y, self.b * p.x + self.a * p.y)
    }
}

/// Least-squares similarity transform mapping `from` onto `to`.
///
/// Both shapes must have the same number of points. When `from` has no
/// spread (a single point, or all points coincide) the linear part is the
/// identity and only the translation is estimated.
pub fn find_similarity_transform(from: &Shape, to: &Shape) -> SimilarityTransform2D {
    debug_assert_eq!(from.num_landmarks(), to.num_landmarks());
    let n = from.num_landmarks();
    if n == 0 {
        return SimilarityTransform2D::IDENTITY;
    }

    let inv_n = 1.0 / n as f32;
    let mut mean_from = Point::zero();
    let mut mean_to = Point::zero();
    for (f, t) in from.points.iter().zip(to.points.iter()) {
        mean_from += *f;
        mean_to += *t;
    }
    let mean_from = mean_from * inv_n;
    let mean_to = mean_to * inv_n;

    let mut dot = 0.0f32;
    let mut cross = 0.0f32;
    let mut norm = 0.0f32;
    for (f, t) in from.points.iter().zip(to.points.iter()) {
        let f = *f - mean_from;
        let t = *t - mean_to;
        dot += f.x * t.x + f.y * t.y;
        cross += f.x * t.y - f.y * t.x;
        norm += f.length_squared();
    }

    let (a, b) = if norm > f32::EPSILON {
        (dot / norm, cross / norm)
    } else {
        (1.0, 0.0)
    };

    let linear = SimilarityTransform2D {
        a,
        b,
        tx: 0.0,
        ty: 0.0,
    };
    let moved = linear.apply_linear(mean_from);
    SimilarityTransform2D {
        a,
        b,
        tx: mean_to.x - moved.x,
        ty: mean_to.y - moved.y,
    }
}

/// Shape-relative pixel locations used by one cascade stage.
///
/// Each entry is anchored to a landmark of the mean shape and stores the
/// offset from that landmark in normalized (bounding-box) coordinates. At
/// extraction time the offset is rotated and scaled along with the current
/// shape estimate, so the same entry tracks the same part of the object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeaturePool {
    pub anchor_idx: Vec<u32>,
    pub deltas: Vec<Point>,
}

impl FeaturePool {
    pub fn new(anchor_idx: Vec<u32>, deltas: Vec<Point>) -> Self {
        debug_assert_eq!(anchor_idx.len(), deltas.len());
        Self { anchor_idx, deltas }
    }

    /// Encode normalized pixel coordinates relative to their nearest landmark
    /// of `reference`.
    pub fn encode(reference: &Shape, pixel_coordinates: &[Point]) -> Self {
        let mut anchor_idx = Vec::with_capacity(pixel_coordinates.len());
        let mut deltas = Vec::with_capacity(pixel_coordinates.len());

        for p in pixel_coordinates {
            let (nearest, _) = reference.points.iter().enumerate().fold(
                (0usize, f32::INFINITY),
                |(best, best_dist), (i, landmark)| {
                    let dist = (*p - *landmark).length_squared();
                    if dist < best_dist {
                        (i, dist)
                    } else {
                        (best, best_dist)
                    }
                },
            );
            anchor_idx.push(nearest as u32);
            deltas.push(*p - reference[nearest]);
        }

        Self { anchor_idx, deltas }
    }

    pub fn len(&self) -> usize {
        self.anchor_idx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchor_idx.is_empty()
    }

    /// Image-space location of every pool entry for a shape estimate.
    ///
    /// `current` and `mean_shape` are normalized to `rect`.
    pub fn pixel_locations(
        &self,
        rect: &BoundingBox,
        current: &Shape,
        mean_shape: &Shape,
    ) -> Vec<Point> {
        let tform = find_similarity_transform(mean_shape, current);
        self.anchor_idx
            .iter()
            .zip(self.deltas.iter())
            .map(|(&anchor, delta)| {
                let p = current[anchor as usize] + tform.apply_linear(*delta);
                rect.denormalize_point(p)
            })
            .collect()
    }

    /// Sample the intensity of every pool entry for a shape estimate.
    pub fn extract<I: ImageAccess>(
        &self,
        image: &I,
        rect: &BoundingBox,
        current: &Shape,
        mean_shape: &Shape,
    ) -> Vec<f32> {
        self.pixel_locations(rect, current, mean_shape)
            .into_iter()
            .map(|p| sample_bilinear(image, p.x, p.y))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bilinear_interpolation() {
        // 2x2 image with known values
        let img = GrayImage::new(vec![0, 100, 200, 50], 2, 2);

        // At integer coordinates, should return exact pixel values
        assert!((sample_bilinear(&img, 0.0, 0.0) - 0.0).abs() < 0.01);
        assert!((sample_bilinear(&img, 1.0, 0.0) - 100.0).abs() < 0.01);
        assert!((sample_bilinear(&img, 0.0, 1.0) - 200.0).abs() < 0.01);
        assert!((sample_bilinear(&img, 1.0, 1.0) - 50.0).abs() < 0.01);

        // At center (0.5, 0.5), should be average of all four: (0+100+200+50)/4 = 87.5
        assert!((sample_bilinear(&img, 0.5, 0.5) - 87.5).abs() < 0.01);
    }

    #[test]
    fn gray_image_access() {
        let data = vec![
            0, 255, 0, //
            255, 0, 255, //
            0, 255, 0, //
        ];
        let img = GrayImage::new(data, 3, 3);

        assert_eq!(img.get_pixel(0, 0), 0);
        assert_eq!(img.get_pixel(1, 0), 255);
        assert_eq!(img.get_pixel(1, 1), 0);

        // Out of bounds returns 0
        assert_eq!(img.get_pixel(-1, 0), 0);
        assert_eq!(img.get_pixel(3, 0), 0);
    }

    #[test]
    fn converts_from_image_crate_buffer() {
        let buf = image::GrayImage::from_fn(4, 2, |x, y| image::Luma([(x + 10 * y) as u8]));
        let img = GrayImage::from(buf);
        assert_eq!(img.width(), 4);
        assert_eq!(img.height(), 2);
        assert_eq!(img.get_pixel(3, 1), 13);
    }

    #[test]
    fn similarity_transform_recovers_rotation_and_scale() {
        let from = Shape::new(vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(0.0, 1.0),
        ]);
        // Rotate by 90 degrees, scale by 2, translate by (5, -1)
        let to = Shape::new(
            from.points
                .iter()
                .map(|p| Point::new(-2.0 * p.y + 5.0, 2.0 * p.x - 1.0))
                .collect(),
        );

        let t = find_similarity_transform(&from, &to);
        assert!(t.a.abs() < 1e-5);
        assert!((t.b - 2.0).abs() < 1e-5);
        for (f, expected) in from.points.iter().zip(to.points.iter()) {
            let mapped = t.apply_linear(*f) + Point::new(t.tx, t.ty);
            assert!(mapped.distance(expected) < 1e-4);
        }
    }

    #[test]
    fn similarity_transform_of_single_point_is_translation() {
        let from = Shape::new(vec![Point::new(0.5, 0.5)]);
        let to = Shape::new(vec![Point::new(0.7, 0.4)]);
        let t = find_similarity_transform(&from, &to);
        assert_eq!(t.apply_linear(Point::new(1.0, 0.0)), Point::new(1.0, 0.0));
        let mapped = t.apply_linear(from[0]) + Point::new(t.tx, t.ty);
        assert!(mapped.distance(&to[0]) < 1e-6);
    }

    #[test]
    fn pool_encodes_against_nearest_landmark() {
        let mean = Shape::new(vec![Point::new(0.2, 0.5), Point::new(0.8, 0.5)]);
        let pool = FeaturePool::encode(&mean, &[Point::new(0.1, 0.5), Point::new(0.9, 0.6)]);
        assert_eq!(pool.anchor_idx, vec![0, 1]);
        assert!((pool.deltas[0].x + 0.1).abs() < 1e-6);
        assert!((pool.deltas[1].y - 0.1).abs() < 1e-6);
    }

    #[test]
    fn pool_extraction_follows_the_current_shape() {
        // Simple 10x10 gradient image
        let img = GrayImage::from_fn(10, 10, |x, _y| (x * 25) as u8);
        let rect = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let mean = Shape::new(vec![Point::new(0.2, 0.5), Point::new(0.7, 0.5)]);
        let pool = FeaturePool::encode(&mean, &[Point::new(0.2, 0.5), Point::new(0.7, 0.5)]);

        // pixel at x=2 is 50, pixel at x=7 is 175
        let values = pool.extract(&img, &rect, &mean, &mean);
        assert!((values[0] - 50.0).abs() < 0.01);
        assert!((values[1] - 175.0).abs() < 0.01);

        // Shift the estimate one pixel right; the samples move with it
        let shifted = Shape::new(vec![Point::new(0.3, 0.5), Point::new(0.8, 0.5)]);
        let values = pool.extract(&img, &rect, &shifted, &mean);
        assert!((values[0] - 75.0).abs() < 0.01);
        assert!((values[1] - 200.0).abs() < 0.01);
    }
}
