use serde::{Deserialize, Serialize};

/// A 2D point with floating-point coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub const fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub const fn zero() -> Self {
        Self { x: 0.0, y: 0.0 }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        (*self - *other).length()
    }

    pub fn length(&self) -> f32 {
        self.length_squared().sqrt()
    }

    pub fn length_squared(&self) -> f32 {
        self.x * self.x + self.y * self.y
    }
}

impl std::ops::Add for Point {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self {
            x: self.x + rhs.x,
            y: self.y + rhs.y,
        }
    }
}

impl std::ops::AddAssign for Point {
    fn add_assign(&mut self, rhs: Self) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl std::ops::Sub for Point {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self {
            x: self.x - rhs.x,
            y: self.y - rhs.y,
        }
    }
}

impl std::ops::Mul<f32> for Point {
    type Output = Self;

    fn mul(self, rhs: f32) -> Self::Output {
        Self {
            x: self.x * rhs,
            y: self.y * rhs,
        }
    }
}

/// A bounding box defined by top-left corner, width, and height.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub const fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Length of the box diagonal in pixels.
    pub fn diagonal(&self) -> f32 {
        Point::new(self.width, self.height).length()
    }

    /// Whether the box has a finite position and a strictly positive area.
    pub fn is_valid(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.width.is_finite()
            && self.height.is_finite()
            && self.width > 0.0
            && self.height > 0.0
    }

    /// The same box moved by `(dx, dy)` pixels.
    pub fn translated(&self, dx: f32, dy: f32) -> Self {
        Self::new(self.x + dx, self.y + dy, self.width, self.height)
    }

    /// Convert a point from normalized coordinates [0,1] to image coordinates
    /// within this bounding box.
    pub fn denormalize_point(&self, p: Point) -> Point {
        Point::new(self.x + p.x * self.width, self.y + p.y * self.height)
    }

    /// Convert a point from image coordinates to normalized [0,1] coordinates
    /// relative to this bounding box.
    pub fn normalize_point(&self, p: Point) -> Point {
        Point::new((p.x - self.x) / self.width, (p.y - self.y) / self.height)
    }

    pub fn denormalize_shape(&self, shape: &Shape) -> Shape {
        Shape::new(shape.points.iter().map(|p| self.denormalize_point(*p)).collect())
    }
}

/// An object shape represented as an ordered collection of landmark points.
///
/// Depending on context the points are either in image coordinates or
/// normalized to a bounding box; a shape never mixes the two.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shape {
    pub points: Vec<Point>,
}

impl Shape {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    pub fn num_landmarks(&self) -> usize {
        self.points.len()
    }

    /// Create a zeroed shape with n landmarks.
    pub fn zeros(n: usize) -> Self {
        Self {
            points: vec![Point::zero(); n],
        }
    }

    /// Add another shape's deltas to this shape.
    pub fn add_delta(&mut self, delta: &Shape) {
        debug_assert_eq!(self.points.len(), delta.points.len());
        for (p, d) in self.points.iter_mut().zip(delta.points.iter()) {
            *p += *d;
        }
    }

    /// Point-wise linear blend `alpha * self + (1 - alpha) * other`.
    pub fn blend(&self, other: &Shape, alpha: f32) -> Shape {
        debug_assert_eq!(self.points.len(), other.points.len());
        Shape::new(
            self.points
                .iter()
                .zip(other.points.iter())
                .map(|(a, b)| *a * alpha + *b * (1.0 - alpha))
                .collect(),
        )
    }

    /// Axis-aligned bounds `(min, max)` of the points, or `None` for an empty shape.
    pub fn bounds(&self) -> Option<(Point, Point)> {
        let first = *self.points.first()?;
        Some(self.points.iter().fold((first, first), |(lo, hi), p| {
            (
                Point::new(lo.x.min(p.x), lo.y.min(p.y)),
                Point::new(hi.x.max(p.x), hi.y.max(p.y)),
            )
        }))
    }

    pub fn is_finite(&self) -> bool {
        self.points.iter().all(|p| p.x.is_finite() && p.y.is_finite())
    }

    /// Flatten shape to a vector of [x0, y0, x1, y1, ...] coordinates.
    pub fn to_flat_vec(&self) -> Vec<f32> {
        let mut v = Vec::with_capacity(self.points.len() * 2);
        for p in &self.points {
            v.push(p.x);
            v.push(p.y);
        }
        v
    }

    /// Create shape from a flat vector of [x0, y0, x1, y1, ...] coordinates.
    pub fn from_flat_vec(v: &[f32]) -> Self {
        debug_assert!(v.len() % 2 == 0);
        let points: Vec<Point> = v
            .chunks_exact(2)
            .map(|chunk| Point::new(chunk[0], chunk[1]))
            .collect();
        Self { points }
    }
}

impl std::ops::Index<usize> for Shape {
    type Output = Point;

    fn index(&self, idx: usize) -> &Self::Output {
        &self.points[idx]
    }
}

impl std::ops::IndexMut<usize> for Shape {
    fn index_mut(&mut self, idx: usize) -> &mut Self::Output {
        &mut self.points[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_arithmetic() {
        let a = Point::new(1.0, 2.0);
        let b = Point::new(3.0, 4.0);

        let sum = a + b;
        assert_eq!(sum.x, 4.0);
        assert_eq!(sum.y, 6.0);

        let diff = b - a;
        assert_eq!(diff.x, 2.0);
        assert_eq!(diff.y, 2.0);

        let scaled = a * 2.0;
        assert_eq!(scaled.x, 2.0);
        assert_eq!(scaled.y, 4.0);

        assert!((Point::new(3.0, 4.0).length() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn bounding_box_normalization() {
        let bbox = BoundingBox::new(100.0, 100.0, 200.0, 200.0);

        // Center of bbox in normalized coords is (0.5, 0.5)
        let center_norm = Point::new(0.5, 0.5);
        let center_img = bbox.denormalize_point(center_norm);
        assert_eq!(center_img.x, 200.0);
        assert_eq!(center_img.y, 200.0);

        // And back
        let back = bbox.normalize_point(center_img);
        assert!((back.x - 0.5).abs() < 1e-6);
        assert!((back.y - 0.5).abs() < 1e-6);
    }

    #[test]
    fn bounding_box_validity() {
        assert!(BoundingBox::new(0.0, 0.0, 3.0, 4.0).is_valid());
        assert!(!BoundingBox::new(0.0, 0.0, 0.0, 4.0).is_valid());
        assert!(!BoundingBox::new(f32::NAN, 0.0, 1.0, 1.0).is_valid());
        assert!((BoundingBox::new(0.0, 0.0, 3.0, 4.0).diagonal() - 5.0).abs() < 1e-6);
    }

    #[test]
    fn shape_delta() {
        let mut shape = Shape::new(vec![Point::new(0.0, 0.0), Point::new(1.0, 1.0)]);
        let delta = Shape::new(vec![Point::new(0.1, 0.2), Point::new(0.3, 0.4)]);
        shape.add_delta(&delta);

        assert!((shape[0].x - 0.1).abs() < 1e-6);
        assert!((shape[0].y - 0.2).abs() < 1e-6);
        assert!((shape[1].x - 1.3).abs() < 1e-6);
        assert!((shape[1].y - 1.4).abs() < 1e-6);
    }

    #[test]
    fn shape_bounds_and_blend() {
        let a = Shape::new(vec![Point::new(0.0, 2.0), Point::new(4.0, -1.0)]);
        let (lo, hi) = a.bounds().unwrap();
        assert_eq!(lo, Point::new(0.0, -1.0));
        assert_eq!(hi, Point::new(4.0, 2.0));
        assert!(Shape::zeros(0).bounds().is_none());

        let b = Shape::zeros(2);
        let mid = a.blend(&b, 0.5);
        assert_eq!(mid[1], Point::new(2.0, -0.5));
    }
}
