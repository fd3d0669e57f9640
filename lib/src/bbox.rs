use glam::DVec3;

/// An axis aligned box, half-open on every axis.
///
/// A point is inside when `min <= c < max` holds on all three axes. Two boxes
/// sharing a face therefore never both claim a point lying on it: the point
/// belongs to the box whose `min` is the shared plane.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bounds {
    /// Inclusive lower corner.
    pub min: DVec3,
    /// Exclusive upper corner.
    pub max: DVec3,
}

impl Default for Bounds {
    /// Unconstrained on every axis.
    fn default() -> Self {
        Self {
            min: DVec3::NEG_INFINITY,
            max: DVec3::INFINITY,
        }
    }
}

impl Bounds {
    /// Constructor, from six scalar limits.
    #[must_use]
    pub const fn new(min_x: f64, max_x: f64, min_y: f64, max_y: f64, min_z: f64, max_z: f64) -> Self {
        Self {
            min: DVec3::new(min_x, min_y, min_z),
            max: DVec3::new(max_x, max_y, max_z),
        }
    }

    /// Constructor, from two corners.
    #[must_use]
    pub const fn from_corners(min: DVec3, max: DVec3) -> Self {
        Self { min, max }
    }

    /// Constrain the x axis.
    #[must_use]
    pub const fn with_x(mut self, min: f64, max: f64) -> Self {
        self.min.x = min;
        self.max.x = max;
        self
    }

    /// Constrain the y axis.
    #[must_use]
    pub const fn with_y(mut self, min: f64, max: f64) -> Self {
        self.min.y = min;
        self.max.y = max;
        self
    }

    /// Constrain the z axis.
    #[must_use]
    pub const fn with_z(mut self, min: f64, max: f64) -> Self {
        self.min.z = min;
        self.max.z = max;
        self
    }

    /// The inclusion predicate.
    ///
    /// NaN coordinates or bounds, and inverted bounds, never contain anything.
    #[must_use]
    pub fn contains(&self, p: DVec3) -> bool {
        p.cmpge(self.min).all() && p.cmplt(self.max).all()
    }

    /// The closed extent of `points`, `None` when empty.
    ///
    /// Being closed, the result does not contain its own maximum under
    /// [`Bounds::contains`].
    #[must_use]
    pub fn of_points(points: &[DVec3]) -> Option<Self> {
        extent(points).map(|(min, max)| Self::from_corners(min, max))
    }

    /// Edge lengths along each axis.
    #[must_use]
    pub fn size(&self) -> DVec3 {
        self.max - self.min
    }
}

/// Returns the inclusion mask of `points` against `bounds`.
#[must_use]
pub fn select(points: &[DVec3], bounds: &Bounds) -> Vec<bool> {
    points.iter().map(|p| bounds.contains(*p)).collect()
}

/// The closed extent `(min, max)` of a set of points, `None` when empty.
#[must_use]
pub fn extent(points: &[DVec3]) -> Option<(DVec3, DVec3)> {
    let first = *points.first()?;
    Some(
        points
            .iter()
            .fold((first, first), |(lower, upper), p| (lower.min(*p), upper.max(*p))),
    )
}
