use crate::error::{Error, Result};
use crate::sync;
use nalgebra::Vector2;
use std::sync::RwLock;

/// Fraction of the shorter arena side used as body radius (diameter is 5%).
pub const DEFAULT_RADIUS_RATIO: f64 = 0.025;

/// One consistent view of the arena: extents plus the radius every body uses.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ArenaGeometry {
    pub width: f64,
    pub height: f64,
    pub radius: f64,
}

impl ArenaGeometry {
    pub fn new(width: f64, height: f64, radius: f64) -> ArenaGeometry {
        ArenaGeometry {
            width,
            height,
            radius,
        }
    }

    pub fn with_ratio(width: f64, height: f64, radius_ratio: f64) -> ArenaGeometry {
        ArenaGeometry::new(width, height, width.min(height) * radius_ratio)
    }

    /// Centers closer than this overlap.
    pub fn collision_distance(&self) -> f64 {
        2. * self.radius
    }

    /// Whether a body centered at `position` lies fully inside, within `tolerance`.
    pub fn contains(&self, position: &Vector2<f64>, tolerance: f64) -> bool {
        position.x >= self.radius - tolerance
            && position.x <= self.width - self.radius + tolerance
            && position.y >= self.radius - tolerance
            && position.y <= self.height - self.radius + tolerance
    }

    /// Moves a center into `[radius, extent - radius]` on both axes.
    ///
    /// When the arena is narrower than a body the center goes to the middle.
    pub fn clamp(&self, position: Vector2<f64>) -> Vector2<f64> {
        Vector2::new(
            clamp_axis(position.x, self.radius, self.width),
            clamp_axis(position.y, self.radius, self.height),
        )
    }
}

fn clamp_axis(value: f64, radius: f64, extent: f64) -> f64 {
    let (low, high) = (radius, extent - radius);
    if low > high {
        extent / 2.
    } else {
        value.clamp(low, high)
    }
}

/// Shared, resizable arena configuration.
///
/// Writers replace the whole geometry under the write lock, so a tick always
/// reads width, height and radius from the same generation.
#[derive(Debug)]
pub struct Arena {
    geometry: RwLock<ArenaGeometry>,
    radius_ratio: f64,
}

impl Arena {
    pub fn new(width: f64, height: f64, radius_ratio: f64) -> Result<Arena> {
        validate_extent("arena width", width)?;
        validate_extent("arena height", height)?;
        if !radius_ratio.is_finite() || radius_ratio <= 0. || radius_ratio >= 0.5 {
            return Err(Error::InvalidArgument(format!(
                "radius ratio must be in (0, 0.5), got {radius_ratio}"
            )));
        }
        Ok(Arena {
            geometry: RwLock::new(ArenaGeometry::with_ratio(width, height, radius_ratio)),
            radius_ratio,
        })
    }

    pub fn square(size: f64, radius_ratio: f64) -> Result<Arena> {
        Arena::new(size, size, radius_ratio)
    }

    pub fn geometry(&self) -> ArenaGeometry {
        *sync::read(&self.geometry)
    }

    pub fn radius(&self) -> f64 {
        self.geometry().radius
    }

    pub fn radius_ratio(&self) -> f64 {
        self.radius_ratio
    }

    /// Resizes to a square arena and recomputes the shared radius.
    pub fn resize(&self, size: f64) -> Result<ArenaGeometry> {
        self.resize_to(size, size)
    }

    pub fn resize_to(&self, width: f64, height: f64) -> Result<ArenaGeometry> {
        validate_extent("arena width", width)?;
        validate_extent("arena height", height)?;
        let geometry = ArenaGeometry::with_ratio(width, height, self.radius_ratio);
        *sync::write(&self.geometry) = geometry;
        Ok(geometry)
    }
}

fn validate_extent(name: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0. {
        return Err(Error::InvalidArgument(format!(
            "{name} must be a positive finite number, got {value}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn radius_follows_arena_size() {
        let arena = Arena::square(400., DEFAULT_RADIUS_RATIO).unwrap();
        assert_abs_diff_eq!(arena.radius(), 10.);
        arena.resize(800.).unwrap();
        let geometry = arena.geometry();
        assert_abs_diff_eq!(geometry.width, 800.);
        assert_abs_diff_eq!(geometry.height, 800.);
        assert_abs_diff_eq!(geometry.radius, 20.);
        assert_abs_diff_eq!(geometry.collision_distance(), 40.);
    }

    #[test]
    fn rectangular_arena_uses_shorter_side() {
        let arena = Arena::new(400., 420., DEFAULT_RADIUS_RATIO).unwrap();
        assert_abs_diff_eq!(arena.radius(), 10.);
    }

    #[test]
    fn rejects_bad_sizes() {
        assert!(Arena::square(0., DEFAULT_RADIUS_RATIO).is_err());
        assert!(Arena::square(f64::NAN, DEFAULT_RADIUS_RATIO).is_err());
        assert!(Arena::square(400., 0.7).is_err());
        let arena = Arena::square(400., DEFAULT_RADIUS_RATIO).unwrap();
        assert!(arena.resize(-1.).is_err());
        // A rejected resize leaves the old geometry in place.
        assert_abs_diff_eq!(arena.geometry().width, 400.);
    }

    #[test]
    fn clamp_keeps_body_inside() {
        let geometry = ArenaGeometry::new(400., 400., 20.);
        let clamped = geometry.clamp(Vector2::new(-5., 410.));
        assert_eq!(clamped, Vector2::new(20., 380.));
        assert!(geometry.contains(&clamped, 0.));
        assert!(!geometry.contains(&Vector2::new(19., 200.), 1e-9));
    }

    #[test]
    fn concurrent_resize_is_never_torn() {
        let arena = std::sync::Arc::new(Arena::square(400., DEFAULT_RADIUS_RATIO).unwrap());
        let writer = {
            let arena = arena.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    arena.resize(if i % 2 == 0 { 200. } else { 600. }).unwrap();
                }
            })
        };
        for _ in 0..500 {
            let g = arena.geometry();
            assert_abs_diff_eq!(g.width, g.height);
            assert_abs_diff_eq!(g.radius, g.width * DEFAULT_RADIUS_RATIO);
        }
        writer.join().unwrap();
    }
}
