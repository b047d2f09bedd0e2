use super::EPSILON;
use crate::arena::ArenaGeometry;
use crate::event_log::EventKind;
use nalgebra::Vector2;

/// One side of the arena. Screen coordinates: `y` grows towards `Bottom`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Border {
    Left,
    Right,
    Top,
    Bottom,
}

impl Border {
    /// Unit normal pointing into the arena.
    pub fn normal(&self) -> Vector2<f64> {
        match self {
            Border::Left => Vector2::new(1., 0.),
            Border::Right => Vector2::new(-1., 0.),
            Border::Top => Vector2::new(0., 1.),
            Border::Bottom => Vector2::new(0., -1.),
        }
    }

    pub fn event_kind(&self) -> EventKind {
        match self {
            Border::Left => EventKind::LeftBorderCollision,
            Border::Right => EventKind::RightBorderCollision,
            Border::Top => EventKind::TopBorderCollision,
            Border::Bottom => EventKind::BottomBorderCollision,
        }
    }
}

/// Clamps `candidate` to the arena and flips the matching velocity component.
///
/// An axis is only reflected while the velocity still points out of the
/// arena, so a body that was already turned around is left alone instead of
/// being flipped back into the wall on the next tick.
pub fn reflect_off_borders(
    candidate: &mut Vector2<f64>,
    velocity: &mut Vector2<f64>,
    arena: &ArenaGeometry,
) -> Vec<Border> {
    let mut hits = Vec::new();
    let radius = arena.radius;

    if candidate.x - radius < EPSILON && velocity.x < 0. {
        candidate.x = radius;
        velocity.x = -velocity.x;
        hits.push(Border::Left);
    } else if candidate.x + radius > arena.width - EPSILON && velocity.x > 0. {
        candidate.x = arena.width - radius;
        velocity.x = -velocity.x;
        hits.push(Border::Right);
    }

    if candidate.y - radius < EPSILON && velocity.y < 0. {
        candidate.y = radius;
        velocity.y = -velocity.y;
        hits.push(Border::Top);
    } else if candidate.y + radius > arena.height - EPSILON && velocity.y > 0. {
        candidate.y = arena.height - radius;
        velocity.y = -velocity.y;
        hits.push(Border::Bottom);
    }
    hits
}
