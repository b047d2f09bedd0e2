use super::border::{reflect_off_borders, Border};
use crate::arena::ArenaGeometry;
use crate::body::BodyId;
use crate::registry::RegistryScan;
use log::debug;
use nalgebra::Vector2;

/// What happened when one candidate position was checked against one neighbour.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PairOutcome {
    /// Centers are at least two radii apart.
    Apart,
    /// Centers coincide; there is no usable normal, so the pair is skipped.
    Coincident,
    /// Overlapping but already moving apart.
    Separating,
    /// Impulse applied to both bodies; `normal` points from the neighbour to us.
    Resolved { normal: Vector2<f64> },
}

/// A resolved body-body contact, as seen from the body being ticked.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Contact {
    pub other: BodyId,
    pub normal: Vector2<f64>,
    pub other_velocity: Vector2<f64>,
}

/// Outcome of one tick's collision pass.
#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    pub position: Vector2<f64>,
    pub borders: Vec<Border>,
    pub contacts: Vec<Contact>,
}

/// Equal-mass impulse resolver.
///
/// Contacts with several neighbours in one tick are handled one after the
/// other in registry order, each seeing the velocity left by the previous
/// one. This is not a simultaneous-contact solver.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CollisionResolver {
    pub restitution: f64,
    pub clamp_energy: bool,
}

impl Default for CollisionResolver {
    fn default() -> Self {
        CollisionResolver {
            restitution: 1.0,
            clamp_energy: true,
        }
    }
}

impl CollisionResolver {
    pub fn new(restitution: f64, clamp_energy: bool) -> CollisionResolver {
        CollisionResolver {
            restitution,
            clamp_energy,
        }
    }

    /// Resolves `candidate` against one neighbour, mutating both velocities.
    pub fn resolve_pair(
        &self,
        candidate: &mut Vector2<f64>,
        velocity: &mut Vector2<f64>,
        other_position: &Vector2<f64>,
        other_velocity: &mut Vector2<f64>,
        radius: f64,
    ) -> PairOutcome {
        let contact_distance = 2. * radius;
        let offset = *candidate - other_position;
        let distance = offset.norm();
        if distance >= contact_distance {
            return PairOutcome::Apart;
        }
        if distance <= 0. {
            return PairOutcome::Coincident;
        }

        let normal = offset / distance;
        let velocity_along_normal = (*velocity - *other_velocity).dot(&normal);
        if velocity_along_normal > 0. {
            return PairOutcome::Separating;
        }

        let energy_before = velocity.norm_squared() + other_velocity.norm_squared();
        let impulse = -(1. + self.restitution) * velocity_along_normal / 2.;
        let mut new_velocity = *velocity + normal * impulse;
        let mut new_other_velocity = *other_velocity - normal * impulse;

        if self.clamp_energy {
            let energy_after = new_velocity.norm_squared() + new_other_velocity.norm_squared();
            if energy_after > energy_before {
                let scale = (energy_before / energy_after).sqrt();
                new_velocity *= scale;
                new_other_velocity *= scale;
            }
        }
        *velocity = new_velocity;
        *other_velocity = new_other_velocity;

        // Half the penetration; the neighbour corrects the other half on its own tick.
        *candidate += normal * ((contact_distance - distance) / 2.);
        PairOutcome::Resolved { normal }
    }

    /// Full tick pass: borders first, then every other member of `scan`.
    ///
    /// The final position is clamped into the arena so overlap pushes and
    /// arena shrinks cannot leave the body outside.
    pub fn resolve(
        &self,
        body: BodyId,
        mut candidate: Vector2<f64>,
        velocity: &mut Vector2<f64>,
        arena: &ArenaGeometry,
        scan: &RegistryScan<'_>,
    ) -> Resolution {
        let borders = reflect_off_borders(&mut candidate, velocity, arena);
        let mut contacts = Vec::new();

        scan.for_each_other(body, |other| {
            let mut other_motion = other.lock_motion();
            let other_position = other_motion.position;
            let outcome = self.resolve_pair(
                &mut candidate,
                velocity,
                &other_position,
                &mut other_motion.velocity,
                arena.radius,
            );
            match outcome {
                PairOutcome::Resolved { normal } => contacts.push(Contact {
                    other: other.id(),
                    normal,
                    other_velocity: other_motion.velocity,
                }),
                PairOutcome::Coincident => {
                    debug!("{} and {} share a center, skipping this tick", body, other.id())
                }
                PairOutcome::Apart | PairOutcome::Separating => {}
            }
        });

        Resolution {
            position: arena.clamp(candidate),
            borders,
            contacts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::{Rng, SeedableRng};
    use rand_pcg::Pcg64;

    #[test]
    fn head_on_collision_conserves_momentum() {
        let resolver = CollisionResolver::default();
        let mut candidate = Vector2::new(100., 100.);
        let mut v1 = Vector2::new(10., 0.);
        let other = Vector2::new(115., 100.);
        let mut v2 = Vector2::new(-10., 0.);

        let outcome = resolver.resolve_pair(&mut candidate, &mut v1, &other, &mut v2, 10.);
        assert_eq!(
            outcome,
            PairOutcome::Resolved {
                normal: Vector2::new(-1., 0.)
            }
        );
        assert_abs_diff_eq!(v1.x + v2.x, 0., epsilon = 1e-3);
        assert_abs_diff_eq!(v1.x, -10., epsilon = 1e-9);
        assert_abs_diff_eq!(v2.x, 10., epsilon = 1e-9);
    }

    #[test]
    fn overlap_is_corrected_by_half_the_penetration() {
        let resolver = CollisionResolver::default();
        let mut candidate = Vector2::new(0., 0.);
        let mut v1 = Vector2::new(1., 0.);
        let mut v2 = Vector2::zeros();
        resolver.resolve_pair(&mut candidate, &mut v1, &Vector2::new(10., 0.), &mut v2, 10.);
        assert_abs_diff_eq!(candidate.x, -5., epsilon = 1e-12);
        assert_abs_diff_eq!(candidate.y, 0., epsilon = 1e-12);
    }

    #[test]
    fn separating_pair_is_left_alone() {
        let resolver = CollisionResolver::default();
        let mut candidate = Vector2::new(0., 0.);
        let mut v1 = Vector2::new(-3., 0.);
        let mut v2 = Vector2::new(3., 0.);
        let outcome =
            resolver.resolve_pair(&mut candidate, &mut v1, &Vector2::new(12., 0.), &mut v2, 10.);
        assert_eq!(outcome, PairOutcome::Separating);
        assert_eq!(v1, Vector2::new(-3., 0.));
        assert_eq!(v2, Vector2::new(3., 0.));
        assert_eq!(candidate, Vector2::zeros());
    }

    #[test]
    fn coincident_centers_are_skipped() {
        let resolver = CollisionResolver::default();
        let mut candidate = Vector2::new(50., 50.);
        let mut v1 = Vector2::new(1., 1.);
        let mut v2 = Vector2::new(-1., -1.);
        let outcome =
            resolver.resolve_pair(&mut candidate, &mut v1, &Vector2::new(50., 50.), &mut v2, 10.);
        assert_eq!(outcome, PairOutcome::Coincident);
        assert_eq!(v1, Vector2::new(1., 1.));
    }

    #[test]
    fn distant_pair_is_apart() {
        let resolver = CollisionResolver::default();
        let mut candidate = Vector2::new(0., 0.);
        let mut v1 = Vector2::new(1., 0.);
        let mut v2 = Vector2::new(-1., 0.);
        let outcome =
            resolver.resolve_pair(&mut candidate, &mut v1, &Vector2::new(20., 0.), &mut v2, 10.);
        assert_eq!(outcome, PairOutcome::Apart);
    }

    #[test]
    fn energy_never_increases() {
        let mut rng = Pcg64::seed_from_u64(0xcafef00dd15ea5e5);
        for restitution in [1.0, 0.8, 0.0] {
            let resolver = CollisionResolver::new(restitution, true);
            for _ in 0..2000 {
                let angle = rng.gen_range(0.0..std::f64::consts::TAU);
                let distance = rng.gen_range(0.1..20.);
                let mut candidate = Vector2::new(200., 200.);
                let other = candidate + Vector2::new(angle.cos(), angle.sin()) * distance;
                let mut v1 = Vector2::new(rng.gen_range(-5.0..5.0), rng.gen_range(-5.0..5.0));
                let mut v2 = Vector2::new(rng.gen_range(-5.0..5.0), rng.gen_range(-5.0..5.0));
                let before = v1.norm_squared() + v2.norm_squared();
                let momentum_before = v1 + v2;

                let outcome = resolver.resolve_pair(&mut candidate, &mut v1, &other, &mut v2, 10.);
                let after = v1.norm_squared() + v2.norm_squared();
                assert!(after <= before + 1e-9 * before.max(1.), "{after} > {before}");
                if restitution == 1.0 {
                    if let PairOutcome::Resolved { .. } = outcome {
                        assert_abs_diff_eq!((v1 + v2 - momentum_before).norm(), 0., epsilon = 1e-6);
                    }
                }
            }
        }
    }

    #[test]
    fn inelastic_collision_loses_energy() {
        let resolver = CollisionResolver::new(0.5, true);
        let mut candidate = Vector2::new(0., 0.);
        let mut v1 = Vector2::new(4., 0.);
        let mut v2 = Vector2::new(-4., 0.);
        resolver.resolve_pair(&mut candidate, &mut v1, &Vector2::new(15., 0.), &mut v2, 10.);
        assert_abs_diff_eq!(v1.x, -2., epsilon = 1e-9);
        assert_abs_diff_eq!(v2.x, 2., epsilon = 1e-9);
    }
}
