//! # Spatial Consensus Scoring
//!
//! A triad's score is a reputation heuristic computed from its neighbors in
//! the cube. It is not a vote and gives no safety guarantee: anyone able to
//! place many friendly triads nearby can raise a score.
//!
//! ```text
//! connections = { t : 0 < d(target, t) <= complexity }
//! per-connection = max(0, 1 - d / complexity) * (1.0 if t validated else 0.5)
//! score = min(1, mean(per-connection) + bonus)     bonus = 0.1 registered, 0.05 otherwise
//! score = 0 when there are no connections
//! ```
//!
//! Connections are recomputed from positions on every call. Nothing about the
//! neighbor graph is cached, so triads added between two validation attempts
//! are always taken into account.

use crate::config::{
    REGISTERED_VALIDATOR_BONUS, UNREGISTERED_VALIDATOR_BONUS, UNVALIDATED_NEIGHBOR_WEIGHT,
};
use crate::matrix::triad::Triad;

/// A neighbor within range of the triad being scored.
#[derive(Debug, Clone, Copy)]
pub struct Connection<'a> {
    pub triad: &'a Triad,
    pub distance: f64,
}

/// Finds every other triad at a distance in `(0, complexity]`.
///
/// The target itself (matched by id) and triads sharing its exact position
/// are excluded.
pub fn find_connections<'a>(
    target: &Triad,
    triads: &'a [Triad],
    complexity: u32,
) -> Vec<Connection<'a>> {
    let limit = complexity as f64;
    triads
        .iter()
        .filter(|t| t.id != target.id)
        .filter_map(|t| {
            let distance = target.position.distance(&t.position);
            (distance > 0.0 && distance <= limit).then_some(Connection { triad: t, distance })
        })
        .collect()
}

/// Unweighted strength of a connection at `distance`.
pub fn connection_score(distance: f64, complexity: u32) -> f64 {
    (1.0 - distance / complexity as f64).max(0.0)
}

/// Bonus for the address requesting validation.
pub fn validator_bonus(registered: bool) -> f64 {
    if registered {
        REGISTERED_VALIDATOR_BONUS
    } else {
        UNREGISTERED_VALIDATOR_BONUS
    }
}

/// Computes the consensus score of `target` among `triads`.
///
/// `triads` may include the target; it is skipped. The result is always in
/// `[0, 1]`, and exactly `0` when the target has no connections.
pub fn consensus_score(
    target: &Triad,
    triads: &[Triad],
    complexity: u32,
    validator_registered: bool,
) -> f64 {
    let connections = find_connections(target, triads, complexity);
    if connections.is_empty() {
        return 0.0;
    }

    let total: f64 = connections
        .iter()
        .map(|c| {
            let score = connection_score(c.distance, complexity);
            if c.triad.validated {
                score
            } else {
                score * UNVALIDATED_NEIGHBOR_WEIGHT
            }
        })
        .sum();
    let average = total / connections.len() as f64;

    (average + validator_bonus(validator_registered)).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::triad::Position;
    use serde_json::json;

    const EPS: f64 = 1e-9;

    fn triad_at(id: &str, x: u32, y: u32, z: u32, validated: bool) -> Triad {
        Triad {
            id: id.to_string(),
            data: json!(null),
            validator: "TRDv".to_string(),
            timestamp: 0,
            position: Position::new(x, y, z),
            validated,
            consensus: 0.0,
            validation_attempts: 0,
        }
    }

    #[test]
    fn no_connections_scores_exactly_zero() {
        let a = triad_at("a", 0, 0, 0, false);
        assert_eq!(consensus_score(&a, std::slice::from_ref(&a), 4, true), 0.0);
        assert_eq!(consensus_score(&a, &[], 4, false), 0.0);
    }

    #[test]
    fn same_position_is_not_a_connection() {
        let a = triad_at("a", 1, 1, 1, false);
        let twin = triad_at("b", 1, 1, 1, true);
        assert!(find_connections(&a, &[a.clone(), twin], 4).is_empty());
    }

    #[test]
    fn out_of_range_is_not_a_connection() {
        let a = triad_at("a", 0, 0, 0, false);
        let far = triad_at("b", 2, 2, 2, true); // sqrt(12) ~ 3.46
        assert!(find_connections(&a, &[far.clone()], 3).is_empty());
        assert_eq!(find_connections(&a, &[far], 4).len(), 1);
    }

    #[test]
    fn boundary_distance_is_included_with_zero_strength() {
        let a = triad_at("a", 0, 0, 0, false);
        let edge = triad_at("b", 2, 0, 0, true);
        let connections = find_connections(&a, std::slice::from_ref(&edge), 2);
        assert_eq!(connections.len(), 1);
        assert_eq!(connection_score(2.0, 2), 0.0);

        // Mean 0 + unregistered bonus.
        let score = consensus_score(&a, &[edge], 2, false);
        assert!((score - 0.05).abs() < EPS);
    }

    #[test]
    fn validated_neighbor_unregistered_validator() {
        let a = triad_at("a", 0, 0, 0, false);
        let b = triad_at("b", 2, 0, 0, true);
        let score = consensus_score(&a, &[a.clone(), b], 4, false);
        assert!((score - 0.55).abs() < EPS);
    }

    #[test]
    fn validated_neighbor_registered_validator() {
        let a = triad_at("a", 0, 0, 0, false);
        let b = triad_at("b", 2, 0, 0, true);
        let score = consensus_score(&a, &[a.clone(), b], 4, true);
        assert!((score - 0.6).abs() < EPS);
    }

    #[test]
    fn two_validated_neighbors_cross_threshold() {
        let a = triad_at("a", 0, 0, 0, false);
        let b = triad_at("b", 2, 0, 0, true);
        let c = triad_at("c", 0, 1, 0, true);
        let score = consensus_score(&a, &[a.clone(), b, c], 4, true);
        assert!((score - 0.725).abs() < EPS);
        assert!(score >= 0.67);
    }

    #[test]
    fn pending_neighbor_counts_half() {
        let a = triad_at("a", 0, 0, 0, false);
        let b = triad_at("b", 2, 0, 0, false);
        let score = consensus_score(&a, &[b], 4, false);
        assert!((score - (0.25 + 0.05)).abs() < EPS);
    }

    #[test]
    fn score_is_clamped_to_one() {
        // complexity 100 makes every neighbor nearly full strength.
        let a = triad_at("a", 0, 0, 0, false);
        let b = triad_at("b", 1, 0, 0, true);
        let score = consensus_score(&a, &[b], 100, true);
        assert_eq!(score, 1.0);
    }

    #[test]
    fn score_always_in_unit_interval() {
        let mut triads = Vec::new();
        for x in 0..3 {
            for y in 0..3 {
                for z in 0..3 {
                    triads.push(triad_at(&format!("{x}{y}{z}"), x, y, z, (x + y + z) % 2 == 0));
                }
            }
        }
        for complexity in 1..6 {
            for target in &triads {
                for registered in [false, true] {
                    let s = consensus_score(target, &triads, complexity, registered);
                    assert!((0.0..=1.0).contains(&s), "score {s} out of range");
                }
            }
        }
    }
}
