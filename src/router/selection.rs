use rand::Rng;

use crate::models::router::{ModelDeployment, RoutingStrategy};

/// Picks one deployment from an already-healthy-filtered candidate
/// list per spec.md §4.F `selectDeployment`'s strategy table. Tie-break
/// is always lower `priority` then stable insertion order.
///
/// `least-cost` and `least-latency` have no dedicated field on
/// `ModelDeployment` (spec.md §3) to rank by — real cost/latency
/// signals live in the Pricing module and the statistics layer, which
/// this pure selection function deliberately doesn't depend on — so
/// both fall back to the same priority-then-insertion-order rule as
/// `simple` until a caller wires in live signal (Open Question,
/// resolved in DESIGN.md).
pub fn select_deployment(
    candidates: &[ModelDeployment],
    strategy: RoutingStrategy,
    next_round_robin_index: impl FnOnce(usize) -> usize,
) -> Option<ModelDeployment> {
    if candidates.is_empty() {
        return None;
    }

    match strategy {
        RoutingStrategy::Simple | RoutingStrategy::LeastCost | RoutingStrategy::LeastLatency => {
            lowest_priority_first(candidates)
        }
        RoutingStrategy::RoundRobin => {
            let index = next_round_robin_index(candidates.len());
            candidates.get(index).cloned()
        }
        RoutingStrategy::Random => weighted_random(candidates),
    }
}

fn lowest_priority_first(candidates: &[ModelDeployment]) -> Option<ModelDeployment> {
    candidates.iter().min_by_key(|d| d.priority).cloned()
}

fn weighted_random(candidates: &[ModelDeployment]) -> Option<ModelDeployment> {
    let total_weight: u32 = candidates.iter().map(|d| d.weight.max(1)).sum();
    if total_weight == 0 {
        return candidates.first().cloned();
    }
    let mut roll = rand::thread_rng().gen_range(0..total_weight);
    for deployment in candidates {
        let weight = deployment.weight.max(1);
        if roll < weight {
            return Some(deployment.clone());
        }
        roll -= weight;
    }
    candidates.last().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(name: &str, priority: u32, weight: u32) -> ModelDeployment {
        ModelDeployment {
            name: name.to_string(),
            provider_id: "p".to_string(),
            provider_model_id: "m".to_string(),
            priority,
            weight,
            healthy: true,
            last_error: None,
        }
    }

    #[test]
    fn simple_picks_lowest_priority() {
        let candidates = vec![deployment("b", 2, 1), deployment("a", 1, 1)];
        let chosen = select_deployment(&candidates, RoutingStrategy::Simple, |_| 0).unwrap();
        assert_eq!(chosen.name, "a");
    }

    #[test]
    fn round_robin_uses_provided_index() {
        let candidates = vec![deployment("a", 1, 1), deployment("b", 1, 1), deployment("c", 1, 1)];
        let chosen = select_deployment(&candidates, RoutingStrategy::RoundRobin, |len| {
            assert_eq!(len, 3);
            1
        })
        .unwrap();
        assert_eq!(chosen.name, "b");
    }

    #[test]
    fn weighted_random_never_picks_zero_weight_exclusively_when_others_exist() {
        let candidates = vec![deployment("heavy", 1, 100), deployment("light", 1, 1)];
        for _ in 0..20 {
            let chosen = select_deployment(&candidates, RoutingStrategy::Random, |_| 0).unwrap();
            assert!(chosen.name == "heavy" || chosen.name == "light");
        }
    }
}
