//! Weight-driven selection: weighted round-robin and proportional draw.

/// Resolution used to turn fractional weights into round-robin slots.
const SLOTS_PER_UNIT: f64 = 10.0;

/// Weighted round-robin over `weights` for a rotating counter value.
///
/// Each candidate owns a contiguous run of slots proportional to its
/// weight; the counter walks the slots in order.
pub fn pick_round_robin(weights: &[f64], tick: usize) -> Option<usize> {
    let slots: Vec<usize> = weights
        .iter()
        .map(|w| (w * SLOTS_PER_UNIT).round().max(0.0) as usize)
        .collect();
    let total: usize = slots.iter().sum();
    if total == 0 {
        return None;
    }

    let mut position = tick % total;
    for (index, count) in slots.iter().enumerate() {
        if position < *count {
            return Some(index);
        }
        position -= count;
    }
    None
}

/// Draw an index with probability proportional to its weight.
///
/// `roll` must be in `[0, 1)`; callers pass a random value so the draw
/// itself stays deterministic under test.
pub fn pick_proportional(weights: &[f64], roll: f64) -> Option<usize> {
    let total: f64 = weights.iter().map(|w| w.max(0.0)).sum();
    if total <= 0.0 {
        return None;
    }

    let mut target = roll.clamp(0.0, 1.0) * total;
    let mut last_positive = None;
    for (index, weight) in weights.iter().enumerate() {
        let weight = weight.max(0.0);
        if weight == 0.0 {
            continue;
        }
        if target < weight {
            return Some(index);
        }
        target -= weight;
        last_positive = Some(index);
    }
    // roll == 1.0 or float drift
    last_positive
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_round_robin_distribution() {
        let weights = [1.0, 3.0];
        let mut hits = [0usize; 2];
        for tick in 0..40 {
            hits[pick_round_robin(&weights, tick).unwrap()] += 1;
        }
        assert_eq!(hits, [10, 30]);
    }

    #[test]
    fn test_weighted_round_robin_fractional() {
        let weights = [1.0, 1.5];
        let mut hits = [0usize; 2];
        for tick in 0..25 {
            hits[pick_round_robin(&weights, tick).unwrap()] += 1;
        }
        assert_eq!(hits, [10, 15]);
    }

    #[test]
    fn test_proportional() {
        let weights = [0.5, 0.0, 1.5];
        assert_eq!(pick_proportional(&weights, 0.0), Some(0));
        assert_eq!(pick_proportional(&weights, 0.24), Some(0));
        assert_eq!(pick_proportional(&weights, 0.26), Some(2));
        assert_eq!(pick_proportional(&weights, 0.999), Some(2));
        assert_eq!(pick_proportional(&weights, 1.0), Some(2));
        assert_eq!(pick_proportional(&[0.0, 0.0], 0.5), None);
    }
}
