//! Least-active-connections selection.

use std::sync::Arc;

use crate::load_balancer::instance::ServiceInstance;

/// Select the instance with the lowest load per unit of effective weight.
///
/// Ties go to the lowest raw active count, then the lowest instance id.
pub fn pick(candidates: &[Arc<ServiceInstance>], weights: &[f64]) -> Option<usize> {
    candidates
        .iter()
        .zip(weights)
        .enumerate()
        .min_by(|(_, (a, wa)), (_, (b, wb))| {
            let load_a = a.active_connections() as f64 / wa.max(f64::EPSILON);
            let load_b = b.active_connections() as f64 / wb.max(f64::EPSILON);
            load_a
                .total_cmp(&load_b)
                .then(a.active_connections().cmp(&b.active_connections()))
                .then(a.id.cmp(&b.id))
        })
        .map(|(index, _)| index)
}
