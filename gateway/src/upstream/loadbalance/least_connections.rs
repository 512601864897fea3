use super::ServiceInstance;

/// Index of the instance with the fewest active connections. Ties go to the
/// earliest instance in list order.
pub fn select(instances: &[ServiceInstance]) -> Option<usize> {
    instances
        .iter()
        .enumerate()
        .min_by_key(|(_, inst)| inst.active())
        .map(|(idx, _)| idx)
}
