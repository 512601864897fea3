use super::ServiceInstance;
use rand::Rng;

/// Weighted random pick: draw uniformly in `[0, total_weight)` and walk the
/// list subtracting weights until the remainder drops to zero or below.
///
/// Falls back to the first instance when every weight is zero or the residue
/// never crosses zero (floating-point edge at the top of the range).
pub fn select<R: Rng + ?Sized>(instances: &[ServiceInstance], rng: &mut R) -> Option<usize> {
    if instances.is_empty() {
        return None;
    }
    let total: f64 = instances.iter().map(|i| i.weight as f64).sum();
    if total <= 0.0 {
        return Some(0);
    }
    let mut remainder = rng.gen_range(0.0..total);
    for (idx, inst) in instances.iter().enumerate() {
        remainder -= inst.weight as f64;
        if remainder <= 0.0 {
            return Some(idx);
        }
    }
    Some(0)
}
