/// Splits `items` into `n` contiguous, order-preserving sublists whose
/// lengths differ by at most one. The first `len % n` sublists get the extra
/// item. Sublists are empty when there are fewer items than `n`.
///
/// Returns no sublists when `n` is 0.
pub fn partition<T>(items: Vec<T>, n: usize) -> Vec<Vec<T>> {
    if n == 0 {
        return Vec::new();
    }
    let base = items.len() / n;
    let extra = items.len() % n;

    let mut rest = items.into_iter();
    (0..n)
        .map(|i| {
            let take = base + usize::from(i < extra);
            rest.by_ref().take(take).collect()
        })
        .collect()
}
