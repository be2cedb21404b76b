/// Simple moving average over the first `period` values of `prices`.
///
/// Returns `None` when fewer than `period` values exist.
pub fn simple_moving_average(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }
    let sum: f64 = prices[..period].iter().sum();
    Some(sum / period as f64)
}

/// Exponential moving average over the full series, seeded with the simple
/// average of the first `period` values.
///
/// Uses the standard recurrence `EMA_t = price * k + EMA_{t-1} * (1 - k)`
/// with `k = 2 / (period + 1)`. Returns `None` when fewer than `period`
/// values exist.
pub fn exponential_moving_average(prices: &[f64], period: usize) -> Option<f64> {
    let seed = simple_moving_average(prices, period)?;
    let k = 2.0 / (period as f64 + 1.0);

    let mut ema = seed;
    for price in &prices[period..] {
        ema = price * k + ema * (1.0 - k);
    }
    Some(ema)
}
