use std::collections::VecDeque;

use crate::config::BotConfig;
use crate::indicators::exponential_moving_average;
use crate::models::{Candle, Signal, SignalKind};

const EMA_FAST_PERIOD: usize = 5;
const EMA_SLOW_PERIOD: usize = 50;
/// Number of EMA history points examined for an arc pattern.
const ARC_WINDOW: usize = 5;
const ARC_MIDDLE: usize = 2;

/// Result of feeding one candle through the engine: the evaluated price,
/// the current EMA pair (`None` while history is still warming) and any
/// signals that fired on this event.
#[derive(Debug, Clone)]
pub struct EngineUpdate {
    pub price: f64,
    pub ema5: Option<f64>,
    pub ema50: Option<f64>,
    pub signals: Vec<Signal>,
}

/// Incremental EMA crossover and arc-reversal detector.
///
/// `on_candle` is the sole mutator. Closed candles commit their close to the
/// bounded price series and append a final EMA point to history; open
/// candles recompute provisionally and overwrite the last history point in
/// place, so repeated ticks of the same forming candle never grow history or
/// double-count.
pub struct SignalEngine {
    closing_prices: VecDeque<f64>,
    ema5_history: VecDeque<f64>,
    ema50_history: VecDeque<f64>,
    /// Whether the last history entries came from a still-open candle.
    provisional: bool,
    prev_ema5: Option<f64>,
    prev_ema50: Option<f64>,
    last_crossover: Option<SignalKind>,
    /// Middle EMA5 of the last fired arc; the same extremum never re-fires.
    last_arc_mid: Option<f64>,
    price_window: usize,
    ema_window: usize,
    min_ema_diff: f64,
}

impl SignalEngine {
    pub fn new(config: &BotConfig) -> Self {
        Self {
            closing_prices: VecDeque::with_capacity(config.closing_price_window),
            ema5_history: VecDeque::with_capacity(config.ema_history_window),
            ema50_history: VecDeque::with_capacity(config.ema_history_window),
            provisional: false,
            prev_ema5: None,
            prev_ema50: None,
            last_crossover: None,
            last_arc_mid: None,
            price_window: config.closing_price_window,
            ema_window: config.ema_history_window,
            min_ema_diff: config.min_ema_diff,
        }
    }

    pub fn on_candle(&mut self, candle: &Candle) -> EngineUpdate {
        let price = candle.close;
        let (ema5, ema50) = if candle.is_closed {
            self.commit_price(price)
        } else {
            self.tentative_price(price)
        };

        let mut signals = Vec::new();
        if let (Some(cur5), Some(cur50)) = (ema5, ema50) {
            if let Some(signal) = self.detect_crossover(cur5, cur50, candle) {
                signals.push(signal);
            }
            if let Some(signal) = self.detect_arc(cur5, cur50, candle) {
                signals.push(signal);
            }
        }

        // Only committed values become the comparison baseline; open ticks
        // keep comparing against the last closed candle.
        if candle.is_closed {
            self.prev_ema5 = ema5;
            self.prev_ema50 = ema50;
        }

        EngineUpdate {
            price,
            ema5,
            ema50,
            signals,
        }
    }

    fn commit_price(&mut self, price: f64) -> (Option<f64>, Option<f64>) {
        self.closing_prices.push_back(price);
        if self.closing_prices.len() > self.price_window {
            self.closing_prices.pop_front();
        }

        let (ema5, ema50) = self.current_emas(None);
        if let (Some(e5), Some(e50)) = (ema5, ema50) {
            if self.provisional {
                // Finalize the slot the open ticks were overwriting.
                if let Some(last) = self.ema5_history.back_mut() {
                    *last = e5;
                }
                if let Some(last) = self.ema50_history.back_mut() {
                    *last = e50;
                }
                self.provisional = false;
            } else {
                self.push_history(e5, e50);
            }
        }
        (ema5, ema50)
    }

    fn tentative_price(&mut self, price: f64) -> (Option<f64>, Option<f64>) {
        let (ema5, ema50) = self.current_emas(Some(price));
        if let (Some(e5), Some(e50)) = (ema5, ema50) {
            if self.provisional {
                if let Some(last) = self.ema5_history.back_mut() {
                    *last = e5;
                }
                if let Some(last) = self.ema50_history.back_mut() {
                    *last = e50;
                }
            } else {
                self.push_history(e5, e50);
                self.provisional = true;
            }
        }
        (ema5, ema50)
    }

    fn push_history(&mut self, ema5: f64, ema50: f64) {
        self.ema5_history.push_back(ema5);
        self.ema50_history.push_back(ema50);
        if self.ema5_history.len() > self.ema_window {
            self.ema5_history.pop_front();
            self.ema50_history.pop_front();
        }
    }

    /// EMA pair over the committed series, optionally extended by a
    /// not-yet-committed price.
    fn current_emas(&self, tentative: Option<f64>) -> (Option<f64>, Option<f64>) {
        let mut series: Vec<f64> = self.closing_prices.iter().copied().collect();
        if let Some(price) = tentative {
            series.push(price);
        }
        (
            exponential_moving_average(&series, EMA_FAST_PERIOD),
            exponential_moving_average(&series, EMA_SLOW_PERIOD),
        )
    }

    /// Edge-triggered: fires only when the relative EMA order flips, and the
    /// same edge kind never fires twice in a row.
    fn detect_crossover(&mut self, cur5: f64, cur50: f64, candle: &Candle) -> Option<Signal> {
        let prev5 = self.prev_ema5?;
        let prev50 = self.prev_ema50?;

        let was_above = prev5 > prev50;
        let is_above = cur5 > cur50;
        if was_above == is_above {
            return None;
        }

        let kind = if is_above {
            SignalKind::CrossUp
        } else {
            SignalKind::CrossDown
        };
        if self.last_crossover == Some(kind) {
            return None;
        }
        self.last_crossover = Some(kind);

        Some(Signal {
            kind,
            timestamp: candle.close_time,
            reference_price: candle.close,
            second_extreme: None,
        })
    }

    fn detect_arc(&mut self, cur5: f64, cur50: f64, candle: &Candle) -> Option<Signal> {
        if self.ema5_history.len() < ARC_WINDOW {
            return None;
        }
        let skip = self.ema5_history.len() - ARC_WINDOW;
        let window5: Vec<f64> = self.ema5_history.iter().skip(skip).copied().collect();
        let window50: Vec<f64> = self.ema50_history.iter().skip(skip).copied().collect();

        let (kind, mid5, second_extreme) =
            arc_pattern(&window5, cur5, cur50)?;

        // Shallow arcs are noise.
        if (mid5 - window50[ARC_MIDDLE]).abs() < self.min_ema_diff {
            return None;
        }
        // The same extremum persists across open-candle ticks; fire once.
        if self.last_arc_mid == Some(mid5) {
            return None;
        }
        self.last_arc_mid = Some(mid5);

        Some(Signal {
            kind,
            timestamp: candle.close_time,
            reference_price: candle.close,
            second_extreme: Some(second_extreme),
        })
    }

    #[cfg(test)]
    fn ema_history_len(&self) -> usize {
        self.ema5_history.len()
    }
}

/// Arc-pattern test on a 5-point EMA5 window.
///
/// A top is a strict local maximum at the middle point with the fast EMA
/// already back below the slow one; a bottom is the mirrored strict minimum.
/// Ties never qualify. Returns the kind, the middle value and the window's
/// second-most-extreme point in the pattern's direction.
fn arc_pattern(window5: &[f64], cur5: f64, cur50: f64) -> Option<(SignalKind, f64, f64)> {
    let mid = window5[ARC_MIDDLE];
    let neighbors = [window5[0], window5[1], window5[3], window5[4]];

    let strict_max = neighbors.iter().all(|n| mid > *n);
    let strict_min = neighbors.iter().all(|n| mid < *n);

    let mut sorted = window5.to_vec();
    sorted.sort_by(f64::total_cmp);

    if strict_max && cur5 < cur50 {
        Some((SignalKind::ArcTop, mid, sorted[sorted.len() - 2]))
    } else if strict_min && cur5 > cur50 {
        Some((SignalKind::ArcBottom, mid, sorted[1]))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn candle(close: f64, is_closed: bool) -> Candle {
        let open_time = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        Candle {
            open_time,
            close_time: open_time + chrono::Duration::minutes(15),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            is_closed,
        }
    }

    fn engine() -> SignalEngine {
        SignalEngine::new(&BotConfig::default())
    }

    fn feed_closed(engine: &mut SignalEngine, closes: &[f64]) -> Vec<Signal> {
        closes
            .iter()
            .flat_map(|c| engine.on_candle(&candle(*c, true)).signals)
            .collect()
    }

    #[test]
    fn test_no_emas_until_slow_period_filled() {
        let mut engine = engine();
        for i in 0..49 {
            let update = engine.on_candle(&candle(100.0 + i as f64, true));
            assert!(update.ema50.is_none(), "ema50 defined at sample {}", i + 1);
            assert!(update.signals.is_empty());
        }
        let update = engine.on_candle(&candle(149.0, true));
        assert!(update.ema5.is_some());
        assert!(update.ema50.is_some());
    }

    #[test]
    fn test_crossover_fires_once_per_edge() {
        let mut engine = engine();
        let mut closes = vec![100.0; 50];
        closes.extend([110.0, 112.0, 114.0, 116.0]);

        let signals = feed_closed(&mut engine, &closes);
        let crossovers: Vec<_> = signals.iter().filter(|s| s.kind.is_crossover()).collect();
        assert_eq!(crossovers.len(), 1);
        assert_eq!(crossovers[0].kind, SignalKind::CrossUp);
        assert_eq!(crossovers[0].reference_price, 110.0);
    }

    #[test]
    fn test_opposite_edges_fire_in_alternation() {
        let mut engine = engine();
        let mut closes = vec![100.0; 50];
        closes.extend([110.0, 112.0]);
        closes.extend([85.0, 85.0, 85.0]);

        let signals = feed_closed(&mut engine, &closes);
        let kinds: Vec<SignalKind> = signals
            .iter()
            .filter(|s| s.kind.is_crossover())
            .map(|s| s.kind)
            .collect();
        assert_eq!(kinds, vec![SignalKind::CrossUp, SignalKind::CrossDown]);
    }

    #[test]
    fn test_open_ticks_do_not_grow_history() {
        let mut engine = engine();
        feed_closed(&mut engine, &vec![100.0; 50]);
        assert_eq!(engine.ema_history_len(), 1);

        // Repeated ticks of the same forming candle occupy one slot.
        engine.on_candle(&candle(101.0, false));
        engine.on_candle(&candle(102.0, false));
        engine.on_candle(&candle(103.0, false));
        assert_eq!(engine.ema_history_len(), 2);

        // The close finalizes that slot rather than appending a new one.
        engine.on_candle(&candle(103.0, true));
        assert_eq!(engine.ema_history_len(), 2);
    }

    #[test]
    fn test_open_tick_crossover_not_refired_by_next_tick() {
        let mut engine = engine();
        feed_closed(&mut engine, &vec![100.0; 50]);

        let update = engine.on_candle(&candle(110.0, false));
        assert_eq!(update.signals.len(), 1);
        assert_eq!(update.signals[0].kind, SignalKind::CrossUp);

        let update = engine.on_candle(&candle(111.0, false));
        assert!(update.signals.is_empty());
    }

    // Warm with 50 flat closes, spike up, then crash: the EMA5 trajectory
    // [e(100), e(110), e(120), e(80), e(80)] has a strict maximum at its
    // middle while EMA5 has already fallen back below EMA50.
    #[test]
    fn test_arc_top_fires_on_sharp_reversal() {
        let mut engine = engine();
        let mut closes = vec![100.0; 50];
        closes.extend([110.0, 120.0, 80.0, 80.0]);

        let signals = feed_closed(&mut engine, &closes);
        let arcs: Vec<_> = signals.iter().filter(|s| s.kind.is_arc()).collect();
        assert_eq!(arcs.len(), 1);
        assert_eq!(arcs[0].kind, SignalKind::ArcTop);
        assert_eq!(arcs[0].reference_price, 80.0);

        // Second extreme is the EMA5 one step before the peak.
        let k = 2.0 / 6.0;
        let expected = 110.0 * k + 100.0 * (1.0 - k);
        let second = arcs[0].second_extreme.unwrap();
        assert!((second - expected).abs() < 1e-9, "got {second}");
    }

    #[test]
    fn test_arc_fires_once_across_open_ticks_of_same_window() {
        let mut engine = engine();
        let mut closes = vec![100.0; 50];
        closes.extend([110.0, 120.0, 80.0]);
        feed_closed(&mut engine, &closes);

        let update = engine.on_candle(&candle(80.0, false));
        assert_eq!(update.signals.len(), 1);
        assert_eq!(update.signals[0].kind, SignalKind::ArcTop);

        // Same extremum, same forming candle: suppressed.
        let update = engine.on_candle(&candle(80.5, false));
        assert!(update.signals.iter().all(|s| !s.kind.is_arc()));
    }

    #[test]
    fn test_arc_pattern_requires_strict_extremum() {
        // Tie between the middle and a neighbor never qualifies.
        let tied = [100.0, 105.0, 105.0, 103.0, 101.0];
        assert!(arc_pattern(&tied, 95.0, 99.0).is_none());

        let strict = [100.0, 103.0, 105.0, 103.0, 101.0];
        let (kind, mid, second) = arc_pattern(&strict, 95.0, 99.0).unwrap();
        assert_eq!(kind, SignalKind::ArcTop);
        assert_eq!(mid, 105.0);
        assert_eq!(second, 103.0);
    }

    #[test]
    fn test_arc_pattern_requires_post_reversal_orientation() {
        let window = [100.0, 103.0, 105.0, 103.0, 101.0];
        // EMA5 still above EMA50: the breakout has not confirmed.
        assert!(arc_pattern(&window, 101.0, 99.0).is_none());

        let valley = [105.0, 102.0, 100.0, 102.0, 104.0];
        let (kind, _, second) = arc_pattern(&valley, 104.5, 103.0).unwrap();
        assert_eq!(kind, SignalKind::ArcBottom);
        assert_eq!(second, 102.0);
    }

    #[test]
    fn test_shallow_arc_discarded_as_noise() {
        let mut engine = SignalEngine::new(&BotConfig {
            min_ema_diff: 1_000.0,
            ..BotConfig::default()
        });
        let mut closes = vec![100.0; 50];
        closes.extend([110.0, 120.0, 80.0, 80.0]);

        let signals = feed_closed(&mut engine, &closes);
        assert!(signals.iter().all(|s| !s.kind.is_arc()));
    }
}
