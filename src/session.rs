use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::execution::PositionController;
use crate::strategy::SignalEngine;
use crate::stream::MarketEvent;

/// Single ordered consumer for one symbol session.
///
/// Drains the market-event queue one event at a time, updates indicator
/// state and drives the position state machine. All mutable trading state
/// lives behind this one task, so arrival order is the only ordering and no
/// locks are needed.
pub struct Session {
    engine: SignalEngine,
    controller: PositionController,
    events: mpsc::Receiver<MarketEvent>,
}

impl Session {
    pub fn new(
        engine: SignalEngine,
        controller: PositionController,
        events: mpsc::Receiver<MarketEvent>,
    ) -> Self {
        Self {
            engine,
            controller,
            events,
        }
    }

    /// Runs until the event queue closes, i.e. the connection task ended.
    pub async fn run(mut self) {
        while let Some(MarketEvent::Candle(candle)) = self.events.recv().await {
            let update = self.engine.on_candle(&candle);
            let (Some(ema5), Some(ema50)) = (update.ema5, update.ema50) else {
                // Indicator history still warming.
                continue;
            };

            // Exit conditions run first so a position flipped by a signal
            // below is not immediately re-examined on the same tick.
            if let Err(e) = self.controller.evaluate_exits(update.price, ema5, ema50).await {
                warn!("exit evaluation failed: {e}");
            }

            for signal in &update.signals {
                info!(kind = ?signal.kind, price = update.price, "📈 signal");
                if let Err(e) = self
                    .controller
                    .on_signal(signal, update.price, ema5, ema50)
                    .await
                {
                    warn!("signal action failed: {e}");
                }
            }
        }
        info!("event queue closed, session ending");
    }
}
