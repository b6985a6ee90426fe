//! Bot runner: the outer trading loop.
//!
//! Handles:
//! - Polling the ledger for new BUY/SELL signals
//! - Dispatching signals to the position manager
//! - Running the foreground price sweep every tick
//! - Periodic status reporting and graceful shutdown

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::time::{interval, sleep, Instant};
use tracing::{debug, error, info, warn};

use crate::api::Notifier;
use crate::ledger::Ledger;
use crate::models::{ExitType, SignalAction};
use crate::trading::PositionManager;

/// Pause between consecutive signal executions.
const INTER_SIGNAL_DELAY: Duration = Duration::from_millis(500);

/// Bot configuration.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Trading-loop tick interval (seconds)
    pub check_interval_secs: u64,

    /// Status-report interval (seconds)
    pub report_interval_secs: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 5,
            report_interval_secs: 300,
        }
    }
}

/// Main bot runner.
pub struct Bot {
    config: BotConfig,
    manager: Arc<PositionManager>,
    ledger: Arc<Ledger>,
    notifier: Arc<Notifier>,
    shutdown: Arc<AtomicBool>,
}

impl Bot {
    pub fn new(
        config: BotConfig,
        manager: Arc<PositionManager>,
        ledger: Arc<Ledger>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            config,
            manager,
            ledger,
            notifier,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get shutdown signal for external control.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Main run loop.
    pub async fn run(&self) -> Result<()> {
        info!(
            check_interval = self.config.check_interval_secs,
            "Starting trading loop"
        );

        self.manager.start().await;
        self.notifier.notify("Trading bot started").await;

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        let mut tick = interval(Duration::from_secs(self.config.check_interval_secs));
        let mut last_report = Instant::now();

        while !self.shutdown.load(Ordering::SeqCst) {
            tick.tick().await;

            if let Err(e) = self.process_signals().await {
                error!(error = %e, "Error processing trade signals");
            }

            let checked = self.manager.check_positions().await;
            debug!(checked, "Completed trade cycle");

            if last_report.elapsed() >= Duration::from_secs(self.config.report_interval_secs) {
                let active = self.manager.position_count().await;
                info!(active_positions = active, "Status report");
                last_report = Instant::now();
            }
        }

        // Graceful shutdown: stop the monitor before announcing exit.
        self.manager.stop().await;
        self.notifier.notify("Trading bot stopped").await;

        info!("Trading loop stopped");
        Ok(())
    }

    /// Fetch and dispatch all actionable signals. Per-signal failures are
    /// logged and reported; they never abort the loop.
    async fn process_signals(&self) -> Result<usize> {
        let signals = self.ledger.trade_signals().await?;

        if signals.is_empty() {
            debug!("No trade signals found");
            return Ok(0);
        }

        let mut executed = 0;

        for signal in signals {
            info!(symbol = %signal.symbol, action = signal.action.as_str(), "Processing signal");

            match signal.action {
                SignalAction::Buy => {
                    if self.manager.has_position(&signal.symbol).await {
                        debug!(symbol = %signal.symbol, "Skipping BUY, position already active");
                        continue;
                    }

                    match self.manager.execute_buy(&signal).await {
                        Ok(true) => {
                            executed += 1;
                            info!(symbol = %signal.symbol, "BUY executed");
                        }
                        Ok(false) => {
                            debug!(symbol = %signal.symbol, "BUY skipped");
                        }
                        Err(e) => {
                            warn!(symbol = %signal.symbol, error = %e, "BUY failed");
                        }
                    }
                }
                SignalAction::Sell => {
                    match self
                        .manager
                        .execute_sell(&signal.symbol, signal.row_id, ExitType::Manual)
                        .await
                    {
                        Ok(_) => {
                            executed += 1;
                            info!(symbol = %signal.symbol, "SELL executed");
                        }
                        Err(e) => {
                            warn!(symbol = %signal.symbol, error = %e, "SELL failed");
                        }
                    }
                }
            }

            sleep(INTER_SIGNAL_DELAY).await;
        }

        Ok(executed)
    }
}
