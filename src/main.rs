//! Signal-driven spot trading bot.
//!
//! Turns externally supplied BUY/SELL signals into tracked positions with
//! ATR-based stop-loss/take-profit levels, trailing-stop maintenance, and
//! protective-order monitoring.

mod api;
mod bot;
mod ledger;
mod models;
mod trading;

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{ExchangeApi, ExchangeClient, Notifier};
use crate::bot::{Bot, BotConfig};
use crate::ledger::Ledger;
use crate::models::SignalAction;
use crate::trading::{
    AtrStrategy, OrderGateway, PositionManager, PositionStore, QuoteCache, TradingConfig,
};

/// Spot trading bot CLI.
#[derive(Parser)]
#[command(name = "spot-trader")]
#[command(about = "Trade spot positions from externally supplied signals", long_about = None)]
struct Cli {
    /// Ledger database path
    #[arg(short, long, default_value = "sqlite:./spottrader.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the trading loop
    Run {
        /// Signal polling interval in seconds
        #[arg(short, long, default_value = "5")]
        interval: u64,

        /// Quote-currency notional per buy order
        #[arg(short, long)]
        amount: Option<f64>,
    },

    /// Queue a signal row (normally an external producer writes these)
    Signal {
        /// Instrument symbol (e.g. BTC or BTC_USDT)
        symbol: String,

        /// BUY or SELL
        action: String,

        /// Take-profit level
        #[arg(long)]
        take_profit: Option<f64>,

        /// Stop-loss level
        #[arg(long)]
        stop_loss: Option<f64>,

        /// Resistance above entry
        #[arg(long)]
        resistance_up: Option<f64>,

        /// Support below entry
        #[arg(long)]
        resistance_down: Option<f64>,
    },

    /// Show the signal sheet and archive summary
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let ledger = Arc::new(Ledger::new(&cli.database).await?);

    match cli.command {
        Commands::Run { interval, amount } => {
            // Credential or auth failure is the only fatal startup path.
            let exchange = ExchangeClient::from_env()
                .context("Exchange credentials required to run the trading loop")?;
            exchange
                .authenticate()
                .await
                .context("Could not authenticate with the exchange")?;
            info!("Authentication successful");

            let exchange: Arc<dyn ExchangeApi> = Arc::new(exchange);

            let mut config = TradingConfig::default();
            if let Some(amount) = amount {
                config.trade_amount = Decimal::try_from(amount).context("Invalid trade amount")?;
            } else if let Ok(amount) = std::env::var("TRADE_AMOUNT") {
                config.trade_amount = Decimal::from_str(&amount).context("Invalid TRADE_AMOUNT")?;
            }

            let quotes = Arc::new(QuoteCache::new(exchange.clone(), &config));
            let risk = AtrStrategy::new(quotes.clone(), &config);
            let gateway = OrderGateway::new(exchange.clone(), quotes.clone(), config.clone());
            let store = Arc::new(PositionStore::new());
            let notifier = Arc::new(Notifier::from_env());

            let manager = Arc::new(PositionManager::new(
                exchange,
                quotes,
                risk,
                gateway,
                store,
                ledger.clone(),
                notifier.clone(),
                config.clone(),
            ));

            let bot_config = BotConfig {
                check_interval_secs: interval,
                ..BotConfig::default()
            };

            println!("\n=== Spot Trading Bot ===");
            println!(
                "Trade amount:     {} {}",
                config.trade_amount, config.quote_asset
            );
            println!("Polling interval: {}s", interval);
            println!(
                "Notifications:    {}",
                if notifier.is_enabled() { "on" } else { "off" }
            );
            println!("\nPress Ctrl+C to stop.\n");

            let bot = Bot::new(bot_config, manager, ledger, notifier);
            bot.run().await?;
        }

        Commands::Signal {
            symbol,
            action,
            take_profit,
            stop_loss,
            resistance_up,
            resistance_down,
        } => {
            let action = SignalAction::parse(&action).context("Action must be BUY or SELL")?;

            let row_id = ledger
                .insert_signal(
                    &symbol,
                    action,
                    to_decimal(take_profit),
                    to_decimal(stop_loss),
                    to_decimal(resistance_up),
                    to_decimal(resistance_down),
                )
                .await?;

            println!(
                "Queued {} signal for {} (row {})",
                action.as_str(),
                symbol,
                row_id
            );
        }

        Commands::Status => {
            let rows = ledger.all_rows().await?;
            let archived = ledger.archived_count().await?;

            if rows.is_empty() {
                println!("No signal rows. Use 'spot-trader signal <symbol> <action>' to add one.");
                return Ok(());
            }

            println!(
                "\n{:<4} {:<12} {:<6} {:<22} {:>12} {:>12} {:>12}",
                "ROW", "SYMBOL", "ACT", "STATUS", "PRICE", "QTY", "STOP"
            );
            println!("{}", "-".repeat(86));

            for row in &rows {
                println!(
                    "{:<4} {:<12} {:<6} {:<22} {:>12} {:>12} {:>12}",
                    row.id,
                    row.symbol,
                    row.action,
                    row.status.as_deref().unwrap_or("-"),
                    fmt_cell(row.purchase_price),
                    fmt_cell(row.quantity),
                    fmt_cell(row.stop_loss),
                );
            }

            println!("\nArchived trades: {}", archived);
        }
    }

    Ok(())
}

fn to_decimal(value: Option<f64>) -> Option<Decimal> {
    value.and_then(|v| Decimal::try_from(v).ok())
}

fn fmt_cell(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.4}", v))
        .unwrap_or_else(|| "-".to_string())
}
