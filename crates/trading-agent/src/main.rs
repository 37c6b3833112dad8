use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Timelike;
use chrono_tz::Tz;
use exchange_broker::{BinanceFuturesClient, ExchangeClient};
use inference_client::InferenceClient;
use market_data::{EconCalendar, MarketDataClient};
use risk_gate::FeeSchedule;
use signal_core::TradeOutcome;
use telegram_notifier::{AgentCommand, InboundEvent, TelegramNotifier};
use tokio::signal::unix::SignalKind;
use tokio::time;
use trade_store::TradeStore;

mod config;
mod context;
mod executor;
mod learning;
mod pipeline;
mod reconciler;
mod report;
mod signal_buffer;

use config::AgentConfig;
use executor::TradeExecutor;
use learning::LearningLoop;
use pipeline::DecisionPipeline;
use reconciler::Reconciler;
use signal_buffer::SignalBuffer;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    // Panic hook: log panic info before crashing
    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        tracing::error!("PANIC: {info}");
    }));

    tracing::info!("Starting SignalDesk trading agent");

    // 2. Load configuration
    let config = AgentConfig::from_env()?;
    tracing::info!("Configuration loaded");
    tracing::info!("  Leverage: {}x", config.leverage);
    tracing::info!("  Buffer flush: {}s", config.buffer_flush_seconds);
    tracing::info!("  Scan interval: {}s", config.scan_interval_seconds);
    tracing::info!("  Reconcile interval: {}s", config.reconcile_interval_seconds);
    tracing::info!("  Confirmation timeout: {}s", config.confirm_timeout_seconds);

    // 3. Exchange client + safety gate: testnet by default, live requires
    //    an explicit override.
    let exchange: Arc<dyn ExchangeClient> = Arc::new(BinanceFuturesClient::new(
        config.binance_api_key.clone(),
        config.binance_secret_key.clone(),
        config.binance_base_url.clone(),
    )?);
    if !exchange.is_testnet() {
        let approved = std::env::var("LIVE_TRADING_APPROVED")
            .map(|v| v.eq_ignore_ascii_case("yes"))
            .unwrap_or(false);
        if !approved {
            tracing::error!(
                "BINANCE_BASE_URL points to live trading ({}). \
                 Set LIVE_TRADING_APPROVED=yes to enable, or use \
                 https://testnet.binancefuture.com for testnet.",
                config.binance_base_url
            );
            std::process::exit(1);
        }
        tracing::warn!(
            "LIVE TRADING MODE — REAL MONEY AT RISK ({})",
            config.binance_base_url
        );
    } else {
        tracing::info!("Testnet mode ({})", config.binance_base_url);
    }

    // 4. Database
    sqlx::any::install_default_drivers();
    let pool = sqlx::AnyPool::connect(&config.database_url).await?;
    let tz: Tz = config
        .timezone
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid TIMEZONE {}: {}", config.timezone, e))?;
    let store = Arc::new(TradeStore::new(pool.clone(), tz));
    store.init_tables().await?;
    tracing::info!("Trade store initialized ({})", config.database_url);

    // 5. Remaining collaborators
    let market = MarketDataClient::new(config.market_data_url.clone(), Duration::from_secs(10))?;
    let calendar = EconCalendar::new(config.calendar_feed_url.clone())?;
    let inference = InferenceClient::new(config.inference_url.clone(), Duration::from_secs(120))?;
    let notifier = Arc::new(TelegramNotifier::new(
        config.telegram_bot_token.clone(),
        config.telegram_chat_id,
    )?);
    if notifier.enabled() {
        tracing::info!("Telegram notifier ready (chat {})", config.telegram_chat_id);
    } else {
        tracing::warn!("Telegram not configured: confirmations will fail closed");
    }

    // 6. Components
    let buffer = SignalBuffer::new(Arc::clone(&store));
    let trade_executor = TradeExecutor::new(Arc::clone(&exchange), config.leverage);
    let learning = Arc::new(LearningLoop::new(
        Arc::clone(&store),
        inference.clone(),
        market.clone(),
        Arc::clone(&notifier),
        config.weight_scale,
        config.exit_deviation_guard,
        config.pattern_scan_every,
        config.retune_every,
    ));
    let reconciler = Reconciler::new(
        Arc::clone(&store),
        Arc::clone(&exchange),
        market.clone(),
        Arc::clone(&notifier),
        Arc::clone(&learning),
        config.stop_breach_confirmations,
    );
    let pipeline = DecisionPipeline::new(
        Arc::clone(&store),
        market.clone(),
        calendar,
        inference.clone(),
        Arc::clone(&exchange),
        trade_executor,
        Arc::clone(&notifier),
        Duration::from_secs(config.confirm_timeout_seconds),
        config.leverage,
    );

    // 7. Startup checks
    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("database connectivity check failed: {}", e))?;
    tracing::info!("Startup check: database OK");

    let account = exchange
        .get_account()
        .await
        .map_err(|e| anyhow::anyhow!("exchange connectivity check failed: {}", e))?;
    tracing::info!(
        "Startup check: {} OK (wallet {} USDT)",
        exchange.exchange_name(),
        account.total_wallet_balance
    );

    match inference.health().await {
        Ok(true) => tracing::info!("Startup check: inference service OK"),
        Ok(false) => tracing::warn!("Startup check: inference service unhealthy"),
        Err(e) => tracing::warn!("Startup check: inference service unreachable ({})", e),
    }

    let params = store.latest_risk_parameters().await?;
    tracing::info!(
        "Risk parameters v{}: confidence >= {:.2}, RR >= {:.2}, whitelist [{}]",
        params.version,
        params.min_confidence,
        params.min_risk_reward,
        params.whitelist.join(", ")
    );

    // 8. Startup notification
    notifier
        .send_message(&format!(
            "*Trading agent started*\nWallet: {} USDT | Leverage: {}x\nWhitelist: {}\nParameters: v{}",
            account.total_wallet_balance,
            config.leverage,
            params.whitelist.join(", "),
            params.version
        ))
        .await
        .ok();

    tracing::info!("Agent is running. Press Ctrl+C to stop.");

    let mut last_report_date = store
        .load_state("last_report_date")
        .await
        .ok()
        .flatten()
        .unwrap_or_default();

    // Main loop with graceful shutdown (SIGINT + SIGTERM)
    let mut flush_tick = time::interval(Duration::from_secs(config.buffer_flush_seconds));
    let mut scan_tick = time::interval(Duration::from_secs(config.scan_interval_seconds));
    let mut reconcile_tick = time::interval(Duration::from_secs(config.reconcile_interval_seconds));
    let mut poll_tick = time::interval(Duration::from_secs(config.command_poll_seconds));
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    let shutdown = async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = flush_tick.tick() => {
                let batch = buffer.drain();
                if !batch.is_empty() {
                    tracing::info!("flushing {} buffered messages", batch.len());
                    if let Err(e) = pipeline.process_batch(batch).await {
                        tracing::error!("pipeline error: {}", e);
                    }
                }
            }
            _ = scan_tick.tick() => {
                // Proactive re-read of the recent message window. The gate's
                // cooldown and duplicate checks keep re-scans harmless.
                let since = chrono::Utc::now()
                    - chrono::Duration::seconds(config.scan_lookback_seconds);
                match store.messages_since(since).await {
                    Ok(messages) if !messages.is_empty() => {
                        tracing::debug!("scan over {} recent messages", messages.len());
                        if let Err(e) = pipeline.process_batch(messages).await {
                            tracing::error!("scan pipeline error: {}", e);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => tracing::error!("scan query failed: {}", e),
                }
            }
            _ = reconcile_tick.tick() => {
                if let Err(e) = reconciler.run_cycle().await {
                    tracing::error!("reconcile cycle failed: {}", e);
                }

                // Daily report once per local day at the configured hour
                let local_now = chrono::Utc::now().with_timezone(&store.timezone());
                let today = local_now.format("%Y-%m-%d").to_string();
                if today != last_report_date && local_now.hour() >= config.report_hour_local {
                    match report::build_daily_report(&store).await {
                        Ok(daily) => {
                            if let Err(e) = notifier.send_daily_report(&daily).await {
                                tracing::warn!("daily report send failed: {}", e);
                            }
                        }
                        Err(e) => tracing::warn!("daily report build failed: {}", e),
                    }
                    last_report_date.clone_from(&today);
                    store.save_state("last_report_date", &today).await.ok();
                }
            }
            _ = poll_tick.tick() => {
                let events = match notifier.poll_inbound().await {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::debug!("inbound poll failed: {}", e);
                        Vec::new()
                    }
                };
                for event in events {
                    match event {
                        InboundEvent::Signal { source_id, text } => {
                            let whitelist = match store.latest_risk_parameters().await {
                                Ok(p) => p.whitelist,
                                Err(e) => {
                                    tracing::error!("parameter load failed: {}", e);
                                    continue;
                                }
                            };
                            if let Err(e) = buffer
                                .push(&source_id, "telegram", &text, &[], &whitelist)
                                .await
                            {
                                tracing::error!("buffering message failed: {}", e);
                            }
                        }
                        InboundEvent::Command(command) => {
                            if let Err(e) = handle_command(
                                command,
                                &store,
                                &exchange,
                                &market,
                                &notifier,
                                &learning,
                            )
                            .await
                            {
                                tracing::error!("command failed: {}", e);
                            }
                        }
                    }
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Shutdown signal received, exiting gracefully...");
                notifier
                    .send_message("*Trading agent stopped* — graceful shutdown")
                    .await
                    .ok();
                break;
            }
        }
    }

    tracing::info!("Trading agent shut down.");
    Ok(())
}

async fn handle_command(
    command: AgentCommand,
    store: &Arc<TradeStore>,
    exchange: &Arc<dyn ExchangeClient>,
    market: &MarketDataClient,
    notifier: &Arc<TelegramNotifier>,
    learning: &Arc<LearningLoop>,
) -> Result<()> {
    match command {
        AgentCommand::Status => {
            let counters = store.risk_counters("").await?;
            let exposed = store.exposed_trades().await?;
            let halted = store.is_halted().await?;
            let positions: Vec<String> = exposed
                .iter()
                .map(|t| {
                    format!(
                        "#{} {} {} @ {:.2} (stop {:.2})",
                        t.id,
                        t.direction.as_str(),
                        t.instrument,
                        t.entry_price,
                        t.stop_loss
                    )
                })
                .collect();
            notifier
                .send_message(&format!(
                    "*Status*\nToday: {} trades, {:+.2}% | Cumulative: {:+.2}%\nLoss streak: {}\nOpen:\n{}{}",
                    counters.trades_today,
                    counters.daily_pnl_pct,
                    counters.cumulative_pnl_pct,
                    counters.consecutive_losses,
                    if positions.is_empty() {
                        "(none)".to_string()
                    } else {
                        positions.join("\n")
                    },
                    halted
                        .map(|r| format!("\n\nHALTED: {}", r))
                        .unwrap_or_default()
                ))
                .await?;
        }
        AgentCommand::CloseTrade(trade_id) => {
            let Some(trade) = store.get_trade(trade_id).await? else {
                notifier
                    .send_message(&format!("No trade #{}", trade_id))
                    .await?;
                return Ok(());
            };
            if !trade.state.is_exposed() {
                notifier
                    .send_message(&format!(
                        "Trade #{} is {}, nothing to close",
                        trade_id,
                        trade.state.as_str()
                    ))
                    .await?;
                return Ok(());
            }
            let quantity = reconciler::remaining_quantity(&trade);
            exchange
                .close_position_market(&trade.instrument, trade.direction, quantity)
                .await?;
            exchange.cancel_all_orders(&trade.instrument).await.ok();
            let exit_price = market
                .current_price(&trade.instrument)
                .await
                .unwrap_or(trade.entry_price);
            let pnl = reconciler::realized_pnl_pct(&trade, exit_price, &FeeSchedule::default());
            store
                .close_trade(trade_id, exit_price, pnl, TradeOutcome::Manual)
                .await?;
            notifier
                .send_message(&format!(
                    "*Closed manually* — {} #{}\nExit: {:.2} | PnL: {:+.2}%",
                    trade.instrument, trade_id, exit_price, pnl
                ))
                .await?;
            if let Err(e) = learning.on_trade_closed(trade_id).await {
                tracing::error!("learning failed for trade #{}: {}", trade_id, e);
            }
        }
        AgentCommand::CancelOrders(instrument) => {
            exchange.cancel_all_orders(&instrument).await?;
            notifier
                .send_message(&format!("Cancelled resting orders on {}", instrument))
                .await?;
        }
        AgentCommand::ResetKillSwitch => {
            store.clear_halt().await?;
            tracing::warn!("kill switch reset by operator");
            notifier
                .send_message("Kill switch cleared. Trading resumes on the next signal.")
                .await?;
        }
    }
    Ok(())
}
