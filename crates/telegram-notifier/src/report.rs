use anyhow::Result;

use crate::notifier::TelegramNotifier;

#[derive(Debug, Default)]
pub struct DailyReport {
    pub date: String,
    pub trade_count: usize,
    pub win_rate: f64,
    pub daily_pnl_pct: f64,
    pub cumulative_pnl_pct: f64,
    pub open_positions: usize,
    pub best_trade: Option<(String, f64)>,
    pub worst_trade: Option<(String, f64)>,
    pub decisions_executed: i64,
    pub decisions_rejected: i64,
    pub decisions_skipped: i64,
    pub halted: bool,
}

impl TelegramNotifier {
    pub async fn send_daily_report(&self, report: &DailyReport) -> Result<()> {
        let best = report
            .best_trade
            .as_ref()
            .map(|(i, p)| format!("{} ({:+.2}%)", i, p))
            .unwrap_or_else(|| "—".to_string());
        let worst = report
            .worst_trade
            .as_ref()
            .map(|(i, p)| format!("{} ({:+.2}%)", i, p))
            .unwrap_or_else(|| "—".to_string());

        let message = format!(
            "*Daily Report — {}*\n\n\
             Trades: {} | Win rate: {:.1}%\n\
             Daily PnL: {:+.2}% | Cumulative: {:+.2}%\n\
             Open positions: {}\n\
             Best: {} | Worst: {}\n\
             Decisions: {} executed, {} rejected, {} skipped{}",
            report.date,
            report.trade_count,
            report.win_rate * 100.0,
            report.daily_pnl_pct,
            report.cumulative_pnl_pct,
            report.open_positions,
            best,
            worst,
            report.decisions_executed,
            report.decisions_rejected,
            report.decisions_skipped,
            if report.halted {
                "\n\nTRADING HALTED — /reset_killswitch to resume"
            } else {
                ""
            }
        );

        self.send_message(&message).await
    }
}
