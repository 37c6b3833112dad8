mod api;
pub mod commands;
mod notifier;
pub mod report;

pub use commands::AgentCommand;
pub use notifier::{ConfirmationOutcome, InboundEvent, TelegramNotifier};
pub use report::DailyReport;
