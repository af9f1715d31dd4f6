pub mod json;
pub mod table;

use anyhow::Result;

use crate::db::models::SubscriptionView;
use crate::subscriptions::TickReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            Self::Json
        } else {
            Self::Table
        }
    }
}

pub fn format_subscriptions(format: OutputFormat, subscriptions: &[SubscriptionView]) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_subscriptions(subscriptions)),
        OutputFormat::Json => json::format_subscriptions(subscriptions),
    }
}

pub fn format_subscription(format: OutputFormat, subscription: &SubscriptionView) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_subscription(subscription)),
        OutputFormat::Json => json::format_subscription(subscription),
    }
}

pub fn format_tick_report(format: OutputFormat, report: &TickReport) -> Result<String> {
    match format {
        OutputFormat::Table => Ok(table::format_tick_report(report)),
        OutputFormat::Json => json::format_tick_report(report),
    }
}
