use anyhow::Result;

use crate::db::models::SubscriptionView;
use crate::subscriptions::TickReport;

pub fn format_subscriptions(subscriptions: &[SubscriptionView]) -> Result<String> {
    Ok(serde_json::to_string_pretty(subscriptions)?)
}

pub fn format_subscription(subscription: &SubscriptionView) -> Result<String> {
    Ok(serde_json::to_string_pretty(subscription)?)
}

pub fn format_tick_report(report: &TickReport) -> Result<String> {
    Ok(serde_json::to_string_pretty(report)?)
}
