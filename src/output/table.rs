use chrono::{DateTime, Utc};
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};

use crate::db::models::{SubscriptionState, SubscriptionView};
use crate::subscriptions::TickReport;

const ID_WIDTH: usize = 38;
const RESOURCE_WIDTH: usize = 44;
const CHANGE_WIDTH: usize = 16;
const STATE_WIDTH: usize = 11;
const EXPIRES_WIDTH: usize = 12;

pub fn format_subscriptions(subscriptions: &[SubscriptionView]) -> String {
    if subscriptions.is_empty() {
        return "No subscriptions found.".to_string();
    }

    let now = Utc::now();
    let mut out = String::new();
    out.push_str(&format!(
        "{:<id$}  {:<resource$}  {:<change$}  {:<state$}  {:<expires$}\n",
        "ID",
        "Resource",
        "Change",
        "State",
        "Expires",
        id = ID_WIDTH,
        resource = RESOURCE_WIDTH,
        change = CHANGE_WIDTH,
        state = STATE_WIDTH,
        expires = EXPIRES_WIDTH
    ));
    out.push_str(&format!(
        "{}  {}  {}  {}  {}\n",
        "-".repeat(ID_WIDTH),
        "-".repeat(RESOURCE_WIDTH),
        "-".repeat(CHANGE_WIDTH),
        "-".repeat(STATE_WIDTH),
        "-".repeat(EXPIRES_WIDTH)
    ));

    for subscription in subscriptions {
        out.push_str(&format!(
            "{:<id$}  {:<resource$}  {:<change$}  {:<state$}  {:<expires$}\n",
            pad_to_width(&truncate_for_width(&subscription.id, ID_WIDTH), ID_WIDTH),
            pad_to_width(&truncate_for_width(&subscription.resource, RESOURCE_WIDTH), RESOURCE_WIDTH),
            truncate_for_width(&subscription.change_type, CHANGE_WIDTH),
            colorize_state(subscription.state, STATE_WIDTH),
            truncate_for_width(&relative_to(subscription.expires_at, now), EXPIRES_WIDTH),
            id = ID_WIDTH,
            resource = RESOURCE_WIDTH,
            change = CHANGE_WIDTH,
            state = STATE_WIDTH,
            expires = EXPIRES_WIDTH
        ));
    }

    out
}

pub fn format_subscription(subscription: &SubscriptionView) -> String {
    let now = Utc::now();
    let mut out = String::new();
    out.push_str(&format!("ID: {}\n", subscription.id));
    out.push_str(&format!("Resource: {}\n", subscription.resource));
    out.push_str(&format!("Change type: {}\n", subscription.change_type));
    out.push_str(&format!(
        "State: {}\n",
        colorize_state(subscription.state, 0)
    ));
    out.push_str(&format!("Notification URL: {}\n", subscription.notification_url));
    out.push_str(&format!(
        "Expires: {} ({})\n",
        subscription.expires_at.to_rfc3339(),
        relative_to(subscription.expires_at, now)
    ));
    out.push_str(&format!("Created: {}\n", subscription.created_at.to_rfc3339()));
    out.push_str(&format!("Lifetime: {}m\n", subscription.lifetime_minutes));

    if subscription.renewal_attempts > 0 {
        out.push_str(&format!(
            "Failed renewal attempts: {}\n",
            subscription.renewal_attempts
        ));
    }
    if let Some(next) = subscription.next_renewal_at {
        out.push_str(&format!("Next renewal: {}\n", relative_to(next, now)));
    }
    if let Some(error) = &subscription.last_error {
        out.push_str(&format!("Last error: {error}\n"));
    }
    out
}

pub fn format_tick_report(report: &TickReport) -> String {
    if report.is_quiet() {
        return "Nothing to do.".to_string();
    }

    let mut out = String::new();
    out.push_str("Renewal tick\n");
    out.push_str("============\n");
    let sections: [(&str, &[String]); 9] = [
        ("Renewed", &report.renewed),
        ("Marked due", &report.marked_due),
        ("Retrying", &report.retrying),
        ("Failed", &report.failed),
        ("Expired", &report.expired),
        ("In flight", &report.skipped_in_flight),
        ("Reclaimed", &report.reclaimed),
        ("Abandoned pending", &report.abandoned_pending),
        ("Errors", &report.errors),
    ];
    for (label, ids) in sections {
        if ids.is_empty() {
            continue;
        }
        out.push_str(&format!("{label}: {}\n", ids.len()));
        for id in ids {
            out.push_str(&format!("  {id}\n"));
        }
    }

    let alerts = report.alerts();
    if !alerts.is_empty() {
        out.push_str(&format!(
            "\u{1b}[31mALERT: coverage lost for {}\u{1b}[0m\n",
            alerts.join(", ")
        ));
    }
    out
}

fn colorize_state(state: SubscriptionState, width: usize) -> String {
    let label = format!("{:<width$}", state.to_string(), width = width);
    match state {
        SubscriptionState::Active => format!("\u{1b}[32m{label}\u{1b}[0m"),
        SubscriptionState::RenewalDue | SubscriptionState::Renewing | SubscriptionState::Pending => {
            format!("\u{1b}[33m{label}\u{1b}[0m")
        }
        SubscriptionState::Expired | SubscriptionState::Failed => {
            format!("\u{1b}[31m{label}\u{1b}[0m")
        }
    }
}

fn relative_to(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = at.signed_duration_since(now);
    let (magnitude, future) = if delta.num_seconds() >= 0 {
        (delta, true)
    } else {
        (-delta, false)
    };

    let span = if magnitude.num_minutes() < 1 {
        return if future { "now".to_string() } else { "just now".to_string() };
    } else if magnitude.num_hours() < 1 {
        format!("{}m", magnitude.num_minutes())
    } else if magnitude.num_hours() < 48 {
        format!("{}h{}m", magnitude.num_hours(), magnitude.num_minutes() % 60)
    } else if magnitude.num_days() < 14 {
        format!("{}d", magnitude.num_days())
    } else {
        return at.format("%Y-%m-%d").to_string();
    };

    if future {
        format!("in {span}")
    } else {
        format!("{span} ago")
    }
}

fn pad_to_width(value: &str, width: usize) -> String {
    let current = UnicodeWidthStr::width(value);
    if current >= width {
        return value.to_string();
    }
    format!("{value}{}", " ".repeat(width - current))
}

fn truncate_for_width(value: &str, max_width: usize) -> String {
    if UnicodeWidthStr::width(value) <= max_width {
        return value.to_string();
    }

    if max_width <= 1 {
        return "…".to_string();
    }

    let mut out = String::new();
    let mut width = 0usize;
    for c in value.chars() {
        let cw = UnicodeWidthChar::width(c).unwrap_or(0);
        if width + cw + 1 > max_width {
            break;
        }
        out.push(c);
        width += cw;
    }
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use crate::db::models::{SubscriptionState, SubscriptionView};
    use crate::subscriptions::TickReport;

    use super::{format_subscription, format_subscriptions, format_tick_report, relative_to, truncate_for_width};

    fn sample_view() -> SubscriptionView {
        let now = Utc::now();
        SubscriptionView {
            id: "7f105c7d-2dc5-4530-97cd-4e7ae6534c07".to_string(),
            resource: "/users/a-rather-long-mailbox-name@example.com/mailFolders('Inbox')/messages".to_string(),
            change_type: "created".to_string(),
            notification_url: "https://hooks.example.com/outlook-notify".to_string(),
            expires_at: now + Duration::minutes(90),
            state: SubscriptionState::RenewalDue,
            created_at: now - Duration::days(2),
            lifetime_minutes: 4200,
            renewal_attempts: 2,
            next_renewal_at: Some(now + Duration::minutes(1)),
            last_error: Some("graph responded with status=503".to_string()),
        }
    }

    #[test]
    fn subscription_table_has_headers_and_truncates() {
        let rendered = format_subscriptions(&[sample_view()]);
        assert!(rendered.contains("Resource"));
        assert!(rendered.contains("Expires"));
        assert!(rendered.contains('…'));
        assert!(rendered.contains("renewal_due"));
    }

    #[test]
    fn subscription_detail_shows_renewal_diagnostics() {
        let rendered = format_subscription(&sample_view());
        assert!(rendered.contains("Failed renewal attempts: 2"));
        assert!(rendered.contains("Last error: graph responded with status=503"));
    }

    #[test]
    fn tick_report_flags_alerts() {
        let report = TickReport {
            failed: vec!["sub-9".to_string()],
            ..TickReport::default()
        };
        let rendered = format_tick_report(&report);
        assert!(rendered.contains("Failed: 1"));
        assert!(rendered.contains("ALERT"));
        assert_eq!(format_tick_report(&TickReport::default()), "Nothing to do.");
    }

    #[test]
    fn relative_times_read_naturally() {
        let now = Utc.with_ymd_and_hms(2026, 4, 1, 12, 0, 0).unwrap();
        assert_eq!(relative_to(now + Duration::minutes(42), now), "in 42m");
        assert_eq!(relative_to(now - Duration::minutes(90), now), "1h30m ago");
        assert_eq!(relative_to(now + Duration::days(3), now), "in 3d");
        assert_eq!(truncate_for_width("abcdef", 4), "abc…");
    }
}
