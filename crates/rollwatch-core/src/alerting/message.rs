//! Alert message text

/// `95` -> `95th`, `50.1` -> `50.1st`, `12` -> `12th`
pub fn percentile_with_suffix(percentile: f64) -> String {
    let text = format!("{percentile}");
    let suffix = if text.ends_with("11") || text.ends_with("12") || text.ends_with("13") {
        "th"
    } else {
        match text.chars().last() {
            Some('1') => "st",
            Some('2') => "nd",
            Some('3') => "rd",
            _ => "th",
        }
    };
    format!("{text}{suffix}")
}

/// `"{prefix}[ - scope] - {subject}[ - OK]"`
pub fn subject(prefix: &str, agent_scope: &str, what: &str, ok: bool) -> String {
    let mut subject = prefix.to_string();
    if !agent_scope.is_empty() {
        subject.push_str(" - ");
        subject.push_str(agent_scope);
    }
    subject.push_str(" - ");
    subject.push_str(what);
    if ok {
        subject.push_str(" - OK");
    }
    subject
}

/// Body of a transaction percentile alert mail
pub fn transaction_body(
    percentile: f64,
    time_period_seconds: u64,
    observed_nanos: u64,
    transaction_count: u64,
) -> String {
    let minutes = time_period_seconds / 60;
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let millis = (observed_nanos as f64 / 1_000_000.0).round() as u64;
    format!(
        "{} percentile over the last {minutes} minutes was {millis} milliseconds.\n\n\
         Total transaction count over the last {minutes} minutes was {transaction_count}.",
        percentile_with_suffix(percentile)
    )
}

/// Body of a gauge average alert mail
pub fn gauge_body(time_period_seconds: u64, average: f64, unit: Option<&str>) -> String {
    let minutes = time_period_seconds / 60;
    // Debug keeps a fractional digit: 500.0 rather than 500
    let mut body = format!("Average over the last {minutes} minutes was {average:?}");
    if let Some(unit) = unit {
        body.push(' ');
        body.push_str(unit);
    }
    body.push_str(".\n\n");
    body
}
