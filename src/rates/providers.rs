//! Rate providers: primary date-ranged JSON API and HTML-table fallback.
//!
//! ## Why a date range?
//!
//! Reference rates are published on trading days only. Querying
//! `[date-3d, date]` and taking the most recent entry bridges weekends and
//! bank holidays without the caller having to know the publication
//! calendar: a Sunday transaction resolves to Friday's rate.
//!
//! The fallback provider serves rates embedded in an HTML page. Scraping is
//! brittle by nature, so its parser is a standalone pure function with its
//! own tests; a layout change breaks one regex, not the resolver contract.

use super::RateKey;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::debug;

/// A single provider tier failing. Internal: the resolver converts the
/// final failure into [`crate::error::LedgerLensError::RateNotFound`].
#[derive(Debug, Error)]
pub(crate) enum ProviderError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("no rate for the requested currency in the response")]
    Empty,
}

/// Payload of the primary provider: rates keyed by ISO date, then by
/// currency code. ISO dates sort lexicographically in calendar order, so a
/// `BTreeMap` keeps the range ordered for free.
#[derive(Debug, Deserialize)]
pub(crate) struct RangeResponse {
    pub rates: BTreeMap<String, HashMap<String, f64>>,
}

/// Most recent in-range rate for `to`, scanning newest day first.
pub(crate) fn most_recent_rate(response: &RangeResponse, to: &str) -> Option<f64> {
    response
        .rates
        .iter()
        .rev()
        .find_map(|(_, day)| day.get(to).copied())
}

/// Query the primary JSON provider over `[date-3d, date]`.
pub(crate) async fn fetch_primary(
    client: &reqwest::Client,
    base_url: &str,
    key: &RateKey,
) -> Result<f64, ProviderError> {
    let start = key.date - chrono::Duration::days(3);
    let url = format!(
        "{}/{}..{}?from={}&to={}",
        base_url.trim_end_matches('/'),
        start.format("%Y-%m-%d"),
        key.date.format("%Y-%m-%d"),
        key.from,
        key.to,
    );
    debug!("Primary rate lookup: {}", url);

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| ProviderError::Request(e.to_string()))?;
    if !response.status().is_success() {
        return Err(ProviderError::Status(response.status().as_u16()));
    }

    let body: RangeResponse = response
        .json()
        .await
        .map_err(|e| ProviderError::Request(e.to_string()))?;

    most_recent_rate(&body, &key.to).ok_or(ProviderError::Empty)
}

/// Matches one `<td>CODE</td><td>rate</td>` pair in the fallback page.
static RATE_ROW_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<td[^>]*>\s*([A-Z]{3})\s*</td>\s*<td[^>]*>\s*([0-9]+(?:\.[0-9]+)?)\s*</td>")
        .expect("rate row regex is valid")
});

/// Extract every `(currency, rate)` pair embedded in the fallback HTML.
pub(crate) fn parse_rate_table(html: &str) -> HashMap<String, f64> {
    RATE_ROW_RE
        .captures_iter(html)
        .filter_map(|cap| {
            let code = cap.get(1)?.as_str().to_string();
            let rate: f64 = cap.get(2)?.as_str().parse().ok()?;
            Some((code, rate))
        })
        .collect()
}

/// Query the fallback HTML provider and locate the target currency.
///
/// The URL template substitutes `{from}`, `{to}`, and `{date}` literally.
pub(crate) async fn fetch_fallback(
    client: &reqwest::Client,
    url_template: &str,
    key: &RateKey,
) -> Result<f64, ProviderError> {
    let url = url_template
        .replace("{from}", &key.from)
        .replace("{to}", &key.to)
        .replace("{date}", &key.date.format("%Y-%m-%d").to_string());
    debug!("Fallback rate lookup: {}", url);

    let response = client
        .get(&url)
        .send()
        .await
        .map_err(|e| ProviderError::Request(e.to_string()))?;
    if !response.status().is_success() {
        return Err(ProviderError::Status(response.status().as_u16()));
    }

    let html = response
        .text()
        .await
        .map_err(|e| ProviderError::Request(e.to_string()))?;

    parse_rate_table(&html)
        .get(&key.to)
        .copied()
        .ok_or(ProviderError::Empty)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(days: &[(&str, &[(&str, f64)])]) -> RangeResponse {
        RangeResponse {
            rates: days
                .iter()
                .map(|(date, pairs)| {
                    (
                        date.to_string(),
                        pairs.iter().map(|(c, r)| (c.to_string(), *r)).collect(),
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn most_recent_entry_wins() {
        let response = range(&[
            ("2024-02-29", &[("EUR", 1.01)]),
            ("2024-03-01", &[("EUR", 1.04)]),
        ]);
        assert_eq!(most_recent_rate(&response, "EUR"), Some(1.04));
    }

    #[test]
    fn skips_days_missing_the_target_currency() {
        let response = range(&[
            ("2024-02-29", &[("EUR", 1.01)]),
            ("2024-03-01", &[("GBP", 0.85)]),
        ]);
        assert_eq!(most_recent_rate(&response, "EUR"), Some(1.01));
    }

    #[test]
    fn empty_range_is_a_miss() {
        let response = range(&[]);
        assert_eq!(most_recent_rate(&response, "EUR"), None);
    }

    #[test]
    fn parses_rate_rows_from_html() {
        let html = r#"
            <table class="rates">
              <tr><td>EUR</td><td>1.0421</td></tr>
              <tr><td class="code">GBP</td><td class="val"> 0.8534 </td></tr>
              <tr><td>not a code</td><td>1.0</td></tr>
            </table>
        "#;
        let table = parse_rate_table(html);
        assert_eq!(table.get("EUR"), Some(&1.0421));
        assert_eq!(table.get("GBP"), Some(&0.8534));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn parses_rows_split_across_lines() {
        let html = "<td>JPY</td>\n  <td>163.2</td>";
        let table = parse_rate_table(html);
        assert_eq!(table.get("JPY"), Some(&163.2));
    }

    #[test]
    fn garbage_html_yields_empty_table() {
        assert!(parse_rate_table("<html><body>maintenance</body></html>").is_empty());
    }
}
