//! Scrapes Prometheus exporters and converts the text exposition format
//! into JSON.

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One sample of a metric family.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    pub value: f64,
}

/// Metric name to all samples scraped for it, in exposition order.
pub type Scrape = BTreeMap<String, Vec<Sample>>;

/// Fetches `url` and parses the exposition body.
///
/// # Errors
///
/// Returns an error on transport failures, non-2xx responses and
/// cancellation.
pub async fn scrape(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Scrape> {
    let request = async {
        let resp = client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("failed to reach exporter {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            bail!("exporter {url} returned HTTP {}", status.as_u16());
        }
        resp.text()
            .await
            .with_context(|| format!("failed to read exporter body from {url}"))
    };

    let body = tokio::select! {
        _ = cancel.cancelled() => bail!("scrape of {url} cancelled"),
        body = request => body?,
    };
    Ok(parse_exposition(&body))
}

/// Parses the Prometheus text exposition format.
///
/// Comment, `# HELP` and `# TYPE` lines are skipped, as are lines that do
/// not parse. Timestamps after the value are ignored.
pub fn parse_exposition(body: &str) -> Scrape {
    let mut out: Scrape = BTreeMap::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match parse_line(line) {
            Some((name, sample)) => out.entry(name).or_default().push(sample),
            None => tracing::trace!(line, "Skipping malformed exposition line"),
        }
    }
    out
}

fn parse_line(line: &str) -> Option<(String, Sample)> {
    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .unwrap_or(line.len());
    let name = &line[..name_end];
    if name.is_empty() {
        return None;
    }

    let mut rest = &line[name_end..];
    let mut labels = BTreeMap::new();
    if rest.starts_with('{') {
        let (parsed, after) = parse_labels(&rest[1..])?;
        labels = parsed;
        rest = after;
    }

    let value = rest.split_whitespace().next()?;
    let value = parse_value(value)?;
    Some((name.to_string(), Sample { labels, value }))
}

/// Parses `key="value",...}` and returns the labels plus the remainder after
/// the closing brace.
fn parse_labels(mut s: &str) -> Option<(BTreeMap<String, String>, &str)> {
    let mut labels = BTreeMap::new();
    loop {
        s = s.trim_start();
        if let Some(after) = s.strip_prefix('}') {
            return Some((labels, after));
        }
        let eq = s.find('=')?;
        let key = s[..eq].trim().to_string();
        s = s[eq + 1..].trim_start().strip_prefix('"')?;

        let mut value = String::new();
        let mut chars = s.char_indices();
        let end = loop {
            let (i, c) = chars.next()?;
            match c {
                '\\' => match chars.next()?.1 {
                    'n' => value.push('\n'),
                    other => value.push(other),
                },
                '"' => break i,
                other => value.push(other),
            }
        };
        labels.insert(key, value);

        s = s[end + 1..].trim_start();
        if let Some(after) = s.strip_prefix(',') {
            s = after;
        }
    }
}

fn parse_value(raw: &str) -> Option<f64> {
    match raw {
        "+Inf" | "Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        "NaN" => Some(f64::NAN),
        other => other.parse().ok(),
    }
}
