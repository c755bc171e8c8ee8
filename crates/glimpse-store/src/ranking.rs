//! Ranked failure summaries for compact run reports.
//!
//! Privacy rules: no response bodies, and URLs are stripped of query and
//! fragment parts before they leave this module.

use glimpse_core::ids::SessionId;
use glimpse_core::truncate::truncate_with_ellipsis;
use serde::Serialize;
use serde_json::Value;
use url::Url;

use crate::run_events::{RunEvent, RunEventKind, RunEventQuery, RunEventStore};

const MAX_RANKED_ITEMS: usize = 10;
const MAX_SUMMARY_LEN: usize = 400;
const MAX_URL_LEN: usize = 1000;

const NOISE_ERROR_SUBSTRINGS: &[&str] = &[
    "net::err_blocked_by_client",
    "err_blocked_by_client",
    "blocked_by_client",
    "blocked by client",
];

const NOISE_HOST_SUBSTRINGS: &[&str] = &[
    "doubleclick.net",
    "googletagmanager.com",
    "google-analytics.com",
    "googlesyndication.com",
    "sentry.io",
    "stats.g.doubleclick.net",
];

const NOISE_PATH_SUBSTRINGS: &[&str] = &[
    "/collect",
    "/analytics",
    "/beacon",
    "/cdn-cgi/beacon",
    "/cdn-cgi/rum",
    "/cdn-cgi/trace",
    "/pixel",
];

/// Outcome judgement attached to a finished driver run.
#[derive(Clone, Debug, Default)]
pub struct Judgement {
    pub failure_reason: Option<String>,
    pub reached_captcha: bool,
    pub impossible_task: bool,
}

/// Driver-side failure inputs: free-form step errors plus an optional
/// final judgement.
#[derive(Clone, Debug, Default)]
pub struct DriverReport {
    pub errors: Vec<String>,
    pub judgement: Option<Judgement>,
}

/// One ranked failure, already scrubbed for public output.
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct RankedFailure {
    #[serde(rename = "type")]
    pub kind: String,
    pub summary: String,
    pub step: Option<u32>,
    pub url: Option<String>,
}

struct Candidate {
    score: i32,
    failure: RankedFailure,
}

/// Strip query and fragment; reject URLs with no scheme or host.
fn safe_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match Url::parse(raw) {
        Ok(parsed) if parsed.has_host() => {
            let mut stripped = parsed;
            stripped.set_query(None);
            stripped.set_fragment(None);
            Some(truncate_with_ellipsis(stripped.as_str(), MAX_URL_LEN))
        }
        _ => Some(truncate_with_ellipsis(raw, MAX_URL_LEN)),
    }
}

fn host_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

fn is_noise_network(url: Option<&str>, error: Option<&str>) -> bool {
    let url_value = url.unwrap_or("").to_ascii_lowercase();
    let error_value = error.unwrap_or("").to_ascii_lowercase();
    if NOISE_ERROR_SUBSTRINGS.iter().any(|t| error_value.contains(t)) {
        return true;
    }
    if NOISE_PATH_SUBSTRINGS.iter().any(|t| url_value.contains(t)) {
        return true;
    }
    if let Some(host) = host_of(&url_value) {
        if NOISE_HOST_SUBSTRINGS.iter().any(|t| host.contains(t)) {
            return true;
        }
    }
    false
}

fn detail_str<'a>(details: Option<&'a Value>, key: &str) -> Option<&'a str> {
    details?.get(key)?.as_str()
}

fn detail_u32(details: Option<&Value>, key: &str) -> Option<u32> {
    let value = details?.get(key)?;
    match value {
        Value::Number(n) => n.as_u64().and_then(|v| u32::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Latest agent step context at or before `timestamp`.
fn nearest_step_context(
    timeline: &[(f64, Option<u32>, Option<String>)],
    timestamp: f64,
) -> (Option<u32>, Option<String>) {
    let mut chosen: (Option<u32>, Option<String>) = (None, None);
    for (ts, step, url) in timeline {
        if *ts > timestamp {
            break;
        }
        chosen = (*step, url.clone());
    }
    chosen
}

fn score_console(event: &RunEvent) -> Option<(i32, String)> {
    let level = detail_str(event.details.as_ref(), "level")
        .unwrap_or("")
        .to_ascii_lowercase();
    let message = event.summary.trim();
    let summary = format!("{level}: {message}");
    let summary = summary.trim_matches([':', ' ']).to_string();
    if summary.is_empty() {
        return None;
    }
    let mut score = 70;
    if level == "exception" || level == "fatal" {
        score += 40;
    }
    let lowered = summary.to_ascii_lowercase();
    if NOISE_ERROR_SUBSTRINGS.iter().any(|t| lowered.contains(t)) {
        score -= 80;
    }
    Some((score, summary))
}

fn score_network(
    event: &RunEvent,
    base_host: Option<&str>,
    url_ctx: Option<&str>,
) -> Option<(i32, String, Option<String>)> {
    let details = event.details.as_ref();
    let url = detail_str(details, "url").unwrap_or("");
    let method = detail_str(details, "method").unwrap_or("");
    let status = details
        .and_then(|d| d.get("status"))
        .and_then(Value::as_u64);
    let error = detail_str(details, "error")
        .map(str::trim)
        .filter(|e| !e.is_empty());

    let url_safe = safe_url(url).or_else(|| url_ctx.map(str::to_string));
    let host = url_safe.as_deref().and_then(host_of);
    let same_origin = matches!((base_host, host.as_deref()), (Some(a), Some(b)) if a == b);

    let mut score = 60;
    match status {
        Some(s) if s >= 500 => score += 80,
        Some(s) if s >= 400 => score += 30,
        _ => {}
    }
    if error.is_some() {
        score += 40;
    }
    score += if same_origin { 25 } else { -5 };
    if is_noise_network(url_safe.as_deref(), error) {
        score -= 90;
    }

    let mut extra = String::new();
    if let Some(status) = status {
        extra.push_str(&status.to_string());
    }
    if let Some(error) = error {
        if !extra.is_empty() {
            extra.push(' ');
        }
        extra.push_str(error);
    }
    let target = url_safe.as_deref().unwrap_or(url);
    let mut summary = format!("{method} {target}").trim().to_string();
    if !extra.is_empty() {
        summary = format!("{summary} ({extra})");
    }
    if summary.is_empty() {
        return None;
    }
    Some((score, summary, url_safe))
}

/// Rank the most actionable failures for a session: run events scored by
/// severity and origin, driver errors, and the final judgement. Output is
/// deduplicated by summary and capped at `max_items` (hard limit 10).
pub fn rank_failures(
    run_events: &RunEventStore,
    session_id: &SessionId,
    base_url: Option<&str>,
    report: Option<&DriverReport>,
    max_items: usize,
) -> Vec<RankedFailure> {
    let limit = max_items.min(MAX_RANKED_ITEMS);
    if limit == 0 {
        return Vec::new();
    }

    let base_host = base_url.and_then(host_of);
    let page = run_events.query(&RunEventQuery {
        session_id: Some(session_id.clone()),
        last_n: 250,
        kinds: None,
        from_timestamp: None,
        has_error: None,
        include_details: true,
    });

    // Query results are newest-first; the timeline wants oldest-first.
    let mut timeline: Vec<(f64, Option<u32>, Option<String>)> = Vec::new();
    for event in page.events.iter().rev() {
        if event.kind != RunEventKind::Agent {
            continue;
        }
        let details = event.details.as_ref();
        timeline.push((
            event.timestamp,
            detail_u32(details, "step"),
            detail_str(details, "url").map(str::to_string),
        ));
    }

    let mut candidates: Vec<Candidate> = Vec::new();
    let mut seen: Vec<String> = Vec::new();
    let mut push = |candidates: &mut Vec<Candidate>,
                    seen: &mut Vec<String>,
                    score: i32,
                    kind: &str,
                    summary: String,
                    step: Option<u32>,
                    url: Option<String>| {
        if summary.is_empty() || seen.contains(&summary) {
            return;
        }
        seen.push(summary.clone());
        candidates.push(Candidate {
            score,
            failure: RankedFailure {
                kind: kind.to_string(),
                summary,
                step,
                url,
            },
        });
    };

    for event in &page.events {
        if !event.has_error {
            continue;
        }
        let (step_ctx, url_ctx) = nearest_step_context(&timeline, event.timestamp);
        match event.kind {
            RunEventKind::Console => {
                if let Some((score, summary)) = score_console(event) {
                    push(
                        &mut candidates,
                        &mut seen,
                        score,
                        "console",
                        summary,
                        step_ctx,
                        url_ctx,
                    );
                }
            }
            RunEventKind::Network => {
                if let Some((score, summary, url_safe)) =
                    score_network(event, base_host.as_deref(), url_ctx.as_deref())
                {
                    push(
                        &mut candidates,
                        &mut seen,
                        score,
                        "network",
                        summary,
                        step_ctx,
                        url_safe.or(url_ctx),
                    );
                }
            }
            RunEventKind::Agent => {}
        }
    }

    if let Some(report) = report {
        let base_safe = base_url.and_then(safe_url);
        for err in &report.errors {
            let text = err.trim();
            if text.is_empty() {
                continue;
            }
            let mut score = 85;
            let lowered = text.to_ascii_lowercase();
            if lowered.contains("timeout") {
                score += 10;
            }
            if lowered.contains("captcha") || lowered.contains("bot") {
                score += 20;
            }
            push(
                &mut candidates,
                &mut seen,
                score,
                "agent",
                text.to_string(),
                None,
                base_safe.clone(),
            );
            if candidates.len() >= 50 {
                break;
            }
        }

        if let Some(judgement) = &report.judgement {
            if let Some(reason) = judgement
                .failure_reason
                .as_deref()
                .map(str::trim)
                .filter(|r| !r.is_empty())
            {
                push(
                    &mut candidates,
                    &mut seen,
                    120,
                    "judge",
                    format!("judge: {reason}"),
                    None,
                    base_safe.clone(),
                );
            }
            if judgement.reached_captcha {
                push(
                    &mut candidates,
                    &mut seen,
                    120,
                    "judge",
                    "judge: reached_captcha".to_string(),
                    None,
                    base_safe.clone(),
                );
            }
            if judgement.impossible_task {
                push(
                    &mut candidates,
                    &mut seen,
                    120,
                    "judge",
                    "judge: impossible_task".to_string(),
                    None,
                    base_safe.clone(),
                );
            }
        }
    }

    candidates.sort_by_key(|c| std::cmp::Reverse(c.score));
    candidates
        .into_iter()
        .take(limit)
        .map(|mut c| {
            c.failure.summary = truncate_with_ellipsis(&c.failure.summary, MAX_SUMMARY_LEN);
            c.failure.url = c.failure.url.as_deref().and_then(safe_url);
            c.failure
        })
        .collect()
}
