use axum::{
    Json,
    extract::{Query, State},
};
use chrono::{Duration, Local, NaiveDate};
use serde::Deserialize;

use crate::config::DEFAULT_DATE_RANGE_DAYS;
use crate::error::{SimdexError, SimdexResult};
use crate::query::SearchPayload;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub query: Option<String>,
    pub k: Option<usize>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub rerank_by_doc: Option<String>,
}

/// `GET /search` — one query, k ranked hits within a date window.
///
/// `end_date` defaults to today (future dates are clamped back to today) and
/// `start_date` to 60 days before `end_date`; the pool further caps the
/// window at 180 days.
pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> SimdexResult<Json<SearchPayload>> {
    let query = params
        .query
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| {
            SimdexError::BadRequest(
                "the service is not able to process empty queries".to_string(),
            )
        })?
        .to_string();

    let k = params.k.unwrap_or(10);
    let today = Local::now().date_naive();
    let end_date = match &params.end_date {
        Some(raw) => parse_date(raw)?.min(today),
        None => today,
    };
    let start_date = match &params.start_date {
        Some(raw) => parse_date(raw)?,
        None => end_date - Duration::days(DEFAULT_DATE_RANGE_DAYS),
    };
    if start_date > end_date {
        return Err(SimdexError::BadRequest(
            "start date must occur before end date".to_string(),
        ));
    }

    let rerank_by_doc = params
        .rerank_by_doc
        .as_deref()
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));

    // The pipeline blocks on the embedding RPC and the worker drain.
    let processor = state.processor.clone();
    let payload = tokio::task::spawn_blocking(move || {
        processor.query_corpus(&query, k, start_date, end_date, rerank_by_doc)
    })
    .await
    .map_err(|e| SimdexError::Internal(anyhow::anyhow!("search task failed: {e}")))??;

    Ok(Json(payload))
}

fn parse_date(raw: &str) -> SimdexResult<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| SimdexError::BadRequest(format!("invalid date: {raw} (expected YYYY-MM-DD)")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_date() {
        assert_eq!(
            parse_date("2024-02-10").unwrap(),
            NaiveDate::from_ymd_opt(2024, 2, 10).unwrap()
        );
        assert!(parse_date("02/10/2024").is_err());
        assert!(parse_date("").is_err());
    }
}
