//! Record store backed by a managed REST backend
//!
//! Speaks the PostgREST dialect used by hosted Postgres services:
//! - POST /attendance?on_conflict=student_id,route_execution_id
//! - POST /bus_locations?on_conflict=bus_id,captured_at
//! - GET  /route_roster?route_id=eq.<id>&order=sequence_index.asc
//!
//! Upserts send `Prefer: resolution=ignore-duplicates`, so replaying a write
//! after a lost acknowledgement leaves the stored row untouched.

use crate::domain::types::{RouteId, StudentRouteEntry};
use crate::infra::error::{StoreError, StoreResult};
use crate::io::record_store::{
    route_entries, AttendanceRecord, LocationRecord, RecordStore, RosterRow, WriteOutcome,
};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

const ATTENDANCE_TABLE: &str = "attendance";
const LOCATION_TABLE: &str = "bus_locations";
const ROSTER_VIEW: &str = "route_roster";

pub struct HttpRecordStore {
    client: reqwest::Client,
    base_url: String,
    default_radius_m: f64,
}

impl HttpRecordStore {
    pub fn new(
        base_url: &str,
        api_key: Option<&str>,
        timeout: Duration,
        default_radius_m: f64,
    ) -> StoreResult<Self> {
        let mut headers = HeaderMap::new();
        if let Some(key) = api_key {
            let bearer = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| StoreError::Http(format!("invalid api key header: {e}")))?;
            headers.insert(AUTHORIZATION, bearer);
            let apikey = HeaderValue::from_str(key)
                .map_err(|e| StoreError::Http(format!("invalid api key header: {e}")))?;
            headers.insert("apikey", apikey);
        }

        // Create HTTP client once for reuse (connection pooling)
        let client = reqwest::Client::builder().timeout(timeout).default_headers(headers).build()?;
        let base_url = base_url.trim_end_matches('/').to_string();
        info!(base_url = %base_url, "http_store_initialized");

        Ok(Self { client, base_url, default_radius_m })
    }

    async fn upsert<T: Serialize + Sync>(
        &self,
        table: &str,
        conflict_keys: &str,
        record: &T,
    ) -> StoreResult<WriteOutcome> {
        let body = serde_json::to_vec(record)?;
        let url = format!("{}/{table}?on_conflict={conflict_keys}", self.base_url);
        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/json")
            .header("Prefer", "resolution=ignore-duplicates,return=minimal")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        debug!(table = %table, status = %status.as_u16(), "http_store_upsert");
        if status.is_success() {
            return Ok(WriteOutcome::Created);
        }
        let message = response.text().await.unwrap_or_default();
        Err(classify_failure(status, message))
    }
}

/// Map a non-success status to a store error
///
/// Client errors are permanent rejections except timeouts and rate limits.
fn classify_failure(status: StatusCode, message: String) -> StoreError {
    let transient = status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS;
    if transient {
        StoreError::Http(format!("status {}: {message}", status.as_u16()))
    } else {
        StoreError::Rejected { status: status.as_u16(), message }
    }
}

#[async_trait]
impl RecordStore for HttpRecordStore {
    async fn upsert_attendance(&self, record: &AttendanceRecord) -> StoreResult<WriteOutcome> {
        self.upsert(ATTENDANCE_TABLE, "student_id,route_execution_id", record).await
    }

    async fn upsert_location(&self, record: &LocationRecord) -> StoreResult<WriteOutcome> {
        self.upsert(LOCATION_TABLE, "bus_id,captured_at", record).await
    }

    async fn load_route_entries(&self, route_id: &RouteId) -> StoreResult<Vec<StudentRouteEntry>> {
        let url = format!(
            "{}/{ROSTER_VIEW}?route_id=eq.{}&order=sequence_index.asc",
            self.base_url, route_id
        );
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, message));
        }
        let bytes = response.bytes().await?;
        let rows: Vec<RosterRow> = serde_json::from_slice(&bytes)?;
        Ok(route_entries(rows, route_id, self.default_radius_m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_failure() {
        let rejected = classify_failure(StatusCode::UNPROCESSABLE_ENTITY, "bad outcome".into());
        assert!(matches!(rejected, StoreError::Rejected { status: 422, .. }));
        assert!(!rejected.is_retryable());

        assert!(classify_failure(StatusCode::SERVICE_UNAVAILABLE, String::new()).is_retryable());
        assert!(classify_failure(StatusCode::TOO_MANY_REQUESTS, String::new()).is_retryable());
        assert!(classify_failure(StatusCode::REQUEST_TIMEOUT, String::new()).is_retryable());
    }

    #[test]
    fn test_new_trims_base_url() {
        let store =
            HttpRecordStore::new("https://db.example.test/rest/v1/", Some("k"), Duration::from_secs(1), 50.0)
                .unwrap();
        assert_eq!(store.base_url, "https://db.example.test/rest/v1");
    }
}
