use std::collections::{HashMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use futures::{stream, StreamExt};
use reqwest::StatusCode;
use shared::models::{CalendarEntry, ReqParam};
use thiserror::Error;

/// Upper bound on in-flight calendar requests within one run.
const MAX_CONCURRENT_FETCHES: usize = 8;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// A failed calendar fetch. Any single failure is fatal to the run:
/// downstream diffing assumes a complete set of windows.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("could not get calendar data for facility {facility_id} (status code {status})")]
    Status { facility_id: String, status: u16 },
    #[error("could not get calendar data for facility {facility_id}: {source}")]
    Request {
        facility_id: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Client for the facility-booking calendar API.
pub struct CalendarClient {
    http: reqwest::Client,
    base_url: String,
}

impl CalendarClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(CalendarClient {
            http,
            base_url: base_url.into(),
        })
    }

    /// Fetch the raw entries for one facility window.
    pub async fn fetch_window(&self, param: &ReqParam) -> Result<Vec<CalendarEntry>, FetchError> {
        let url = format!(
            "{}?selectedId={}&start={}&end={}",
            self.base_url,
            urlencoding::encode(&param.facility_id),
            urlencoding::encode(&param.start),
            urlencoding::encode(&param.end),
        );

        let response = self.http.get(&url).send().await.map_err(|source| {
            FetchError::Request {
                facility_id: param.facility_id.clone(),
                source,
            }
        })?;

        if response.status() != StatusCode::OK {
            return Err(FetchError::Status {
                facility_id: param.facility_id.clone(),
                status: response.status().as_u16(),
            });
        }

        response.json().await.map_err(|source| FetchError::Request {
            facility_id: param.facility_id.clone(),
            source,
        })
    }

    /// Fetch every unique window once, even when several configs share the
    /// same facility and lookahead. All requests are driven to completion
    /// before an error is reported, so a failing window does not leave the
    /// rest in flight.
    pub async fn fetch_all(
        &self,
        params: &[ReqParam],
    ) -> Result<HashMap<ReqParam, Vec<CalendarEntry>>, FetchError> {
        let unique: HashSet<ReqParam> = params.iter().cloned().collect();
        tracing::debug!(
            "Fetching {} unique windows for {} configs",
            unique.len(),
            params.len()
        );

        let results: Vec<(ReqParam, Result<Vec<CalendarEntry>, FetchError>)> =
            stream::iter(unique)
                .map(|param| async move {
                    let result = self.fetch_window(&param).await;
                    (param, result)
                })
                .buffer_unordered(MAX_CONCURRENT_FETCHES)
                .collect()
                .await;

        let mut data = HashMap::new();
        let mut first_error = None;
        for (param, result) in results {
            match result {
                Ok(entries) => {
                    data.insert(param, entries);
                }
                Err(e) if first_error.is_none() => first_error = Some(e),
                Err(e) => tracing::warn!("Additional fetch failure: {}", e),
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn param(facility_id: &str, start: &str, end: &str) -> ReqParam {
        ReqParam {
            facility_id: facility_id.to_string(),
            start: start.to_string(),
            end: end.to_string(),
        }
    }

    #[tokio::test]
    async fn identical_windows_share_one_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/calendar"))
            .and(query_param("selectedId", "f1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"title": "Open Rec Skate", "start": "2024-01-01T12:00:00", "end": "2024-01-01T13:00:00"}
            ])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/calendar"))
            .and(query_param("selectedId", "f2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let client = CalendarClient::new(format!("{}/calendar", server.uri())).unwrap();
        let shared_window = param("f1", "2024-01-01T00:00:00-0500", "2024-01-08T23:59:59-0500");
        let params = vec![
            shared_window.clone(),
            shared_window.clone(),
            param("f2", "2024-01-01T00:00:00-0500", "2024-01-08T23:59:59-0500"),
        ];

        let data = client.fetch_all(&params).await.unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[&shared_window].len(), 1);
        assert_eq!(data[&shared_window][0].title, "Open Rec Skate");
    }

    #[tokio::test]
    async fn non_200_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = CalendarClient::new(format!("{}/calendar", server.uri())).unwrap();
        let err = client
            .fetch_all(&[param("f1", "s", "e")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("f1"));
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn unparseable_body_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = CalendarClient::new(format!("{}/calendar", server.uri())).unwrap();
        assert!(client.fetch_all(&[param("f1", "s", "e")]).await.is_err());
    }
}
