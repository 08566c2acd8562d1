//! HTTP client for the executor queue proxy.
//!
//! Used by out-of-process executors to pull jobs and report their outcomes.
//! Outcome calls take the [`Lease`] that came with the job.

use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::model::{HeartbeatReport, Lease, RecordId};
use crate::proxy::Job;
use crate::proxy::http::{
    DequeueRequest, HeartbeatRequest, HeartbeatResponse, MarkCompleteRequest, MarkFailureRequest,
};

#[derive(Debug, Clone)]
pub struct ExecutorClient {
    http: reqwest::Client,
    base_url: String,
    token: SecretString,
    executor_name: String,
}

impl ExecutorClient {
    pub fn new(
        base_url: impl Into<String>,
        token: SecretString,
        executor_name: impl Into<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            executor_name: executor_name.into(),
        })
    }

    pub fn executor_name(&self) -> &str {
        &self.executor_name
    }

    /// Claim the next job on `queue`. `None` when the queue is empty.
    pub async fn dequeue(&self, queue: &str) -> Result<Option<Job>> {
        let body = DequeueRequest {
            executor_name: self.executor_name.clone(),
        };
        let resp = self.post(queue, "dequeue", &body).await?;
        if resp.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        Ok(Some(decode(resp, None).await?))
    }

    pub async fn heartbeat(&self, queue: &str, jobs: &[Lease]) -> Result<HeartbeatReport> {
        let body = HeartbeatRequest {
            executor_name: self.executor_name.clone(),
            jobs: jobs.to_vec(),
        };
        let resp = self.post(queue, "heartbeat", &body).await?;
        let resp: HeartbeatResponse = decode(resp, None).await?;
        Ok(HeartbeatReport {
            known: resp.known_ids,
            canceled: resp.cancel_ids,
        })
    }

    pub async fn mark_complete(&self, queue: &str, job: &Lease) -> Result<()> {
        let body = MarkCompleteRequest {
            executor_name: self.executor_name.clone(),
            job: job.clone(),
        };
        let resp = self.post(queue, "markComplete", &body).await?;
        check(resp, Some(job.id)).await
    }

    pub async fn mark_errored(&self, queue: &str, job: &Lease, message: &str) -> Result<()> {
        let body = self.failure(job, message);
        let resp = self.post(queue, "markErrored", &body).await?;
        check(resp, Some(job.id)).await
    }

    pub async fn mark_failed(&self, queue: &str, job: &Lease, message: &str) -> Result<()> {
        let body = self.failure(job, message);
        let resp = self.post(queue, "markFailed", &body).await?;
        check(resp, Some(job.id)).await
    }

    fn failure(&self, job: &Lease, message: &str) -> MarkFailureRequest {
        MarkFailureRequest {
            executor_name: self.executor_name.clone(),
            job: job.clone(),
            error_message: message.to_string(),
        }
    }

    async fn post<B: Serialize>(
        &self,
        queue: &str,
        operation: &str,
        body: &B,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/queue/{queue}/{operation}", self.base_url);
        Ok(self
            .http
            .post(url)
            .bearer_auth(self.token.expose_secret())
            .json(body)
            .send()
            .await?)
    }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response, id: Option<RecordId>) -> Result<T> {
    if resp.status().is_success() {
        return Ok(resp.json().await?);
    }
    Err(error_from(resp, id).await)
}

async fn check(resp: reqwest::Response, id: Option<RecordId>) -> Result<()> {
    if resp.status().is_success() {
        return Ok(());
    }
    Err(error_from(resp, id).await)
}

/// Map a proxy error response back onto [`Error`].
async fn error_from(resp: reqwest::Response, id: Option<RecordId>) -> Error {
    let status = resp.status();
    let message = resp
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
        .unwrap_or_else(|| status.to_string());

    match (status, id) {
        (StatusCode::UNAUTHORIZED, _) => Error::Unauthorized,
        (StatusCode::BAD_REQUEST, _) => Error::BadRequest(message),
        (StatusCode::NOT_FOUND, _) => Error::NotFound(message),
        (StatusCode::CONFLICT, Some(id)) => Error::OwnershipLost { id },
        _ => Error::Other(format!("proxy returned {status}: {message}")),
    }
}
