//! Boundary to the load service that owns the authoritative board.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use shared::{
    domain::{DispatchStats, Driver, DriverId, LoadId, LoadStatus},
    error::ApiError,
    protocol::{AssignDriverRequest, LoadsByStatus, UpdateLoadStatusRequest},
};

use crate::error::RemoteError;

#[async_trait]
pub trait RemoteLoadService: Send + Sync {
    async fn fetch_loads_by_status(&self) -> Result<LoadsByStatus, RemoteError>;
    async fn fetch_stats(&self) -> Result<DispatchStats, RemoteError>;
    async fn fetch_available_drivers(&self) -> Result<Vec<Driver>, RemoteError>;
    async fn update_load_status(
        &self,
        load_id: LoadId,
        status: LoadStatus,
    ) -> Result<(), RemoteError>;
    async fn assign_driver(&self, load_id: LoadId, driver_id: DriverId)
        -> Result<(), RemoteError>;
    async fn unassign_driver(&self, load_id: LoadId) -> Result<(), RemoteError>;
}

/// JSON-over-HTTP load service client.
pub struct HttpLoadService {
    http: Client,
    server_url: String,
    timeout: Duration,
}

impl HttpLoadService {
    pub fn new(server_url: impl Into<String>, timeout: Duration) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| RemoteError::Transport(err.to_string()))?;
        Ok(Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    fn map_send_error(&self, err: reqwest::Error) -> RemoteError {
        if err.is_timeout() {
            RemoteError::Timeout {
                after: self.timeout,
            }
        } else {
            RemoteError::from(err)
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RemoteError> {
        let response = self
            .http
            .get(format!("{}{path}", self.server_url))
            .send()
            .await
            .map_err(|err| self.map_send_error(err))?;
        let response = ensure_success(response).await?;
        response
            .json::<T>()
            .await
            .map_err(|err| RemoteError::Decode(err.to_string()))
    }
}

async fn ensure_success(response: Response) -> Result<Response, RemoteError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::Status {
        status: status.as_u16(),
        api: serde_json::from_str::<ApiError>(&body).ok(),
    })
}

#[async_trait]
impl RemoteLoadService for HttpLoadService {
    async fn fetch_loads_by_status(&self) -> Result<LoadsByStatus, RemoteError> {
        self.get_json("/dispatch/loads").await
    }

    async fn fetch_stats(&self) -> Result<DispatchStats, RemoteError> {
        self.get_json("/dispatch/stats").await
    }

    async fn fetch_available_drivers(&self) -> Result<Vec<Driver>, RemoteError> {
        self.get_json("/dispatch/drivers/available").await
    }

    async fn update_load_status(
        &self,
        load_id: LoadId,
        status: LoadStatus,
    ) -> Result<(), RemoteError> {
        let response = self
            .http
            .put(format!("{}/dispatch/loads/{}/status", self.server_url, load_id.0))
            .json(&UpdateLoadStatusRequest { status })
            .send()
            .await
            .map_err(|err| self.map_send_error(err))?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn assign_driver(
        &self,
        load_id: LoadId,
        driver_id: DriverId,
    ) -> Result<(), RemoteError> {
        let response = self
            .http
            .post(format!("{}/dispatch/loads/{}/assign", self.server_url, load_id.0))
            .json(&AssignDriverRequest { driver_id })
            .send()
            .await
            .map_err(|err| self.map_send_error(err))?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn unassign_driver(&self, load_id: LoadId) -> Result<(), RemoteError> {
        let response = self
            .http
            .post(format!("{}/dispatch/loads/{}/unassign", self.server_url, load_id.0))
            .send()
            .await
            .map_err(|err| self.map_send_error(err))?;
        ensure_success(response).await?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/remote_tests.rs"]
mod tests;
