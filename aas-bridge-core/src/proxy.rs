//! Data-plane proxy: streams one cataloged element from the repository into a sink.
//!
//! Each transfer holds a permit from a shared semaphore for its whole lifetime, so the
//! number of concurrent outbound requests is bounded across all transfers. A transfer makes
//! at most `1 + max_retries` attempts; only failures before the first body byte are retried.
//!
//! Status mapping:
//! - 2xx: stream the body
//! - 404: [`ProxyError::NotFound`], never retried
//! - 5xx, timeouts, connection errors: retried with exponential backoff, then
//!   [`ProxyError::Transient`]
//! - other statuses: [`ProxyError::Permanent`]
//!
//! Cancellation drops the in-flight request (closing its connection) and returns
//! [`ProxyError::Cancelled`]. Bytes already written to the sink are the caller's to discard.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::config::ProxyConfig;
use crate::error::{ProxyError, ValidationError};
use crate::inventory::Inventory;
use crate::model::DataAddress;
use crate::reference::StableId;
use crate::validate::{header_map, validate_data_address};

/// What a completed transfer delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReport {
    pub url: String,
    pub bytes: u64,
    pub attempts: u32,
    pub content_type: Option<String>,
}

pub struct DataPlaneProxy {
    client: reqwest::Client,
    config: ProxyConfig,
    permits: Arc<Semaphore>,
}

impl DataPlaneProxy {
    pub fn new(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(ProxyError::Client)?;
        Ok(Self {
            client,
            config: config.clone(),
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
        })
    }

    /// Transfers currently allowed to start without waiting.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Stops admitting transfers; waiting and future transfers fail with [`ProxyError::Closed`].
    pub fn close(&self) {
        self.permits.close();
    }

    /// Looks up the data address of a cataloged resource. Stale entries still resolve.
    pub fn resolve(inventory: &Inventory, id: &StableId) -> Result<DataAddress, ProxyError> {
        let entry = inventory
            .get(id)
            .ok_or_else(|| ProxyError::UnknownResource(id.clone()))?;
        validate_data_address(&entry.data_address)?;
        Ok(entry.data_address)
    }

    /// Resolves `id` and transfers it.
    pub async fn fetch<W>(
        &self,
        inventory: &Inventory,
        id: &StableId,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<TransferReport, ProxyError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let address = Self::resolve(inventory, id)?;
        self.transfer(&address, sink, cancel).await
    }

    pub async fn transfer<W>(
        &self,
        address: &DataAddress,
        sink: &mut W,
        cancel: &CancellationToken,
    ) -> Result<TransferReport, ProxyError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        validate_data_address(address)?;
        let headers = header_map(address.headers()).map_err(|violation| ValidationError {
            violations: vec![violation],
        })?;
        let url = address.request_url();

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
            permit = self.permits.acquire() => permit.map_err(|_| ProxyError::Closed)?,
        };

        let mut backoff = ExponentialBackoff::new(
            Duration::from_millis(self.config.initial_backoff_ms),
            Duration::from_millis(self.config.max_backoff_ms),
        );
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            debug!(url = %url, attempt = attempts, "[PROXY] requesting");
            let request = self.client.get(&url).headers(headers.clone()).send();
            let sent = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(url = %url, "[PROXY] transfer cancelled before response");
                    return Err(ProxyError::Cancelled);
                }
                sent = request => sent,
            };

            let reason = match sent {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return self.stream_body(url, response, sink, cancel, attempts).await;
                    }
                    if status == StatusCode::NOT_FOUND {
                        warn!(url = %url, "[PROXY] element not found in repository");
                        return Err(ProxyError::NotFound { url });
                    }
                    if !status.is_server_error() {
                        warn!(url = %url, status = status.as_u16(), "[PROXY] request rejected");
                        return Err(ProxyError::Permanent {
                            url,
                            status: status.as_u16(),
                        });
                    }
                    format!("status {}", status.as_u16())
                }
                Err(e) => e.to_string(),
            };

            if attempts > self.config.max_retries {
                warn!(url = %url, attempts, reason = %reason, "[PROXY] giving up");
                return Err(ProxyError::Transient {
                    url,
                    attempts,
                    reason,
                });
            }
            let delay = backoff.next_delay();
            warn!(
                url = %url,
                attempt = attempts,
                reason = %reason,
                delay_ms = delay.as_millis() as u64,
                "[PROXY] transient failure, retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn stream_body<W>(
        &self,
        url: String,
        response: reqwest::Response,
        sink: &mut W,
        cancel: &CancellationToken,
        attempts: u32,
    ) -> Result<TransferReport, ProxyError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let limit = self.config.max_bytes;
        if let (Some(limit), Some(announced)) = (limit, response.content_length()) {
            if announced > limit {
                warn!(url = %url, limit, announced, "[PROXY] announced payload exceeds size limit");
                return Err(ProxyError::SizeLimit {
                    limit,
                    received: announced,
                });
            }
        }
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let mut body = response.bytes_stream();
        let mut bytes: u64 = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(url = %url, bytes, "[PROXY] transfer cancelled mid-stream");
                    return Err(ProxyError::Cancelled);
                }
                next = body.next() => next,
            };
            let chunk = match next {
                None => break,
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    warn!(url = %url, bytes, error = %e, "[PROXY] stream interrupted");
                    return Err(ProxyError::Interrupted {
                        url,
                        bytes,
                        reason: e.to_string(),
                    });
                }
            };
            bytes += chunk.len() as u64;
            if let Some(limit) = limit {
                if bytes > limit {
                    warn!(url = %url, limit, "[PROXY] payload exceeds size limit");
                    return Err(ProxyError::SizeLimit {
                        limit,
                        received: bytes,
                    });
                }
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ProxyError::Cancelled),
                written = sink.write_all(&chunk) => written?,
            }
        }
        sink.flush().await?;
        info!(url = %url, bytes, attempts, "[PROXY] transfer complete");
        Ok(TransferReport {
            url,
            bytes,
            attempts,
            content_type,
        })
    }
}
