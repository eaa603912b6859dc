use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::frame::{FrameDecoder, FrameError, Phase2Message, encode_phase2_batch};
use crate::transport::{DownloadStream, ShareTransport};
use crate::wire::{
    DownloadBatchRequest, DownloadRequest, EventBatch, Phase1Op, Phase1Reply, Phase1Request,
    Ticket, TicketPurpose,
};

const TICKET_HEADER: &str = "X-Share-Ticket";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("server rejected the request: {reason}")]
    Rejected { status: StatusCode, reason: String },
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("malformed content stream: {0}")]
    Frame(#[from] FrameError),
    #[error("phase-1 reply has {got} results for {expected} operations")]
    ResultCountMismatch { expected: usize, got: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorClass {
    Auth,
    Rejected,
    Transient,
    Permanent,
}

impl RemoteError {
    /// A denial carrying the server's reason, as a `409 Conflict` would.
    pub fn rejected(reason: impl Into<String>) -> Self {
        RemoteError::Rejected {
            status: StatusCode::CONFLICT,
            reason: reason.into(),
        }
    }

    pub fn classification(&self) -> RemoteErrorClass {
        match self {
            RemoteError::Rejected { .. } => RemoteErrorClass::Rejected,
            RemoteError::Api { status, .. } => classify_api_status(*status),
            RemoteError::Request(_) => RemoteErrorClass::Transient,
            RemoteError::Url(_)
            | RemoteError::Frame(_)
            | RemoteError::ResultCountMismatch { .. } => RemoteErrorClass::Permanent,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.classification() == RemoteErrorClass::Transient
    }

    /// Human-readable reason suitable for a transfer error report.
    pub fn reason(&self) -> String {
        match self {
            RemoteError::Rejected { reason, .. } => reason.clone(),
            other => other.to_string(),
        }
    }
}

fn classify_api_status(status: StatusCode) -> RemoteErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        RemoteErrorClass::Auth
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
        )
    {
        RemoteErrorClass::Transient
    } else {
        RemoteErrorClass::Permanent
    }
}

#[derive(Debug, Deserialize)]
struct RejectionBody {
    reason: String,
}

#[derive(Debug, Serialize)]
struct TicketRequest {
    purpose: TicketPurpose,
}

#[derive(Clone)]
pub struct ShareClient {
    http: Client,
    base_url: Url,
    share_id: String,
    token: String,
}

impl ShareClient {
    pub fn new(
        base_url: &str,
        share_id: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self, RemoteError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            share_id: share_id.into(),
            token: token.into(),
        })
    }

    pub fn share_id(&self) -> &str {
        &self.share_id
    }

    fn auth_header_value(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn endpoint(&self, suffix: &str) -> Result<Url, RemoteError> {
        Ok(self
            .base_url
            .join(&format!("/v1/shares/{}/{}", self.share_id, suffix))?)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<RejectionBody>(&body) {
            Ok(rejection) => Err(RemoteError::Rejected {
                status,
                reason: rejection.reason,
            }),
            Err(_) => Err(RemoteError::Api { status, body }),
        }
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, RemoteError> {
        let response = Self::check_status(response).await?;
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl ShareTransport for ShareClient {
    async fn request_ticket(&self, purpose: TicketPurpose) -> Result<Ticket, RemoteError> {
        let url = self.endpoint("ticket")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .json(&TicketRequest { purpose })
            .send()
            .await?;
        Self::handle_response(response).await
    }

    async fn submit_phase1(
        &self,
        ticket: &Ticket,
        ops: &[Phase1Op],
    ) -> Result<Phase1Reply, RemoteError> {
        let url = self.endpoint("phase1")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .header(TICKET_HEADER, ticket.as_str())
            .json(&Phase1Request { ops: ops.to_vec() })
            .send()
            .await?;
        let reply: Phase1Reply = Self::handle_response(response).await?;
        if reply.results.len() != ops.len() {
            return Err(RemoteError::ResultCountMismatch {
                expected: ops.len(),
                got: reply.results.len(),
            });
        }
        Ok(reply)
    }

    async fn send_phase2(
        &self,
        ticket: &Ticket,
        messages: &[Phase2Message],
    ) -> Result<(), RemoteError> {
        let url = self.endpoint("phase2")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .header(TICKET_HEADER, ticket.as_str())
            .header("Content-Type", "application/octet-stream")
            .body(encode_phase2_batch(messages))
            .send()
            .await?;
        Self::check_status(response).await?;
        Ok(())
    }

    async fn open_download(
        &self,
        ticket: &Ticket,
        files: &[DownloadRequest],
    ) -> Result<DownloadStream, RemoteError> {
        let url = self.endpoint("download")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", self.auth_header_value())
            .header(TICKET_HEADER, ticket.as_str())
            .json(&DownloadBatchRequest {
                files: files.to_vec(),
            })
            .send()
            .await?;
        let response = Self::check_status(response).await?;
        Ok(decode_download_body(response.bytes_stream()))
    }

    async fn poll_events(&self, after_event_id: u64) -> Result<EventBatch, RemoteError> {
        let mut url = self.endpoint("events")?;
        url.query_pairs_mut()
            .append_pair("after", &after_event_id.to_string());
        let response = self
            .http
            .get(url)
            .header("Authorization", self.auth_header_value())
            .send()
            .await?;
        Self::handle_response(response).await
    }
}

/// Turns a raw byte stream into decoded download sub-messages.
fn decode_download_body<S, B>(body: S) -> DownloadStream
where
    S: futures_util::Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = (Box::pin(body), FrameDecoder::new(), false);
    futures_util::stream::unfold(state, |(mut body, mut decoder, done)| async move {
        if done {
            return None;
        }
        loop {
            match decoder.next_download() {
                Ok(Some(message)) => return Some((Ok(message), (body, decoder, false))),
                Ok(None) => {}
                Err(err) => return Some((Err(err.into()), (body, decoder, true))),
            }
            match body.next().await {
                Some(Ok(bytes)) => decoder.push(bytes.as_ref()),
                Some(Err(err)) => return Some((Err(err.into()), (body, decoder, true))),
                None => {
                    return match decoder.finish() {
                        Ok(()) => None,
                        Err(err) => Some((Err(err.into()), (body, decoder, true))),
                    };
                }
            }
        }
    })
    .boxed()
}
