/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The seam between the kernel and the remote service: per-operation
//! mutation calls, baseline subtree fetches, the inbound event stream and
//! the reachability probe. The kernel only sees the [`Backend`] trait, so
//! tests drive it with a scripted fake.

use crate::config::KernelConfig;
use crate::error::{Error, Result};
use crate::guid::Guid;
use crate::oplog::{OpEnvelope, Operation};
use crate::tree::NodeData;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::Duration;
use url::Url;

/// The literal message the service uses to signal that an envelope id was
/// already applied server-side.
pub const DUPLICATE_MESSAGE: &str = "Operation already processed";

/// How the service answered a delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    /// Acknowledged; `data` may carry canonical fields to reconcile.
    Success { data: Option<Value> },
    /// Idempotent replay; acknowledged, nothing to reconcile.
    Duplicate,
    /// Rejected or errored; the scheduler will retry.
    Failure {
        status: Option<u16>,
        message: String,
    },
}

/// Wire shape of an operation-call response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub operation_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// Authoritative state of one subtree, as returned by the baseline fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtreeBaseline {
    pub node: NodeData,
    #[serde(default)]
    pub children: Vec<NodeData>,
}

/// One decoded event off the inbound stream. `data` is the raw payload
/// text; validation happens at translation time so a malformed event can't
/// take the stream down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub event: String,
    pub id: Option<String>,
    pub data: String,
}

pub type EventStream = BoxStream<'static, Result<StreamEvent>>;

#[async_trait]
pub trait Backend: Send + Sync {
    /// Ships one operation envelope to its per-type endpoint.
    async fn deliver(&self, namespace: &str, envelope: &OpEnvelope) -> Result<DeliveryOutcome>;

    /// Fetches the authoritative subtree rooted at `node`.
    async fn fetch_subtree(&self, namespace: &str, node: &Guid) -> Result<SubtreeBaseline>;

    /// Opens the long-lived event stream for a namespace.
    async fn open_stream(&self, namespace: &str) -> Result<EventStream>;

    /// A quick reachability check; callers bound it with their own
    /// timeout.
    async fn probe(&self) -> bool;
}

/// The HTTP method and action segment for an operation's endpoint:
/// `POST` creates and moves, `PUT` updates, `DELETE` deletes.
pub(crate) fn endpoint_for(op: &Operation) -> (reqwest::Method, &'static str) {
    let method = match op {
        Operation::CreateFolder { .. }
        | Operation::CreateBookmark { .. }
        | Operation::MoveNode { .. } => reqwest::Method::POST,
        Operation::RemoveNode { .. } => reqwest::Method::DELETE,
        Operation::Reorder { .. }
        | Operation::ToggleFolder { .. }
        | Operation::MarkFolderLoaded { .. }
        // Hydrations are only ever synthesized locally from server data
        // and never shipped, but the mapping stays total.
        | Operation::HydrateNode { .. } => reqwest::Method::PUT,
    };
    (method, op.kind())
}

pub(crate) fn classify_response(body: OperationResponse) -> DeliveryOutcome {
    if body.message.as_deref() == Some(DUPLICATE_MESSAGE) {
        return DeliveryOutcome::Duplicate;
    }
    if body.success {
        DeliveryOutcome::Success { data: body.data }
    } else {
        DeliveryOutcome::Failure {
            status: None,
            message: body
                .message
                .unwrap_or_else(|| "operation rejected".into()),
        }
    }
}

/// Talks to the real service with reqwest.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl HttpBackend {
    pub fn new(config: &KernelConfig) -> Result<Self> {
        // No client-wide timeout: the event stream stays open for hours.
        // Individual calls are bounded below.
        let client = reqwest::Client::builder().build()?;
        Ok(HttpBackend {
            client,
            base_url: config.base_url.clone(),
            timeout: config.timeout(),
        })
    }

    fn url_with(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| Error::BadArgument("service base URL cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::result::Result<T, reqwest::Error>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Err(_) => Err(Error::OutboundTimeout),
            Ok(r) => Ok(r?),
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn deliver(&self, namespace: &str, envelope: &OpEnvelope) -> Result<DeliveryOutcome> {
        let (method, action) = endpoint_for(&envelope.op);
        let url = self.url_with(&["operations", namespace, action])?;
        log::debug!("delivering {} {} for {}", method, url, envelope.id);
        let response = self
            .bounded(self.client.request(method, url.clone()).json(envelope).send())
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Ok(DeliveryOutcome::Failure {
                status: Some(status.as_u16()),
                message: format!("HTTP {} from {}", status.as_u16(), url),
            });
        }
        let body: OperationResponse = self.bounded(response.json()).await?;
        Ok(classify_response(body))
    }

    async fn fetch_subtree(&self, namespace: &str, node: &Guid) -> Result<SubtreeBaseline> {
        let url = self.url_with(&["namespaces", namespace, "tree", node.as_str()])?;
        let response = self.bounded(self.client.get(url.clone()).send()).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::UnexpectedStatus(status.as_u16(), url.to_string()));
        }
        Ok(self.bounded(response.json()).await?)
    }

    async fn open_stream(&self, namespace: &str) -> Result<EventStream> {
        let url = self.url_with(&["namespaces", namespace, "events"])?;
        let response = self
            .bounded(
                self.client
                    .get(url.clone())
                    .header(reqwest::header::ACCEPT, "text/event-stream")
                    .header(reqwest::header::CACHE_CONTROL, "no-cache")
                    .send(),
            )
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::UnexpectedStatus(status.as_u16(), url.to_string()));
        }
        Ok(decode_sse(Box::pin(response.bytes_stream())))
    }

    async fn probe(&self) -> bool {
        match self.client.head(self.base_url.clone()).send().await {
            // Any answer at all means the service is reachable; even a 4xx
            // proves the network path works.
            Ok(_) => true,
            Err(e) => {
                log::debug!("reachability probe failed: {}", e);
                false
            }
        }
    }
}

/// Incremental `text/event-stream` decoder: `event:`/`data:`/`id:` fields,
/// events dispatched on a blank line, comment lines ignored.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buf: String,
    event: Option<String>,
    id: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buf.push_str(&String::from_utf8_lossy(chunk));
        let mut out = Vec::new();
        while let Some(pos) = self.buf.find('\n') {
            let line: String = self.buf.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            self.handle_line(line, &mut out);
        }
        out
    }

    fn handle_line(&mut self, line: &str, out: &mut Vec<StreamEvent>) {
        if line.is_empty() {
            if !self.data.is_empty() {
                out.push(StreamEvent {
                    event: self.event.take().unwrap_or_else(|| "message".into()),
                    id: self.id.take(),
                    data: self.data.join("\n"),
                });
            }
            self.event = None;
            self.id = None;
            self.data.clear();
            return;
        }
        if line.starts_with(':') {
            return;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.into()),
            "data" => self.data.push(value.into()),
            "id" => self.id = Some(value.into()),
            // "retry" and anything else: not ours to interpret.
            _ => {}
        }
    }
}

fn decode_sse<S, B>(bytes: S) -> EventStream
where
    S: futures_util::Stream<Item = std::result::Result<B, reqwest::Error>>
        + Send
        + Unpin
        + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = (bytes, SseDecoder::new(), VecDeque::new());
    Box::pin(futures_util::stream::unfold(
        state,
        |(mut bytes, mut decoder, mut queue)| async move {
            loop {
                if let Some(event) = queue.pop_front() {
                    return Some((Ok(event), (bytes, decoder, queue)));
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => queue.extend(decoder.feed(chunk.as_ref())),
                    Some(Err(e)) => {
                        return Some((Err(Error::from(e)), (bytes, decoder, queue)));
                    }
                    None => return None,
                }
            }
        },
    ))
}
