//! Transport-facing contract and the channel endpoints shared with issuers
//!
//! A loader is a pair of channels: the issuer (or the proxy acting as one)
//! sends [`LoaderCommand`]s down one and receives [`ClientEvent`]s from the
//! other. The same endpoint types are used on both sides of the proxy, so a
//! pass-through request can hand the issuer's endpoints to the transport as is.

use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt};
use http::HeaderMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::proxy::factory::FactoryEvent;
use crate::proxy::http_types::{
    CompletionStatus, FollowRedirectParams, NetError, RedirectInfo, ResourceRequest, ResponseBody,
    ResponseHead, ResponseHeaders,
};
use crate::proxy::types::{LoadOptions, RequestPriority, RoutingId, TransportRequestId};

pub type ClientSender = mpsc::UnboundedSender<ClientEvent>;
pub type ClientReceiver = mpsc::UnboundedReceiver<ClientEvent>;
pub type LoaderSender = mpsc::UnboundedSender<LoaderCommand>;
pub type LoaderReceiver = mpsc::UnboundedReceiver<LoaderCommand>;

/// Create the channel a loader reports its events on
pub fn client_channel() -> (ClientSender, ClientReceiver) {
    mpsc::unbounded_channel()
}

/// Create the channel a loader is controlled through
pub fn loader_channel() -> (LoaderSender, LoaderReceiver) {
    mpsc::unbounded_channel()
}

/// Commands an issuer sends to its loader
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoaderCommand {
    FollowRedirect(FollowRedirectParams),
    SetPriority {
        priority: RequestPriority,
        intra_priority: i32,
    },
    PauseReadingBodyFromNet,
    ResumeReadingBodyFromNet,
}

/// Events a loader reports to its client
pub enum ClientEvent {
    ReceiveResponse(ResponseHead),
    ReceiveRedirect(RedirectInfo, ResponseHead),
    UploadProgress {
        current_position: u64,
        total_size: u64,
        ack: Option<oneshot::Sender<()>>,
    },
    ReceiveCachedMetadata(Bytes),
    TransferSizeUpdated(i32),
    StartLoadingResponseBody(ResponseBody),
    Complete(CompletionStatus),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReceiveResponse(_) => "receive_response",
            Self::ReceiveRedirect(..) => "receive_redirect",
            Self::UploadProgress { .. } => "upload_progress",
            Self::ReceiveCachedMetadata(_) => "receive_cached_metadata",
            Self::TransferSizeUpdated(_) => "transfer_size_updated",
            Self::StartLoadingResponseBody(_) => "start_loading_response_body",
            Self::Complete(_) => "complete",
        }
    }
}

impl fmt::Debug for ClientEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReceiveResponse(head) => f.debug_tuple("ReceiveResponse").field(head).finish(),
            Self::ReceiveRedirect(info, head) => f
                .debug_tuple("ReceiveRedirect")
                .field(info)
                .field(head)
                .finish(),
            Self::UploadProgress {
                current_position,
                total_size,
                ..
            } => f
                .debug_struct("UploadProgress")
                .field("current_position", current_position)
                .field("total_size", total_size)
                .finish(),
            Self::ReceiveCachedMetadata(data) => f
                .debug_tuple("ReceiveCachedMetadata")
                .field(&data.len())
                .finish(),
            Self::TransferSizeUpdated(diff) => {
                f.debug_tuple("TransferSizeUpdated").field(diff).finish()
            }
            Self::StartLoadingResponseBody(_) => f.write_str("StartLoadingResponseBody(..)"),
            Self::Complete(status) => f.debug_tuple("Complete").field(status).finish(),
        }
    }
}

/// Everything the transport needs to start one leg
#[derive(Clone, Debug)]
pub struct LoaderStart {
    pub routing_id: RoutingId,
    pub transport_request_id: TransportRequestId,
    pub options: LoadOptions,
    pub request: ResourceRequest,
    /// Present when the leg asked for the trusted header channel and the factory has one
    pub header_hub: Option<TrustedHeaderHub>,
}

/// The component that performs real network I/O
pub trait Transport: Send + Sync {
    /// Start a loader for `start`, reporting on `client` and obeying `loader`
    fn create_loader_and_start(&self, loader: LoaderReceiver, start: LoaderStart, client: ClientSender);

    /// Resolves when the link to the transport is lost
    fn closed(&self) -> BoxFuture<'static, ()> {
        futures_util::future::pending().boxed()
    }
}

/// Reply to a trusted-channel before-send-headers event
pub type BeforeSendHeadersReply = Result<Option<HeaderMap>, NetError>;

/// Reply to a trusted-channel headers-received event
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeadersReceivedReply {
    pub override_headers: Option<ResponseHeaders>,
    pub redirect_url: Option<Url>,
}

/// Trusted-channel events routed through the factory
#[derive(Debug)]
pub(crate) enum HeaderEvent {
    BeforeSendHeaders {
        headers: HeaderMap,
        reply: oneshot::Sender<BeforeSendHeadersReply>,
    },
    HeadersReceived {
        headers: ResponseHeaders,
        remote_endpoint: Option<SocketAddr>,
        reply: oneshot::Sender<Result<HeadersReceivedReply, NetError>>,
    },
}

/// Factory-level end of the trusted header channel
#[derive(Clone)]
pub struct TrustedHeaderHub {
    inbox: mpsc::UnboundedSender<FactoryEvent>,
    next_binding: Arc<AtomicU64>,
}

impl fmt::Debug for TrustedHeaderHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustedHeaderHub")
            .field("bindings", &self.next_binding.load(Ordering::Relaxed))
            .finish()
    }
}

impl TrustedHeaderHub {
    pub(crate) fn new(inbox: mpsc::UnboundedSender<FactoryEvent>) -> Self {
        Self {
            inbox,
            next_binding: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Announce a loader and obtain its per-leg header client
    pub fn on_loader_created(&self, transport_request_id: TransportRequestId) -> TrustedHeaderClient {
        let binding = self.next_binding.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = self.inbox.send(FactoryEvent::LoaderCreated {
            transport_request_id,
            binding,
        });
        TrustedHeaderClient {
            inbox: self.inbox.clone(),
            transport_request_id,
            binding,
        }
    }
}

/// Transport-side handle for one leg's trusted header negotiation.
///
/// If the proxy goes away or drops the leg, both calls fail with
/// [`NetError::Aborted`] and the transport must not carry on with the leg.
#[derive(Clone)]
pub struct TrustedHeaderClient {
    inbox: mpsc::UnboundedSender<FactoryEvent>,
    transport_request_id: TransportRequestId,
    binding: u64,
}

impl TrustedHeaderClient {
    pub fn transport_request_id(&self) -> TransportRequestId {
        self.transport_request_id
    }

    pub async fn on_before_send_headers(&self, headers: HeaderMap) -> BeforeSendHeadersReply {
        let (reply, answer) = oneshot::channel();
        let event = HeaderEvent::BeforeSendHeaders { headers, reply };
        if !self.post(event) {
            return Err(NetError::Aborted);
        }
        answer.await.unwrap_or(Err(NetError::Aborted))
    }

    pub async fn on_headers_received(
        &self,
        headers: ResponseHeaders,
        remote_endpoint: Option<SocketAddr>,
    ) -> Result<HeadersReceivedReply, NetError> {
        let (reply, answer) = oneshot::channel();
        let event = HeaderEvent::HeadersReceived {
            headers,
            remote_endpoint,
            reply,
        };
        if !self.post(event) {
            return Err(NetError::Aborted);
        }
        answer.await.unwrap_or(Err(NetError::Aborted))
    }

    fn post(&self, event: HeaderEvent) -> bool {
        self.inbox
            .send(FactoryEvent::Header {
                transport_request_id: self.transport_request_id,
                binding: self.binding,
                event,
            })
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn header_client_aborts_when_the_proxy_is_gone() {
        let (inbox, events) = mpsc::unbounded_channel();
        let client = TrustedHeaderHub::new(inbox).on_loader_created(TransportRequestId::new(3));
        drop(events);

        assert_eq!(
            client.on_before_send_headers(HeaderMap::new()).await,
            Err(NetError::Aborted)
        );
    }

    #[tokio::test]
    async fn dropped_reply_aborts_instead_of_meaning_no_change() {
        let (inbox, mut events) = mpsc::unbounded_channel();
        let client = TrustedHeaderHub::new(inbox).on_loader_created(TransportRequestId::new(3));

        let proxy = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                // Drop every reply sender unanswered.
                drop(event);
            }
        });

        assert_eq!(
            client.on_before_send_headers(HeaderMap::new()).await,
            Err(NetError::Aborted)
        );
        let received = client
            .on_headers_received(ResponseHeaders::new(http::StatusCode::OK), None)
            .await;
        assert_eq!(received.err(), Some(NetError::Aborted));

        drop(client);
        proxy.abort();
    }
}
