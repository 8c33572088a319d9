//! `Transport` backed by the hyper-util legacy client
//!
//! Each loader runs as its own task. Redirects are reported to the client and
//! the loader then waits for a follow-redirect command before issuing the next
//! leg. When the leg asked for the trusted header channel, request and response
//! headers are negotiated over it and `Set-Cookie` is stripped from the
//! response head sent on the main channel.

use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use http::{header, HeaderValue, Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::proxy::http_types::{
    CompletionStatus, NetError, RedirectInfo, ResourceRequest, ResponseHead, ResponseHeaders,
};
use crate::proxy::transport::{
    ClientEvent, ClientSender, HeadersReceivedReply, LoaderCommand, LoaderReceiver, LoaderStart,
    Transport, TrustedHeaderClient,
};
use crate::proxy::types::BodySizeLimit;

/// Generic failure
pub const ERR_FAILED: i32 = -2;
/// Operation timed out
pub const ERR_TIMED_OUT: i32 = -7;
/// Response body exceeded the configured limit
pub const ERR_FILE_TOO_BIG: i32 = -8;
/// Connection could not be established or broke
pub const ERR_CONNECTION_FAILED: i32 = -104;
/// URL could not be turned into a request target
pub const ERR_INVALID_URL: i32 = -300;

type HttpClient = Client<HttpConnector, Full<Bytes>>;

#[derive(Clone)]
pub struct HyperTransport {
    client: HttpClient,
    request_timeout: Duration,
    max_response_size: BodySizeLimit,
}

impl HyperTransport {
    pub fn new(request_timeout: Duration, max_response_size: BodySizeLimit) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .http1_title_case_headers(true)
            .http1_preserve_header_case(true)
            .build_http();

        Self {
            client,
            request_timeout,
            max_response_size,
        }
    }
}

impl Transport for HyperTransport {
    fn create_loader_and_start(&self, loader: LoaderReceiver, start: LoaderStart, client: ClientSender) {
        let leg = Loader {
            transport: self.clone(),
            loader,
            client,
        };
        tokio::spawn(leg.run(start));
    }
}

struct Loader {
    transport: HyperTransport,
    loader: LoaderReceiver,
    client: ClientSender,
}

/// Where the loader goes after the response headers are settled
enum Next {
    Redirect(RedirectInfo),
    Body,
}

impl Loader {
    async fn run(mut self, start: LoaderStart) {
        let header_client = start
            .header_hub
            .as_ref()
            .map(|hub| hub.on_loader_created(start.transport_request_id));
        let mut request = start.request;

        loop {
            if let Some(channel) = &header_client {
                match channel.on_before_send_headers(request.headers.clone()).await {
                    Ok(Some(headers)) => request.replace_headers(headers),
                    Ok(None) => {}
                    Err(error) => return self.complete(CompletionStatus::from_error(error)),
                }
            }

            if self.loader.is_closed() {
                trace!(url = %request.url, "loader dropped before send");
                return;
            }
            let response = match self.send(&request).await {
                Ok(response) => response,
                Err(error) => return self.complete(CompletionStatus::from_error(error)),
            };
            let (parts, body) = response.into_parts();
            let headers = ResponseHeaders::from_parts(parts.status, parts.version, parts.headers);

            let (head, next) = match self
                .negotiate_response(header_client.as_ref(), &request, headers)
                .await
            {
                Ok(settled) => settled,
                Err(error) => return self.complete(CompletionStatus::from_error(error)),
            };

            match next {
                Next::Redirect(redirect) => {
                    debug!(from = %request.url, to = %redirect.new_url, "transport redirect");
                    if self
                        .client
                        .send(ClientEvent::ReceiveRedirect(redirect.clone(), head))
                        .is_err()
                    {
                        return;
                    }
                    drop(body);
                    if !self.await_follow_redirect(&mut request, &redirect).await {
                        return;
                    }
                }
                Next::Body => {
                    if self.client.send(ClientEvent::ReceiveResponse(head)).is_err() {
                        return;
                    }
                    return self.stream_body(body).await;
                }
            }
        }
    }

    async fn send(&self, request: &ResourceRequest) -> Result<hyper::Response<Incoming>, NetError> {
        let outgoing = build_request(request)?;
        let timeout = self.transport.request_timeout;

        trace!(method = %request.method, url = %request.url, "sending request");
        tokio::time::timeout(timeout, self.transport.client.request(outgoing))
            .await
            .map_err(|_| NetError::Transport {
                code: ERR_TIMED_OUT,
                message: format!("no response within {timeout:?}"),
            })?
            .map_err(|e| NetError::Transport {
                code: ERR_CONNECTION_FAILED,
                message: e.to_string(),
            })
    }

    /// Run trusted headers-received (if any) and decide between redirect and body
    async fn negotiate_response(
        &self,
        header_client: Option<&TrustedHeaderClient>,
        request: &ResourceRequest,
        headers: ResponseHeaders,
    ) -> Result<(ResponseHead, Next), NetError> {
        let reply = match header_client {
            Some(channel) => Some(channel.on_headers_received(headers.clone(), None).await?),
            None => None,
        };
        settle_response(request, headers, reply)
    }

    /// Returns false when the loader was dropped instead of followed
    async fn await_follow_redirect(&mut self, request: &mut ResourceRequest, redirect: &RedirectInfo) -> bool {
        while let Some(command) = self.loader.recv().await {
            match command {
                LoaderCommand::FollowRedirect(params) => {
                    request.apply_redirect(redirect);
                    request.apply_follow_redirect(&params);
                    return true;
                }
                other => trace!(command = ?other, "ignored while waiting for follow-redirect"),
            }
        }
        trace!("loader dropped during redirect");
        false
    }

    async fn stream_body(mut self, mut body: Incoming) {
        let limit = *self.transport.max_response_size.as_ref();
        let (chunks, receiver) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
        let stream = stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|chunk| (chunk, receiver))
        })
        .boxed();
        if self
            .client
            .send(ClientEvent::StartLoadingResponseBody(stream))
            .is_err()
        {
            return;
        }

        let mut received = 0usize;
        let mut paused = false;
        loop {
            tokio::select! {
                command = self.loader.recv() => match command {
                    Some(LoaderCommand::PauseReadingBodyFromNet) => paused = true,
                    Some(LoaderCommand::ResumeReadingBodyFromNet) => paused = false,
                    Some(other) => trace!(command = ?other, "ignored while streaming"),
                    None => {
                        trace!("loader dropped while streaming; abandoning body");
                        return;
                    }
                },
                frame = body.frame(), if !paused => match frame {
                    Some(Ok(frame)) => {
                        let Ok(data) = frame.into_data() else {
                            continue;
                        };
                        received += data.len();
                        if received > limit {
                            let message = format!("response body exceeds {limit} bytes");
                            let _ = chunks
                                .send(Err(std::io::Error::other(message.clone())))
                                .await;
                            return self.complete(CompletionStatus::from_error(NetError::Transport {
                                code: ERR_FILE_TOO_BIG,
                                message,
                            }));
                        }
                        if chunks.send(Ok(data)).await.is_err() {
                            trace!("body consumer went away");
                        }
                    }
                    Some(Err(e)) => {
                        let message = e.to_string();
                        let _ = chunks.send(Err(std::io::Error::other(message.clone()))).await;
                        warn!(error = %message, "response body failed");
                        return self.complete(CompletionStatus::from_error(NetError::Transport {
                            code: ERR_FAILED,
                            message,
                        }));
                    }
                    None => break,
                },
            }
        }

        drop(chunks);
        let length = received as u64;
        self.complete(CompletionStatus {
            error: None,
            encoded_data_length: length,
            decoded_body_length: length,
        });
    }

    fn complete(&self, status: CompletionStatus) {
        let _ = self.client.send(ClientEvent::Complete(status));
    }
}

/// Apply the trusted headers-received reply, if any, and pick the next step.
///
/// A listener redirect replaces the upstream head with an internal 307 that
/// names the new target.
fn settle_response(
    request: &ResourceRequest,
    mut headers: ResponseHeaders,
    reply: Option<HeadersReceivedReply>,
) -> Result<(ResponseHead, Next), NetError> {
    let trusted = reply.is_some();
    let mut listener_redirect = None;
    if let Some(reply) = reply {
        if let Some(override_headers) = reply.override_headers {
            headers = override_headers;
        }
        listener_redirect = reply.redirect_url;
    }

    let next = match listener_redirect {
        Some(new_url) => {
            headers = ResponseHeaders::internal_redirect(&new_url)?;
            Next::Redirect(RedirectInfo::preserving_method(headers.status(), request, new_url))
        }
        None if headers.is_redirect_status() => match headers.redirect_location() {
            Some(location) => {
                let new_url = request
                    .url
                    .join(location)
                    .map_err(|e| NetError::InvalidRedirect(format!("{location}: {e}")))?;
                Next::Redirect(RedirectInfo::for_response(headers.status(), request, new_url))
            }
            None => Next::Body,
        },
        None => Next::Body,
    };

    let main_headers = if trusted {
        headers.without_set_cookie()
    } else {
        headers
    };
    Ok((ResponseHead::new(main_headers), next))
}

/// Turn a request snapshot into an outgoing hyper request
fn build_request(request: &ResourceRequest) -> Result<Request<Full<Bytes>>, NetError> {
    let uri: Uri = request.url.as_str().parse().map_err(|_| NetError::Transport {
        code: ERR_INVALID_URL,
        message: request.url.to_string(),
    })?;

    let mut headers = request.headers.clone();
    if let Some(initiator) = &request.request_initiator {
        let cross_origin = *initiator != request.url.origin();
        let needs_origin = request.method != Method::GET && request.method != Method::HEAD;
        if !headers.contains_key(header::ORIGIN) && (cross_origin || needs_origin) {
            if let Ok(value) = HeaderValue::from_str(&initiator.ascii_serialization()) {
                headers.insert(header::ORIGIN, value);
            }
        }
    }

    let body = request.body.clone().unwrap_or_default();
    let mut outgoing = Request::builder()
        .method(request.method.clone())
        .uri(uri)
        .body(Full::new(body))
        .map_err(|e| NetError::Transport {
            code: ERR_FAILED,
            message: e.to_string(),
        })?;
    *outgoing.headers_mut() = headers;
    Ok(outgoing)
}
