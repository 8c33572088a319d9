//! HTTP front-end that issues requests through the interception proxy
//!
//! The gateway plays the issuer role: each inbound request names its target
//! with `X-Target-Url`, becomes a loader created through the
//! [`ProxyFactoryHandle`], follows redirects up to the configured limit, and
//! is answered with whatever response the interception pipeline delivers.
//!
//! ```rust,ignore
//! let router = Gateway::new(handle, limits).into_router();
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, router).await?;
//! ```

use axum::{
    body::Body,
    extract::{Request, State},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use http::{header, HeaderName, HeaderValue};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId as HttpRequestId, SetRequestIdLayer,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use crate::proxy::error_response::{extract_request_id, ErrorResponseExt};
use crate::proxy::factory::{CreateLoaderParams, ProxyFactoryHandle};
use crate::proxy::headers::{paths, HOP_BY_HOP, X_REQUEST_ID, X_TARGET_URL};
use crate::proxy::http_types::{FollowRedirectParams, NetError, ResourceRequest, ResponseHead};
use crate::proxy::transport::{
    client_channel, loader_channel, ClientEvent, ClientReceiver, LoaderCommand, LoaderSender,
};
use crate::proxy::types::{
    BodySizeLimit, LoadOptions, ProxyError, ProxyResult, RedirectLimit, RoutingId,
    TransportRequestId,
};
use crate::proxy::url_resolver::UrlResolver;

/// Limits applied to every inbound request
#[derive(Clone, Copy, Debug)]
pub struct GatewayLimits {
    pub max_redirects: RedirectLimit,
    pub max_request_size: BodySizeLimit,
}

pub struct Gateway {
    factory: ProxyFactoryHandle,
    limits: GatewayLimits,
    next_transport_id: AtomicI32,
}

impl Gateway {
    pub fn new(factory: ProxyFactoryHandle, limits: GatewayLimits) -> Self {
        Self {
            factory,
            limits,
            next_transport_id: AtomicI32::new(0),
        }
    }

    pub fn into_router(self) -> Router {
        let request_body_limit = *self.limits.max_request_size.as_ref();
        let request_id_header = HeaderName::from_static(X_REQUEST_ID);

        Router::new()
            .route(paths::HEALTH, get(health_handler))
            .fallback(gateway_handler)
            .with_state(Arc::new(self))
            .layer(
                ServiceBuilder::new()
                    .layer(SetRequestIdLayer::new(
                        request_id_header.clone(),
                        MakeRequestUuidV7,
                    ))
                    .layer(TraceLayer::new_for_http())
                    .layer(PropagateRequestIdLayer::new(request_id_header))
                    .layer(RequestBodyLimitLayer::new(request_body_limit)),
            )
    }

    /// Next transport-assigned id; zero is reserved for "unassigned"
    fn allocate_transport_id(&self) -> TransportRequestId {
        loop {
            let id = self
                .next_transport_id
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1);
            if id != 0 {
                return TransportRequestId::new(id);
            }
        }
    }

    async fn issue(&self, request: Request) -> ProxyResult<Response> {
        let target = UrlResolver::extract_target_url(&request)?;
        let url = UrlResolver::resolve_target_url(&target, request.uri())?;
        let (parts, body) = request.into_parts();

        let limit = *self.limits.max_request_size.as_ref();
        let body = axum::body::to_bytes(body, limit)
            .await
            .map_err(|_| ProxyError::RequestTooLarge {
                max_size: self.limits.max_request_size,
            })?;

        let mut resource = ResourceRequest::new(parts.method, url);
        resource.headers = forwarded_headers(&parts.headers);
        if !body.is_empty() {
            resource = resource.with_body(body);
        }
        if let Some(initiator) = initiator_origin(&parts.headers) {
            resource = resource.with_initiator(initiator);
        }

        let (loader, loader_endpoint) = loader_channel();
        let (client, events) = client_channel();
        self.factory.create_loader_and_start(CreateLoaderParams {
            routing_id: RoutingId::new(0),
            transport_request_id: self.allocate_transport_id(),
            options: LoadOptions::default(),
            request: resource,
            loader: loader_endpoint,
            client,
        })?;

        Issued {
            loader,
            events,
            max_redirects: self.limits.max_redirects,
            redirects: 0,
            response: None,
        }
        .await_response()
        .await
    }
}

/// Issuer side of one inbound request
struct Issued {
    loader: LoaderSender,
    events: ClientReceiver,
    max_redirects: RedirectLimit,
    redirects: u8,
    response: Option<ResponseHead>,
}

impl Issued {
    async fn await_response(mut self) -> ProxyResult<Response> {
        while let Some(event) = self.events.recv().await {
            match event {
                ClientEvent::ReceiveRedirect(redirect, _) => {
                    self.redirects += 1;
                    if self.redirects > *self.max_redirects.as_ref() {
                        return Err(ProxyError::TooManyRedirects(self.max_redirects));
                    }
                    debug!(to = %redirect.new_url, hop = self.redirects, "following redirect");
                    self.send(LoaderCommand::FollowRedirect(FollowRedirectParams::default()))?;
                }
                ClientEvent::ReceiveResponse(head) => self.response = Some(head),
                ClientEvent::UploadProgress { ack, .. } => {
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                }
                ClientEvent::StartLoadingResponseBody(body) => {
                    let head = self.response.take().ok_or_else(|| {
                        ProxyError::Internal("response body before response head".to_string())
                    })?;
                    let response = build_response(head, Body::from_stream(body))?;
                    tokio::spawn(self.drain());
                    return Ok(response);
                }
                ClientEvent::Complete(status) => {
                    if let Some(error) = status.error {
                        return Err(error.into());
                    }
                    let head = self.response.take().ok_or_else(|| {
                        ProxyError::Internal("completed without a response".to_string())
                    })?;
                    return build_response(head, Body::empty());
                }
                ClientEvent::ReceiveCachedMetadata(_) | ClientEvent::TransferSizeUpdated(_) => {}
            }
        }
        Err(NetError::Aborted.into())
    }

    fn send(&self, command: LoaderCommand) -> ProxyResult<()> {
        self.loader
            .send(command)
            .map_err(|_| ProxyError::Net(NetError::Aborted))
    }

    /// Keep the loader open until the request reaches its terminal event
    async fn drain(mut self) {
        while let Some(event) = self.events.recv().await {
            if let ClientEvent::Complete(status) = event {
                if let Some(error) = status.error {
                    warn!(error = %error, "request failed while streaming the body");
                }
                break;
            }
        }
    }
}

fn forwarded_headers(inbound: &http::HeaderMap) -> http::HeaderMap {
    let mut headers = inbound.clone();
    headers.remove(X_TARGET_URL);
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers
}

fn initiator_origin(inbound: &http::HeaderMap) -> Option<url::Origin> {
    let origin = inbound.get(header::ORIGIN)?.to_str().ok()?;
    Url::parse(origin).ok().map(|url| url.origin())
}

fn build_response(head: ResponseHead, body: Body) -> ProxyResult<Response> {
    let headers = head
        .headers
        .ok_or_else(|| ProxyError::InvalidResponseHeaders("missing status line".to_string()))?;

    let mut response = Response::builder().status(headers.status()).body(body)?;
    for (name, value) in headers.headers() {
        if name == header::TRANSFER_ENCODING || name == header::CONTENT_LENGTH {
            continue;
        }
        response.headers_mut().append(name.clone(), value.clone());
    }
    Ok(response)
}

async fn gateway_handler(State(gateway): State<Arc<Gateway>>, request: Request) -> Response {
    let request_id = extract_request_id(request.headers());
    match gateway.issue(request).await {
        Ok(response) => response,
        Err(error) => {
            let status = error.status_code();
            let mut body = error.to_error_response();
            if let Some(id) = request_id {
                body = body.with_request_id(id);
            }
            body.into_response_with_status(status)
        }
    }
}

/// Health check handler
async fn health_handler() -> impl IntoResponse {
    "OK"
}

#[derive(Clone, Copy, Debug, Default)]
struct MakeRequestUuidV7;

impl MakeRequestId for MakeRequestUuidV7 {
    fn make_request_id<B>(&mut self, _request: &http::Request<B>) -> Option<HttpRequestId> {
        HeaderValue::from_str(&Uuid::now_v7().to_string())
            .ok()
            .map(HttpRequestId::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::http_types::ResponseHeaders;
    use http::StatusCode;

    #[test]
    fn forwarded_headers_drop_routing_and_hop_headers() {
        let mut inbound = http::HeaderMap::new();
        inbound.insert(X_TARGET_URL, HeaderValue::from_static("http://a.test"));
        inbound.insert(header::HOST, HeaderValue::from_static("gateway"));
        inbound.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        let headers = forwarded_headers(&inbound);

        assert!(headers.get(X_TARGET_URL).is_none());
        assert!(headers.get(header::HOST).is_none());
        assert_eq!(headers.get(header::ACCEPT).unwrap(), "*/*");
    }

    #[test]
    fn initiator_comes_from_origin_header() {
        let mut inbound = http::HeaderMap::new();
        assert!(initiator_origin(&inbound).is_none());

        inbound.insert(header::ORIGIN, HeaderValue::from_static("https://app.test"));
        let origin = initiator_origin(&inbound).unwrap();
        assert_eq!(origin.ascii_serialization(), "https://app.test");
    }

    #[test]
    fn response_keeps_set_cookie_and_drops_framing() {
        let head = ResponseHead::new(
            ResponseHeaders::new(StatusCode::OK)
                .with_header(header::SET_COOKIE, HeaderValue::from_static("a=1"))
                .with_header(header::SET_COOKIE, HeaderValue::from_static("b=2"))
                .with_header(header::CONTENT_LENGTH, HeaderValue::from_static("5")),
        );

        let response = build_response(head, Body::empty()).unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get_all(header::SET_COOKIE).iter().count(), 2);
        assert!(response.headers().get(header::CONTENT_LENGTH).is_none());
    }

    #[tokio::test]
    async fn too_many_redirects_is_reported() {
        let (loader, _loader_endpoint) = loader_channel();
        let (client, events) = client_channel();
        let request = ResourceRequest::get(Url::parse("http://a.test/").unwrap());
        let redirect = crate::proxy::http_types::RedirectInfo::for_response(
            StatusCode::FOUND,
            &request,
            Url::parse("http://a.test/again").unwrap(),
        );
        for _ in 0..2 {
            client
                .send(ClientEvent::ReceiveRedirect(
                    redirect.clone(),
                    ResponseHead::default(),
                ))
                .unwrap();
        }

        let issued = Issued {
            loader,
            events,
            max_redirects: RedirectLimit::try_new(1).unwrap(),
            redirects: 0,
            response: None,
        };

        let error = issued.await_response().await.unwrap_err();
        assert!(matches!(error, ProxyError::TooManyRedirects(_)));
    }
}
