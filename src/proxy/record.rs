//! Request Record: the per-request interception state machine
//!
//! One record owns one logical request from creation until its terminal
//! event, across every redirect leg. All transitions run on the factory's
//! single control flow; the only suspension points are pending listener
//! decisions, which park the record until a `Resume` event arrives.
//!
//! ```text
//! Created -> AwaitBeforeRequest -> AwaitBeforeSendHeaders -> Forwarding
//!         -> AwaitHeadersReceived -> ResponseStarted -> Streaming -> Completed
//!                                 \-> Redirecting --(follow)--> AwaitBeforeRequest
//! any phase --error/cancel--> Errored
//! ```

use derive_more::Display;
use futures_util::future::FutureExt;
use http::{header, HeaderValue};
use std::collections::VecDeque;
use std::future::Future;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace, warn};
use url::{Origin, Url};

use crate::proxy::factory::{FactoryContext, FactoryEvent};
use crate::proxy::header_mode::HeaderMode;
use crate::proxy::headers::{ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_ORIGIN};
use crate::proxy::http_types::{
    CompletionStatus, FollowRedirectParams, NetError, RedirectInfo, ResourceRequest, ResponseHead,
    ResponseHeaders,
};
use crate::proxy::listener::{
    BeforeRequestOutcome, Decision, HeaderChanges, HeadersReceivedOutcome, Verdict,
};
use crate::proxy::request_info::RequestInfo;
use crate::proxy::transport::{
    client_channel, loader_channel, BeforeSendHeadersReply, ClientEvent, ClientSender,
    HeaderEvent, HeadersReceivedReply, LoaderCommand, LoaderSender, LoaderStart,
};
use crate::proxy::types::{
    LoadOptions, RequestId, RoutingId, SyntheticRedirectCors, TransportRequestId,
};

/// State of a Request Record
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub enum Phase {
    Created,
    AwaitBeforeRequest,
    AwaitBeforeSendHeaders,
    AwaitHeadersReceived,
    Forwarding,
    ResponseStarted,
    Streaming,
    Redirecting,
    Completed,
    Errored,
}

/// What to do once a headers-received decision is available
#[derive(Debug)]
pub(crate) enum AfterHeaders {
    ResponseStarted,
    BeforeRedirect(RedirectInfo),
    /// Answer the trusted header channel
    OverrideHeaders,
}

/// Verdict of a parked listener decision, routed back through the factory
#[derive(Debug)]
pub(crate) enum Resumption {
    BeforeRequest(Verdict<BeforeRequestOutcome>),
    BeforeSendHeaders(Verdict<HeaderChanges>),
    HeadersReceived(Verdict<HeadersReceivedOutcome>, AfterHeaders),
}

/// Issuer or transport input held back while the record is paused
#[derive(Debug)]
enum Inbound {
    Client { generation: u64, event: ClientEvent },
    ClientDisconnected { generation: u64 },
    Issuer(LoaderCommand),
}

/// Parameters the factory hands to a new record
pub(crate) struct RecordParams {
    pub request_id: RequestId,
    pub transport_request_id: TransportRequestId,
    pub routing_id: RoutingId,
    pub options: LoadOptions,
    pub request: ResourceRequest,
    pub client: ClientSender,
    pub has_any_extra_headers_listeners: bool,
}

pub(crate) struct RequestRecord {
    request_id: RequestId,
    transport_request_id: TransportRequestId,
    routing_id: RoutingId,
    options: LoadOptions,
    request: ResourceRequest,
    original_initiator: Option<Origin>,
    info: RequestInfo,
    header_mode: HeaderMode,
    has_any_extra_headers_listeners: bool,
    phase: Phase,

    // Issuer side
    target_client: ClientSender,
    issuer_watch: Option<AbortHandle>,

    // Transport side, per leg
    target_loader: Option<LoaderSender>,
    proxied_client: Option<AbortHandle>,
    client_generation: u64,
    header_binding: Option<u64>,
    before_send_headers_reply: Option<oneshot::Sender<BeforeSendHeadersReply>>,
    headers_received_reply: Option<oneshot::Sender<Result<HeadersReceivedReply, NetError>>>,
    pending_follow_redirect: Option<FollowRedirectParams>,

    // Header negotiation working state
    current_response: ResponseHead,
    override_headers: Option<ResponseHeaders>,
    redirect_url: Option<Url>,

    // Suspension
    client_paused: bool,
    header_paused: bool,
    deferred_client: VecDeque<Inbound>,
    deferred_header: VecDeque<(u64, HeaderEvent)>,
    ticket: u64,
    parked: Option<AbortHandle>,

    completed: bool,
    finished: bool,
}

impl RequestRecord {
    pub(crate) fn new(ctx: &FactoryContext, params: RecordParams) -> Self {
        let original_initiator = params.request.request_initiator.clone();
        let info = RequestInfo::new(
            params.request_id,
            &params.request,
            original_initiator.as_ref(),
            params.routing_id,
            params.options,
        );
        let header_mode = HeaderMode::select(
            ctx.header_channel_available(),
            params.transport_request_id,
            ctx.listener.needs_raw_headers(&info),
        );

        Self {
            request_id: params.request_id,
            transport_request_id: params.transport_request_id,
            routing_id: params.routing_id,
            options: params.options,
            request: params.request,
            original_initiator,
            info,
            header_mode,
            has_any_extra_headers_listeners: params.has_any_extra_headers_listeners,
            phase: Phase::Created,
            target_client: params.client,
            issuer_watch: None,
            target_loader: None,
            proxied_client: None,
            client_generation: 0,
            header_binding: None,
            before_send_headers_reply: None,
            headers_received_reply: None,
            pending_follow_redirect: None,
            current_response: ResponseHead::default(),
            override_headers: None,
            redirect_url: None,
            client_paused: false,
            header_paused: false,
            deferred_client: VecDeque::new(),
            deferred_header: VecDeque::new(),
            ticket: 0,
            parked: None,
            completed: false,
            finished: false,
        }
    }

    pub(crate) fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub(crate) fn transport_request_id(&self) -> TransportRequestId {
        self.transport_request_id
    }

    pub(crate) fn phase(&self) -> Phase {
        self.phase
    }

    /// The record asked to be deregistered
    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    pub(crate) fn attach_issuer_watch(&mut self, watch: AbortHandle) {
        if let Some(previous) = self.issuer_watch.replace(watch) {
            previous.abort();
        }
    }

    // ========== Entry points (called by the factory) ==========

    /// Run the first leg; `new` already derived the info and header mode
    pub(crate) fn start(&mut self, ctx: &FactoryContext) {
        self.restart_internal(ctx);
        self.drain_deferred(ctx);
    }

    pub(crate) fn on_issuer_command(&mut self, ctx: &FactoryContext, command: LoaderCommand) {
        self.accept(ctx, Inbound::Issuer(command));
    }

    pub(crate) fn on_issuer_disconnected(&mut self, ctx: &FactoryContext) {
        if self.finished {
            return;
        }
        debug!(request_id = %self.request_id, "issuer disconnected");
        self.fail(ctx, NetError::Aborted);
    }

    pub(crate) fn on_client_event(&mut self, ctx: &FactoryContext, generation: u64, event: ClientEvent) {
        self.accept(ctx, Inbound::Client { generation, event });
    }

    pub(crate) fn on_client_disconnected(&mut self, ctx: &FactoryContext, generation: u64) {
        self.accept(ctx, Inbound::ClientDisconnected { generation });
    }

    pub(crate) fn bind_header_channel(&mut self, binding: u64) {
        if self.finished {
            return;
        }
        trace!(request_id = %self.request_id, binding, "trusted header channel bound");
        self.header_binding = Some(binding);
    }

    pub(crate) fn on_header_event(&mut self, ctx: &FactoryContext, binding: u64, event: HeaderEvent) {
        if self.finished {
            return;
        }
        if self.header_paused || !self.deferred_header.is_empty() {
            self.deferred_header.push_back((binding, event));
        } else {
            self.dispatch_header(ctx, binding, event);
        }
        self.drain_deferred(ctx);
    }

    /// Continue after a parked listener decision
    pub(crate) fn resume(&mut self, ctx: &FactoryContext, ticket: u64, resumption: Resumption) {
        if self.finished || ticket != self.ticket || self.parked.is_none() {
            trace!(request_id = %self.request_id, ticket, "ignoring stale continuation");
            return;
        }
        self.parked = None;
        debug!(request_id = %self.request_id, phase = %self.phase, "listener decision resolved");

        match resumption {
            Resumption::BeforeRequest(Verdict::Proceed(outcome)) => {
                self.continue_after_before_request(ctx, outcome)
            }
            Resumption::BeforeSendHeaders(Verdict::Proceed(changes)) => {
                self.continue_to_send_headers(ctx, changes)
            }
            Resumption::HeadersReceived(Verdict::Proceed(outcome), then) => {
                self.override_headers = outcome.override_headers;
                self.redirect_url = outcome.redirect_url;
                self.after_headers(ctx, then);
            }
            Resumption::BeforeRequest(Verdict::Cancel)
            | Resumption::BeforeSendHeaders(Verdict::Cancel)
            | Resumption::HeadersReceived(Verdict::Cancel, _) => {
                self.fail(ctx, NetError::BlockedByClient)
            }
        }
        self.drain_deferred(ctx);
    }

    fn accept(&mut self, ctx: &FactoryContext, inbound: Inbound) {
        if self.finished {
            return;
        }
        if self.client_paused || !self.deferred_client.is_empty() {
            trace!(request_id = %self.request_id, "deferring input while paused");
            self.deferred_client.push_back(inbound);
        } else {
            self.dispatch_inbound(ctx, inbound);
        }
        self.drain_deferred(ctx);
    }

    fn drain_deferred(&mut self, ctx: &FactoryContext) {
        loop {
            if self.finished {
                self.deferred_client.clear();
                self.deferred_header.clear();
                return;
            }
            if !self.client_paused {
                if let Some(inbound) = self.deferred_client.pop_front() {
                    self.dispatch_inbound(ctx, inbound);
                    continue;
                }
            }
            if !self.header_paused {
                if let Some((binding, event)) = self.deferred_header.pop_front() {
                    self.dispatch_header(ctx, binding, event);
                    continue;
                }
            }
            return;
        }
    }

    fn dispatch_inbound(&mut self, ctx: &FactoryContext, inbound: Inbound) {
        match inbound {
            Inbound::Client { generation, event } => {
                if generation != self.client_generation {
                    trace!(
                        request_id = %self.request_id,
                        event = event.name(),
                        "dropping event from a closed leg"
                    );
                    return;
                }
                self.on_transport_event(ctx, event);
            }
            Inbound::ClientDisconnected { generation } => {
                if generation == self.client_generation {
                    debug!(request_id = %self.request_id, "transport dropped the loader client");
                    self.fail(ctx, NetError::Aborted);
                }
            }
            Inbound::Issuer(LoaderCommand::FollowRedirect(params)) => {
                self.follow_redirect(ctx, params)
            }
            Inbound::Issuer(command) => {
                if let Some(loader) = &self.target_loader {
                    let _ = loader.send(command);
                }
            }
        }
    }

    fn dispatch_header(&mut self, ctx: &FactoryContext, binding: u64, event: HeaderEvent) {
        if self.header_binding != Some(binding) {
            trace!(request_id = %self.request_id, binding, "dropping header event from a closed leg");
            return;
        }
        match event {
            HeaderEvent::BeforeSendHeaders { headers, reply } => {
                if !self.header_mode.uses_header_channel() {
                    let _ = reply.send(Ok(None));
                    return;
                }
                self.request.replace_headers(headers);
                self.before_send_headers_reply = Some(reply);
                self.continue_to_before_send_headers(ctx);
            }
            HeaderEvent::HeadersReceived {
                headers,
                remote_endpoint,
                reply,
            } => {
                if !self.header_mode.uses_header_channel() {
                    let _ = reply.send(Ok(HeadersReceivedReply::default()));
                    return;
                }
                self.headers_received_reply = Some(reply);
                self.current_response = ResponseHead {
                    headers: Some(headers),
                    remote_endpoint,
                    ..ResponseHead::default()
                };
                self.handle_response_or_redirect_headers(ctx, AfterHeaders::OverrideHeaders);
            }
        }
    }

    // ========== Before-request ==========

    /// Re-derive listener info and header mode from the current snapshot
    fn update_request_info(&mut self, ctx: &FactoryContext) {
        self.info = RequestInfo::new(
            self.request_id,
            &self.request,
            self.original_initiator.as_ref(),
            self.routing_id,
            self.options,
        );
        self.header_mode = HeaderMode::select(
            ctx.header_channel_available(),
            self.transport_request_id,
            ctx.listener.needs_raw_headers(&self.info),
        );
    }

    fn restart_internal(&mut self, ctx: &FactoryContext) {
        self.completed = false;
        self.redirect_url = None;
        self.enter(Phase::AwaitBeforeRequest);
        debug!(
            request_id = %self.request_id,
            url = %self.request.url,
            header_mode = %self.header_mode,
            "starting leg"
        );

        match ctx.listener.on_before_request(&self.info, &self.request) {
            Decision::Ready(Verdict::Cancel) => self.fail(ctx, NetError::BlockedByClient),
            Decision::Ready(Verdict::Proceed(outcome)) => {
                self.continue_after_before_request(ctx, outcome)
            }
            Decision::Pending(future) => {
                self.pause_client();
                self.pause_header();
                self.park(ctx, future.map(Resumption::BeforeRequest));
            }
        }
    }

    fn continue_after_before_request(&mut self, ctx: &FactoryContext, outcome: BeforeRequestOutcome) {
        self.redirect_url = outcome.redirect_url;
        if self.header_mode.uses_header_channel() {
            // The transport will raise before-send-headers over the channel.
            self.continue_to_start_request(ctx);
        } else {
            self.continue_to_before_send_headers(ctx);
        }
    }

    // ========== Before-send-headers / send-headers ==========

    fn continue_to_before_send_headers(&mut self, ctx: &FactoryContext) {
        if self.header_mode.runs_before_send_headers_locally() && self.redirect_url.is_some() {
            self.handle_before_request_redirect(ctx);
            return;
        }

        self.resume_client();
        self.enter(Phase::AwaitBeforeSendHeaders);
        match ctx.listener.on_before_send_headers(&self.info, &self.request) {
            Decision::Ready(Verdict::Cancel) => self.fail(ctx, NetError::BlockedByClient),
            Decision::Ready(Verdict::Proceed(changes)) => self.continue_to_send_headers(ctx, changes),
            Decision::Pending(future) => {
                self.pause_client();
                self.park(ctx, future.map(Resumption::BeforeSendHeaders));
            }
        }
    }

    fn continue_to_send_headers(&mut self, ctx: &FactoryContext, changes: HeaderChanges) {
        self.request.apply_header_changes(&changes);

        if self.header_mode.uses_header_channel() {
            match self.before_send_headers_reply.take() {
                Some(reply) => {
                    let _ = reply.send(Ok(Some(self.request.headers.clone())));
                }
                None => warn!(
                    request_id = %self.request_id,
                    "no trusted-channel before-send-headers callback to answer"
                ),
            }
        } else if let Some(mut params) = self.pending_follow_redirect.take() {
            params.removed_headers.extend(changes.removed.iter().cloned());
            for name in changes.set_names() {
                match self.request.headers.get(name) {
                    Some(value) => {
                        params.modified_headers.insert(name.clone(), value.clone());
                    }
                    None => warn!(
                        request_id = %self.request_id,
                        header = %name,
                        "header set by listener is missing from the request"
                    ),
                }
            }
            if let Some(loader) = &self.target_loader {
                let _ = loader.send(LoaderCommand::FollowRedirect(params));
            }
        }

        self.resume_client();
        ctx.listener
            .on_send_headers(&self.info, &self.request, &self.request.headers);

        if !self.header_mode.uses_header_channel() {
            self.continue_to_start_request(ctx);
        }
    }

    // ========== Start ==========

    fn continue_to_start_request(&mut self, ctx: &FactoryContext) {
        if self.header_mode.uses_header_channel() && self.redirect_url.is_some() {
            self.handle_before_request_redirect(ctx);
            return;
        }

        self.resume_client();
        self.resume_header();

        if self.target_loader.is_none() {
            let Some(transport) = ctx.transport.as_ref() else {
                warn!(request_id = %self.request_id, "transport link is gone; aborting");
                self.fail(ctx, NetError::Aborted);
                return;
            };

            // Later legs of a redirect chain may need the header channel even
            // when this one does not.
            let options = self.options.with_header_channel(
                self.has_any_extra_headers_listeners || self.header_mode.uses_header_channel(),
            );
            let (loader, loader_endpoint) = loader_channel();
            let client = self.bind_proxied_client(ctx);
            let start = LoaderStart {
                routing_id: self.routing_id,
                transport_request_id: self.transport_request_id,
                options,
                request: self.request.clone(),
                header_hub: if options.use_header_channel {
                    ctx.header_hub.clone()
                } else {
                    None
                },
            };
            debug!(
                request_id = %self.request_id,
                transport_request_id = %self.transport_request_id,
                url = %self.request.url,
                "forwarding to transport"
            );
            transport.create_loader_and_start(loader_endpoint, start, client);
            self.target_loader = Some(loader);
        }

        self.enter(Phase::Forwarding);
    }

    fn bind_proxied_client(&mut self, ctx: &FactoryContext) -> ClientSender {
        self.client_generation += 1;
        let generation = self.client_generation;
        let request_id = self.request_id;
        let inbox = ctx.inbox.clone();
        let (client, mut events) = client_channel();

        let task = tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let forwarded = FactoryEvent::Client {
                    request_id,
                    generation,
                    event,
                };
                if inbox.send(forwarded).is_err() {
                    return;
                }
            }
            let _ = inbox.send(FactoryEvent::ClientDisconnected {
                request_id,
                generation,
            });
        });

        if let Some(previous) = self.proxied_client.replace(task.abort_handle()) {
            previous.abort();
        }
        client
    }

    /// Drop every transport-facing channel of the current leg
    fn close_transport_channels(&mut self) {
        if let Some(task) = self.proxied_client.take() {
            task.abort();
        }
        self.client_generation += 1;
        self.target_loader = None;
        self.header_binding = None;
        self.before_send_headers_reply = None;
        self.headers_received_reply = None;
        self.deferred_header.clear();
    }

    // ========== Transport events ==========

    fn on_transport_event(&mut self, ctx: &FactoryContext, event: ClientEvent) {
        match event {
            ClientEvent::ReceiveResponse(head) => self.on_receive_response(ctx, head),
            ClientEvent::ReceiveRedirect(redirect, head) => {
                self.on_receive_redirect(ctx, redirect, head)
            }
            ClientEvent::Complete(status) => self.on_complete(ctx, status),
            ClientEvent::StartLoadingResponseBody(body) => {
                self.enter(Phase::Streaming);
                self.deliver(ClientEvent::StartLoadingResponseBody(body));
            }
            passthrough => self.deliver(passthrough),
        }
    }

    fn on_receive_response(&mut self, ctx: &FactoryContext, head: ResponseHead) {
        if self.header_mode.reuses_channel_response_headers() {
            // The main event may lack Set-Cookie; keep what the channel delivered.
            let captured = self.current_response.headers.take();
            self.current_response = head;
            if captured.is_some() {
                self.current_response.headers = captured;
            }
            self.continue_to_response_started(ctx);
        } else {
            self.current_response = head;
            self.handle_response_or_redirect_headers(ctx, AfterHeaders::ResponseStarted);
        }
    }

    fn on_receive_redirect(&mut self, ctx: &FactoryContext, redirect: RedirectInfo, head: ResponseHead) {
        if self.header_mode.reuses_channel_response_headers() {
            // An upgrade redirect may arrive without a preceding channel event.
            let captured = self.current_response.headers.take();
            self.current_response = head;
            if captured.is_some() {
                self.current_response.headers = captured;
            }
            self.continue_to_before_redirect(ctx, redirect);
        } else {
            self.current_response = head;
            self.handle_response_or_redirect_headers(ctx, AfterHeaders::BeforeRedirect(redirect));
        }
    }

    // ========== Headers-received ==========

    fn handle_response_or_redirect_headers(&mut self, ctx: &FactoryContext, then: AfterHeaders) {
        self.override_headers = None;
        self.redirect_url = None;
        self.info.add_response_info(&self.current_response);
        self.enter(Phase::AwaitHeadersReceived);

        let decision = ctx.listener.on_headers_received(
            &self.info,
            &self.request,
            self.current_response.headers.as_ref(),
        );
        match decision {
            Decision::Ready(Verdict::Cancel) => self.fail(ctx, NetError::BlockedByClient),
            Decision::Ready(Verdict::Proceed(outcome)) => {
                self.override_headers = outcome.override_headers;
                self.redirect_url = outcome.redirect_url;
                self.after_headers(ctx, then);
            }
            Decision::Pending(future) => {
                self.pause_client();
                self.park(
                    ctx,
                    future.map(move |verdict| Resumption::HeadersReceived(verdict, then)),
                );
            }
        }
    }

    fn after_headers(&mut self, ctx: &FactoryContext, then: AfterHeaders) {
        match then {
            AfterHeaders::ResponseStarted => self.continue_to_response_started(ctx),
            AfterHeaders::BeforeRedirect(redirect) => self.continue_to_before_redirect(ctx, redirect),
            AfterHeaders::OverrideHeaders => self.continue_to_handle_override_headers(),
        }
    }

    fn continue_to_handle_override_headers(&mut self) {
        let override_headers = self.override_headers.take();
        let redirect_url = self.redirect_url.take();
        if self.header_mode.reuses_channel_response_headers() {
            if redirect_url.is_some() {
                // The transport answers with its own internal redirect head.
                self.current_response.headers = None;
            } else if let Some(headers) = &override_headers {
                // The main response event will arrive stripped; remember the override.
                self.current_response.headers = Some(headers.clone());
            }
        }

        match self.headers_received_reply.take() {
            Some(reply) => {
                let _ = reply.send(Ok(HeadersReceivedReply {
                    override_headers,
                    redirect_url,
                }));
            }
            None => warn!(
                request_id = %self.request_id,
                "no trusted-channel headers-received callback to answer"
            ),
        }

        self.resume_client();
    }

    // ========== Response / redirect finalize ==========

    fn continue_to_response_started(&mut self, ctx: &FactoryContext) {
        if let Some(headers) = self.override_headers.take() {
            if headers.is_redirect_status() {
                // A listener turned the response into a redirect. The transport
                // cannot be told, so fabricate the redirect and drop this leg.
                match self.redirect_from_override(&headers) {
                    Ok(redirect) => {
                        self.current_response.headers = Some(headers);
                        self.close_transport_channels();
                        self.continue_to_before_redirect(ctx, redirect);
                    }
                    Err(error) => self.fail(ctx, error),
                }
                return;
            }
            self.current_response.headers = Some(headers);
        }

        self.info.add_response_info(&self.current_response);
        self.resume_client();
        self.enter(Phase::ResponseStarted);
        ctx.listener.on_response_started(&self.info, &self.request);
        let head = std::mem::take(&mut self.current_response);
        self.deliver(ClientEvent::ReceiveResponse(head));
    }

    fn redirect_from_override(&self, headers: &ResponseHeaders) -> Result<RedirectInfo, NetError> {
        let location = headers.get(header::LOCATION).ok_or_else(|| {
            NetError::InvalidRedirect(format!("{headers} override without a Location header"))
        })?;
        let new_url = self
            .request
            .url
            .join(location)
            .map_err(|e| NetError::InvalidRedirect(format!("{location}: {e}")))?;
        Ok(RedirectInfo::preserving_method(
            headers.status(),
            &self.request,
            new_url,
        ))
    }

    fn continue_to_before_redirect(&mut self, ctx: &FactoryContext, redirect: RedirectInfo) {
        self.info.add_response_info(&self.current_response);
        self.resume_client();
        self.enter(Phase::Redirecting);

        ctx.listener
            .on_before_redirect(&self.info, &self.request, &redirect.new_url);
        let head = std::mem::take(&mut self.current_response);
        self.deliver(ClientEvent::ReceiveRedirect(redirect.clone(), head));

        self.request.apply_redirect(&redirect);
        self.completed = true;
    }

    /// Fabricate a redirect to the listener-chosen URL without contacting the transport
    fn handle_before_request_redirect(&mut self, ctx: &FactoryContext) {
        let Some(redirect_url) = self.redirect_url.take() else {
            return;
        };
        self.close_transport_channels();

        let mut headers = match ResponseHeaders::internal_redirect(&redirect_url) {
            Ok(headers) => headers,
            Err(error) => return self.fail(ctx, error),
        };
        let redirect =
            RedirectInfo::preserving_method(headers.status(), &self.request, redirect_url.clone());

        match ctx.config.synthetic_redirect_cors {
            SyntheticRedirectCors::BlankInitiator => {
                let current_origin = self.request.url.origin();
                let crosses_origin = redirect_url.origin() != current_origin
                    && self
                        .request
                        .request_initiator
                        .as_ref()
                        .is_some_and(|initiator| *initiator != current_origin);
                if crosses_origin {
                    self.request.blank_initiator();
                }
            }
            SyntheticRedirectCors::PermissiveHeaders => {
                if let Some(origin) = self.request.headers.get(header::ORIGIN).cloned() {
                    headers = headers
                        .with_header(ACCESS_CONTROL_ALLOW_ORIGIN, origin)
                        .with_header(
                            ACCESS_CONTROL_ALLOW_CREDENTIALS,
                            HeaderValue::from_static("true"),
                        );
                }
            }
        }

        debug!(
            request_id = %self.request_id,
            to = %redirect_url,
            "synthesizing internal redirect"
        );
        self.current_response = ResponseHead::new(headers);
        self.continue_to_before_redirect(ctx, redirect);
    }

    fn follow_redirect(&mut self, ctx: &FactoryContext, params: FollowRedirectParams) {
        if self.phase != Phase::Redirecting {
            warn!(
                request_id = %self.request_id,
                phase = %self.phase,
                "follow-redirect outside of a redirect; ignoring"
            );
            return;
        }

        self.request.apply_follow_redirect(&params);
        // Header mode may differ for the new leg.
        self.update_request_info(ctx);

        if let Some(loader) = &self.target_loader {
            if self.header_mode.uses_header_channel() {
                // The channel only negotiates headers as part of the transport's
                // own redirect handling, so it has to hear about it now.
                let _ = loader.send(LoaderCommand::FollowRedirect(params));
            } else {
                self.pending_follow_redirect = Some(params);
            }
        }

        self.restart_internal(ctx);
    }

    // ========== Terminal ==========

    fn on_complete(&mut self, ctx: &FactoryContext, status: CompletionStatus) {
        if !status.is_ok() {
            self.on_request_error(ctx, status);
            return;
        }

        if !self.completed {
            self.completed = true;
            self.enter(Phase::Completed);
            self.deliver(ClientEvent::Complete(status.clone()));
            ctx.listener.on_completed(&self.info, &self.request, &status);
            info!(request_id = %self.request_id, url = %self.request.url, "request completed");
        }
        self.finish();
    }

    fn fail(&mut self, ctx: &FactoryContext, error: NetError) {
        self.on_request_error(ctx, CompletionStatus::from_error(error));
    }

    fn on_request_error(&mut self, ctx: &FactoryContext, status: CompletionStatus) {
        let error = status.error.clone().unwrap_or(NetError::Aborted);
        self.reject_header_replies(&error);

        if !self.completed {
            self.completed = true;
            self.enter(Phase::Errored);
            self.deliver(ClientEvent::Complete(status.clone()));
            if let Some(error) = &status.error {
                ctx.listener
                    .on_error_occurred(&self.info, &self.request, error);
                warn!(
                    request_id = %self.request_id,
                    url = %self.request.url,
                    error = %error,
                    "request failed"
                );
            }
        }
        self.finish();
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.close_transport_channels();
        if let Some(parked) = self.parked.take() {
            parked.abort();
        }
    }

    // ========== Helpers ==========

    /// A transport waiting on the header channel must not go ahead with a dead leg
    fn reject_header_replies(&mut self, error: &NetError) {
        if let Some(reply) = self.before_send_headers_reply.take() {
            let _ = reply.send(Err(error.clone()));
        }
        if let Some(reply) = self.headers_received_reply.take() {
            let _ = reply.send(Err(error.clone()));
        }
    }

    fn deliver(&self, event: ClientEvent) {
        if self.target_client.send(event).is_err() {
            trace!(request_id = %self.request_id, "issuer is gone; event dropped");
        }
    }

    fn park<F>(&mut self, ctx: &FactoryContext, decision: F)
    where
        F: Future<Output = Resumption> + Send + 'static,
    {
        self.ticket += 1;
        let ticket = self.ticket;
        let request_id = self.request_id;
        let inbox = ctx.inbox.clone();

        let task = tokio::spawn(async move {
            let resumption = decision.await;
            let _ = inbox.send(FactoryEvent::Resume {
                request_id,
                ticket,
                resumption,
            });
        });

        if let Some(previous) = self.parked.replace(task.abort_handle()) {
            previous.abort();
        }
        debug!(request_id = %self.request_id, phase = %self.phase, "waiting on listener");
    }

    fn enter(&mut self, phase: Phase) {
        trace!(request_id = %self.request_id, from = %self.phase, to = %phase, "phase");
        self.phase = phase;
    }

    fn pause_client(&mut self) {
        self.client_paused = true;
    }

    fn resume_client(&mut self) {
        self.client_paused = false;
    }

    fn pause_header(&mut self) {
        self.header_paused = true;
    }

    fn resume_header(&mut self) {
        self.header_paused = false;
    }
}

impl Drop for RequestRecord {
    fn drop(&mut self) {
        for task in [
            self.parked.take(),
            self.proxied_client.take(),
            self.issuer_watch.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}
