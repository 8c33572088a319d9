//! Proxy Factory: entry point for new loaders and owner of every live Request Record
//!
//! The factory is driven by a single control flow ([`ProxyFactory::run`]) that
//! pulls one [`FactoryEvent`] at a time from its inbox. Issuers, transports,
//! forwarding tasks and parked listener decisions all talk to it by posting
//! events, so records and the correlation table are only ever touched here.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, trace};

use crate::proxy::correlation::IdCorrelationTable;
use crate::proxy::http_types::{CompletionStatus, NetError, ResourceRequest};
use crate::proxy::listener::RequestListener;
use crate::proxy::record::{RecordParams, RequestRecord, Resumption};
use crate::proxy::scheme::SchemeHandlers;
use crate::proxy::transport::{
    ClientEvent, ClientSender, HeaderEvent, LoaderCommand, LoaderReceiver, LoaderStart, Transport,
    TrustedHeaderHub,
};
use crate::proxy::types::{
    FactoryConfig, LoadOptions, ProxyError, ProxyResult, RequestId, RoutingId, TransportRequestId,
};

/// Issuer request to create and start a loader
#[derive(Debug)]
pub struct CreateLoaderParams {
    pub routing_id: RoutingId,
    pub transport_request_id: TransportRequestId,
    pub options: LoadOptions,
    pub request: ResourceRequest,
    /// Endpoint the issuer sends loader commands into
    pub loader: LoaderReceiver,
    /// Endpoint the issuer receives events from
    pub client: ClientSender,
}

/// Everything that can happen to a factory
#[derive(Debug)]
pub(crate) enum FactoryEvent {
    CreateLoader(CreateLoaderParams),
    IssuerBound,
    IssuerUnbound,
    TransportDisconnected,
    Issuer {
        request_id: RequestId,
        command: LoaderCommand,
    },
    IssuerDisconnected {
        request_id: RequestId,
    },
    Client {
        request_id: RequestId,
        generation: u64,
        event: ClientEvent,
    },
    ClientDisconnected {
        request_id: RequestId,
        generation: u64,
    },
    LoaderCreated {
        transport_request_id: TransportRequestId,
        binding: u64,
    },
    Header {
        transport_request_id: TransportRequestId,
        binding: u64,
        event: HeaderEvent,
    },
    Resume {
        request_id: RequestId,
        ticket: u64,
        resumption: Resumption,
    },
}

/// Shared, read-mostly state every record consults
pub(crate) struct FactoryContext {
    pub(crate) config: FactoryConfig,
    pub(crate) listener: Arc<dyn RequestListener>,
    pub(crate) transport: Option<Arc<dyn Transport>>,
    pub(crate) inbox: mpsc::UnboundedSender<FactoryEvent>,
    pub(crate) header_hub: Option<TrustedHeaderHub>,
}

impl FactoryContext {
    pub(crate) fn header_channel_available(&self) -> bool {
        self.header_hub.is_some()
    }
}

/// The two independent signals that keep a factory alive
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Liveness {
    /// Some issuer binding or the transport link is still open
    pub peers_alive: bool,
    /// Some Request Record is still registered
    pub requests_pending: bool,
}

impl Liveness {
    pub fn may_free(self) -> bool {
        !self.peers_alive && !self.requests_pending
    }
}

pub struct ProxyFactory {
    ctx: FactoryContext,
    handlers: SchemeHandlers,
    inbox: mpsc::UnboundedReceiver<FactoryEvent>,
    requests: HashMap<RequestId, RequestRecord>,
    correlation: IdCorrelationTable,
    next_request_id: u64,
    issuer_bindings: usize,
    transport_watch: Option<AbortHandle>,
}

impl ProxyFactory {
    /// Create a factory and its first issuer binding
    pub fn new(
        config: FactoryConfig,
        listener: Arc<dyn RequestListener>,
        transport: Arc<dyn Transport>,
        handlers: SchemeHandlers,
    ) -> (Self, ProxyFactoryHandle) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let header_hub = config
            .trusted_header_channel
            .then(|| TrustedHeaderHub::new(inbox_tx.clone()));

        let factory = Self {
            ctx: FactoryContext {
                config,
                listener,
                transport: Some(transport),
                inbox: inbox_tx.clone(),
                header_hub,
            },
            handlers,
            inbox: inbox_rx,
            requests: HashMap::new(),
            correlation: IdCorrelationTable::new(),
            next_request_id: 0,
            issuer_bindings: 1,
            transport_watch: None,
        };
        (factory, ProxyFactoryHandle { inbox: inbox_tx })
    }

    pub fn liveness(&self) -> Liveness {
        Liveness {
            peers_alive: self.issuer_bindings > 0 || self.ctx.transport.is_some(),
            requests_pending: !self.requests.is_empty(),
        }
    }

    /// Number of live Request Records
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// Process events until the factory may be freed
    pub async fn run(mut self) {
        self.watch_transport();
        info!(
            trusted_header_channel = self.ctx.config.trusted_header_channel,
            "proxy factory started"
        );

        while !self.liveness().may_free() {
            let Some(event) = self.inbox.recv().await else {
                break;
            };
            self.dispatch(event);
        }

        if let Some(watch) = self.transport_watch.take() {
            watch.abort();
        }
        info!("proxy factory freed");
    }

    fn watch_transport(&mut self) {
        let Some(transport) = &self.ctx.transport else {
            return;
        };
        let closed = transport.closed();
        let inbox = self.ctx.inbox.clone();
        let task = tokio::spawn(async move {
            closed.await;
            let _ = inbox.send(FactoryEvent::TransportDisconnected);
        });
        self.transport_watch = Some(task.abort_handle());
    }

    fn dispatch(&mut self, event: FactoryEvent) {
        match event {
            FactoryEvent::CreateLoader(params) => self.create_loader_and_start(params),
            FactoryEvent::IssuerBound => self.on_issuer_bound(),
            FactoryEvent::IssuerUnbound => self.on_issuer_unbound(),
            FactoryEvent::TransportDisconnected => self.on_transport_disconnected(),
            FactoryEvent::Issuer {
                request_id,
                command,
            } => self.with_record(request_id, |record, ctx| {
                record.on_issuer_command(ctx, command)
            }),
            FactoryEvent::IssuerDisconnected { request_id } => {
                self.with_record(request_id, |record, ctx| record.on_issuer_disconnected(ctx))
            }
            FactoryEvent::Client {
                request_id,
                generation,
                event,
            } => self.with_record(request_id, |record, ctx| {
                record.on_client_event(ctx, generation, event)
            }),
            FactoryEvent::ClientDisconnected {
                request_id,
                generation,
            } => self.with_record(request_id, |record, ctx| {
                record.on_client_disconnected(ctx, generation)
            }),
            FactoryEvent::LoaderCreated {
                transport_request_id,
                binding,
            } => self.on_loader_created(transport_request_id, binding),
            FactoryEvent::Header {
                transport_request_id,
                binding,
                event,
            } => match self.correlation.lookup(transport_request_id) {
                Some(request_id) => self.with_record(request_id, |record, ctx| {
                    record.on_header_event(ctx, binding, event)
                }),
                None => trace!(
                    transport_request_id = %transport_request_id,
                    "header event for unknown transport id"
                ),
            },
            FactoryEvent::Resume {
                request_id,
                ticket,
                resumption,
            } => self.with_record(request_id, |record, ctx| {
                record.resume(ctx, ticket, resumption)
            }),
        }
    }

    /// Run `f` against a live record, deregistering it if it finished
    fn with_record(
        &mut self,
        request_id: RequestId,
        f: impl FnOnce(&mut RequestRecord, &FactoryContext),
    ) {
        let Some(record) = self.requests.get_mut(&request_id) else {
            trace!(request_id = %request_id, "event for a request that is gone");
            return;
        };
        f(record, &self.ctx);
        if record.is_finished() {
            self.remove_request(request_id);
        }
    }

    fn remove_request(&mut self, request_id: RequestId) {
        if let Some(record) = self.requests.remove(&request_id) {
            self.correlation
                .remove(record.transport_request_id(), request_id);
            debug!(
                request_id = %request_id,
                phase = %record.phase(),
                remaining = self.requests.len(),
                "request deregistered"
            );
        }
    }

    fn create_loader_and_start(&mut self, params: CreateLoaderParams) {
        let CreateLoaderParams {
            routing_id,
            transport_request_id,
            options,
            request,
            loader,
            client,
        } = params;

        if let Some(handler) = self.handlers.resolve(request.url.scheme()).cloned() {
            debug!(scheme = request.url.scheme(), "request taken by scheme handler");
            handler.start_loading(request, loader, client);
            return;
        }

        if !self.ctx.listener.has_listener() {
            match &self.ctx.transport {
                Some(transport) => {
                    trace!(url = %request.url, "no listener; passing through");
                    let start = LoaderStart {
                        routing_id,
                        transport_request_id,
                        options,
                        request,
                        header_hub: None,
                    };
                    transport.create_loader_and_start(loader, start, client);
                }
                None => {
                    let _ = client.send(ClientEvent::Complete(CompletionStatus::from_error(
                        NetError::Aborted,
                    )));
                }
            }
            return;
        }

        self.next_request_id += 1;
        let request_id = RequestId::new(self.next_request_id);
        self.correlation.insert(transport_request_id, request_id);

        let watch = self.spawn_issuer_watch(request_id, loader, client.clone());
        let mut record = RequestRecord::new(
            &self.ctx,
            RecordParams {
                request_id,
                transport_request_id,
                routing_id,
                options,
                request,
                client,
                has_any_extra_headers_listeners: self.ctx.listener.has_extra_headers_listener(),
            },
        );
        record.attach_issuer_watch(watch);
        debug!(
            request_id = %request_id,
            transport_request_id = %transport_request_id,
            "request registered"
        );
        self.requests.insert(request_id, record);
        self.with_record(request_id, |record, ctx| record.start(ctx));
    }

    /// Forward issuer commands into the inbox; report when the issuer goes away
    fn spawn_issuer_watch(
        &self,
        request_id: RequestId,
        mut loader: LoaderReceiver,
        client: ClientSender,
    ) -> AbortHandle {
        let inbox = self.ctx.inbox.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    command = loader.recv() => match command {
                        Some(command) => {
                            if inbox.send(FactoryEvent::Issuer { request_id, command }).is_err() {
                                return;
                            }
                        }
                        None => break,
                    },
                    _ = client.closed() => break,
                }
            }
            let _ = inbox.send(FactoryEvent::IssuerDisconnected { request_id });
        });
        task.abort_handle()
    }

    fn on_loader_created(&mut self, transport_request_id: TransportRequestId, binding: u64) {
        let record = self
            .correlation
            .lookup(transport_request_id)
            .and_then(|request_id| self.requests.get_mut(&request_id));
        match record {
            Some(record) => record.bind_header_channel(binding),
            None => trace!(
                transport_request_id = %transport_request_id,
                "loader created for unknown transport id"
            ),
        }
    }

    fn on_issuer_bound(&mut self) {
        if self.ctx.transport.is_some() {
            self.issuer_bindings += 1;
        }
    }

    fn on_issuer_unbound(&mut self) {
        self.issuer_bindings = self.issuer_bindings.saturating_sub(1);
        if self.issuer_bindings == 0 && self.ctx.transport.take().is_some() {
            debug!(
                pending = self.requests.len(),
                "last issuer binding gone; transport link dropped"
            );
        }
    }

    fn on_transport_disconnected(&mut self) {
        debug!(
            pending = self.requests.len(),
            "transport disconnected; dropping issuer bindings"
        );
        self.ctx.transport = None;
        self.ctx.header_hub = None;
        self.issuer_bindings = 0;
    }
}

/// Issuer-side binding to a [`ProxyFactory`].
///
/// Cloning adds a binding and dropping removes one; the factory drops its
/// transport link once the last binding is gone.
#[derive(Debug)]
pub struct ProxyFactoryHandle {
    inbox: mpsc::UnboundedSender<FactoryEvent>,
}

impl ProxyFactoryHandle {
    pub fn create_loader_and_start(&self, params: CreateLoaderParams) -> ProxyResult<()> {
        self.inbox
            .send(FactoryEvent::CreateLoader(params))
            .map_err(|_| ProxyError::FactoryClosed)
    }

    /// The factory has exited
    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }
}

impl Clone for ProxyFactoryHandle {
    fn clone(&self) -> Self {
        let _ = self.inbox.send(FactoryEvent::IssuerBound);
        Self {
            inbox: self.inbox.clone(),
        }
    }
}

impl Drop for ProxyFactoryHandle {
    fn drop(&mut self) {
        let _ = self.inbox.send(FactoryEvent::IssuerUnbound);
    }
}
