//! Test utilities for proxy module testing
//!
//! Doubles for both collaborators of the factory (a scripted listener and a
//! recording transport) plus a test issuer that drives requests through a
//! running factory.

#[cfg(test)]
pub mod test_helpers {
    use futures_util::future::{BoxFuture, FutureExt};
    use http::{HeaderMap, StatusCode};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::{mpsc, oneshot, watch};
    use tokio::task::JoinHandle;
    use url::Url;

    use crate::proxy::factory::{CreateLoaderParams, ProxyFactory, ProxyFactoryHandle};
    use crate::proxy::http_types::{
        CompletionStatus, NetError, ResourceRequest, ResponseHead, ResponseHeaders,
    };
    use crate::proxy::listener::{
        BeforeRequestOutcome, Decision, HeaderChanges, HeadersReceivedOutcome, RequestListener,
        Verdict,
    };
    use crate::proxy::request_info::RequestInfo;
    use crate::proxy::scheme::SchemeHandlers;
    use crate::proxy::transport::{
        client_channel, loader_channel, ClientEvent, ClientReceiver, ClientSender, LoaderCommand,
        LoaderReceiver, LoaderSender, LoaderStart, Transport,
    };
    use crate::proxy::types::{FactoryConfig, LoadOptions, RoutingId, TransportRequestId};

    /// How long a test waits for an event that should arrive
    pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

    /// How long a test waits to be convinced nothing arrives
    pub const QUIET_PERIOD: Duration = Duration::from_millis(50);

    pub fn url(s: &str) -> Url {
        Url::parse(s).expect("test URL should parse")
    }

    pub fn ok_headers() -> ResponseHeaders {
        ResponseHeaders::new(StatusCode::OK)
    }

    /// A decision that stays pending the first time and proceeds afterwards.
    ///
    /// The returned sender releases the pending decision with the given verdict.
    pub fn gated<T>() -> (
        oneshot::Sender<Verdict<T>>,
        impl Fn() -> Decision<T> + Send + Sync + 'static,
    )
    where
        T: Default + Send + 'static,
    {
        let (release, gate) = oneshot::channel();
        let gate = Mutex::new(Some(gate));
        let decide = move || match gate.lock().unwrap().take() {
            Some(gate) => {
                Decision::pending(async move { gate.await.unwrap_or(Verdict::Cancel) })
            }
            None => Decision::proceed(),
        };
        (release, decide)
    }

    type BeforeRequestHook =
        Box<dyn Fn(&RequestInfo, &ResourceRequest) -> Decision<BeforeRequestOutcome> + Send + Sync>;
    type BeforeSendHeadersHook =
        Box<dyn Fn(&RequestInfo, &ResourceRequest) -> Decision<HeaderChanges> + Send + Sync>;
    type HeadersReceivedHook = Box<
        dyn Fn(&RequestInfo, Option<&ResponseHeaders>) -> Decision<HeadersReceivedOutcome>
            + Send
            + Sync,
    >;

    /// Listener whose blocking hooks are scripted per test and whose calls are logged
    pub struct ScriptedListener {
        active: bool,
        raw_headers: bool,
        before_request: Option<BeforeRequestHook>,
        before_send_headers: Option<BeforeSendHeadersHook>,
        headers_received: Option<HeadersReceivedHook>,
        calls: Mutex<Vec<String>>,
        before_request_snapshots: Mutex<Vec<ResourceRequest>>,
        received_headers: Mutex<Vec<Option<ResponseHeaders>>>,
    }

    impl ScriptedListener {
        pub fn new() -> Self {
            Self {
                active: true,
                raw_headers: false,
                before_request: None,
                before_send_headers: None,
                headers_received: None,
                calls: Mutex::new(Vec::new()),
                before_request_snapshots: Mutex::new(Vec::new()),
                received_headers: Mutex::new(Vec::new()),
            }
        }

        /// No listener registered at all
        pub fn passive() -> Self {
            Self {
                active: false,
                ..Self::new()
            }
        }

        pub fn with_raw_headers(mut self) -> Self {
            self.raw_headers = true;
            self
        }

        pub fn on_before_request(
            mut self,
            hook: impl Fn(&RequestInfo, &ResourceRequest) -> Decision<BeforeRequestOutcome>
                + Send
                + Sync
                + 'static,
        ) -> Self {
            self.before_request = Some(Box::new(hook));
            self
        }

        pub fn on_before_send_headers(
            mut self,
            hook: impl Fn(&RequestInfo, &ResourceRequest) -> Decision<HeaderChanges>
                + Send
                + Sync
                + 'static,
        ) -> Self {
            self.before_send_headers = Some(Box::new(hook));
            self
        }

        pub fn on_headers_received(
            mut self,
            hook: impl Fn(&RequestInfo, Option<&ResponseHeaders>) -> Decision<HeadersReceivedOutcome>
                + Send
                + Sync
                + 'static,
        ) -> Self {
            self.headers_received = Some(Box::new(hook));
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn count(&self, call: &str) -> usize {
            self.calls().iter().filter(|c| c.as_str() == call).count()
        }

        /// Number of completed or error-occurred notifications
        pub fn terminal_count(&self) -> usize {
            self.calls()
                .iter()
                .filter(|c| c.as_str() == "completed" || c.starts_with("error_occurred"))
                .count()
        }

        /// Request snapshots seen by every before-request call
        pub fn before_request_snapshots(&self) -> Vec<ResourceRequest> {
            self.before_request_snapshots.lock().unwrap().clone()
        }

        /// Response headers seen by every headers-received call
        pub fn received_headers(&self) -> Vec<Option<ResponseHeaders>> {
            self.received_headers.lock().unwrap().clone()
        }

        fn log(&self, call: impl Into<String>) {
            self.calls.lock().unwrap().push(call.into());
        }
    }

    impl RequestListener for ScriptedListener {
        fn has_listener(&self) -> bool {
            self.active
        }

        fn needs_raw_headers(&self, _info: &RequestInfo) -> bool {
            self.raw_headers
        }

        fn on_before_request(
            &self,
            info: &RequestInfo,
            request: &ResourceRequest,
        ) -> Decision<BeforeRequestOutcome> {
            self.log("before_request");
            self.before_request_snapshots
                .lock()
                .unwrap()
                .push(request.clone());
            match &self.before_request {
                Some(hook) => hook(info, request),
                None => Decision::proceed(),
            }
        }

        fn on_before_send_headers(
            &self,
            info: &RequestInfo,
            request: &ResourceRequest,
        ) -> Decision<HeaderChanges> {
            self.log("before_send_headers");
            match &self.before_send_headers {
                Some(hook) => hook(info, request),
                None => Decision::proceed(),
            }
        }

        fn on_send_headers(&self, _: &RequestInfo, _: &ResourceRequest, _: &HeaderMap) {
            self.log("send_headers");
        }

        fn on_headers_received(
            &self,
            info: &RequestInfo,
            _request: &ResourceRequest,
            headers: Option<&ResponseHeaders>,
        ) -> Decision<HeadersReceivedOutcome> {
            self.log("headers_received");
            self.received_headers.lock().unwrap().push(headers.cloned());
            match &self.headers_received {
                Some(hook) => hook(info, headers),
                None => Decision::proceed(),
            }
        }

        fn on_response_started(&self, _: &RequestInfo, _: &ResourceRequest) {
            self.log("response_started");
        }

        fn on_before_redirect(&self, _: &RequestInfo, _: &ResourceRequest, _: &Url) {
            self.log("before_redirect");
        }

        fn on_completed(&self, _: &RequestInfo, _: &ResourceRequest, _: &CompletionStatus) {
            self.log("completed");
        }

        fn on_error_occurred(&self, _: &RequestInfo, _: &ResourceRequest, error: &NetError) {
            self.log(format!("error_occurred: {error}"));
        }
    }

    /// One loader the transport was asked to start
    pub struct StartedLoader {
        pub start: LoaderStart,
        pub commands: LoaderReceiver,
        pub client: ClientSender,
    }

    impl StartedLoader {
        pub fn send(&self, event: ClientEvent) {
            self.client
                .send(event)
                .expect("proxy should still listen to this loader");
        }

        /// Deliver a complete, bodiless response
        pub fn respond(&self, headers: ResponseHeaders) {
            self.send(ClientEvent::ReceiveResponse(ResponseHead::new(headers)));
            self.send(ClientEvent::Complete(CompletionStatus::ok()));
        }

        pub async fn next_command(&mut self) -> Option<LoaderCommand> {
            tokio::time::timeout(EVENT_TIMEOUT, self.commands.recv())
                .await
                .expect("timed out waiting for a loader command")
        }
    }

    /// Transport that hands every started loader to the test
    pub struct RecordingTransport {
        started: mpsc::UnboundedSender<StartedLoader>,
        disconnected: watch::Sender<bool>,
    }

    impl Transport for RecordingTransport {
        fn create_loader_and_start(&self, loader: LoaderReceiver, start: LoaderStart, client: ClientSender) {
            let _ = self.started.send(StartedLoader {
                start,
                commands: loader,
                client,
            });
        }

        fn closed(&self) -> BoxFuture<'static, ()> {
            let mut disconnected = self.disconnected.subscribe();
            async move {
                let _ = disconnected.wait_for(|gone| *gone).await;
            }
            .boxed()
        }
    }

    /// Test-side view of a [`RecordingTransport`]
    pub struct TransportSide {
        started: mpsc::UnboundedReceiver<StartedLoader>,
        transport: Arc<RecordingTransport>,
    }

    impl TransportSide {
        pub async fn next_loader(&mut self) -> StartedLoader {
            tokio::time::timeout(EVENT_TIMEOUT, self.started.recv())
                .await
                .expect("timed out waiting for the transport to be called")
                .expect("recording transport closed")
        }

        /// No loader was started within the quiet period
        pub async fn assert_idle(&mut self) {
            let started = tokio::time::timeout(QUIET_PERIOD, self.started.recv()).await;
            assert!(started.is_err(), "transport was called unexpectedly");
        }

        pub fn disconnect(&self) {
            self.transport.disconnected.send_replace(true);
        }
    }

    pub fn recording_transport() -> (Arc<RecordingTransport>, TransportSide) {
        let (started, receiver) = mpsc::unbounded_channel();
        let (disconnected, _) = watch::channel(false);
        let transport = Arc::new(RecordingTransport {
            started,
            disconnected,
        });
        let side = TransportSide {
            started: receiver,
            transport: transport.clone(),
        };
        (transport, side)
    }

    /// A running factory wired to a scripted listener and a recording transport
    pub struct Harness {
        pub handle: Option<ProxyFactoryHandle>,
        pub transport: TransportSide,
        pub listener: Arc<ScriptedListener>,
        pub factory: JoinHandle<()>,
        next_transport_id: i32,
    }

    impl Harness {
        pub fn start(config: FactoryConfig, listener: ScriptedListener) -> Self {
            Self::start_with_handlers(config, listener, SchemeHandlers::new())
        }

        pub fn start_with_handlers(
            config: FactoryConfig,
            listener: ScriptedListener,
            handlers: SchemeHandlers,
        ) -> Self {
            let listener = Arc::new(listener);
            let (transport, side) = recording_transport();
            let (factory, handle) = ProxyFactory::new(config, listener.clone(), transport, handlers);
            Self {
                handle: Some(handle),
                transport: side,
                listener,
                factory: tokio::spawn(factory.run()),
                next_transport_id: 0,
            }
        }

        pub fn sniffed() -> FactoryConfig {
            FactoryConfig::default()
        }

        pub fn trusted() -> FactoryConfig {
            FactoryConfig {
                trusted_header_channel: true,
                ..FactoryConfig::default()
            }
        }

        pub fn handle(&self) -> &ProxyFactoryHandle {
            self.handle.as_ref().expect("handle already dropped")
        }

        /// Issue `request` with a fresh transport-assigned id
        pub fn issue(&mut self, request: ResourceRequest) -> TestIssuer {
            self.next_transport_id += 1;
            let transport_request_id = TransportRequestId::new(self.next_transport_id);
            TestIssuer::issue(self.handle(), request, transport_request_id)
        }

        pub async fn wait_until_freed(self) {
            tokio::time::timeout(EVENT_TIMEOUT, self.factory)
                .await
                .expect("factory did not free itself")
                .expect("factory task panicked");
        }

        /// Wait until the listener log satisfies `condition`
        pub async fn wait_for_calls(&self, condition: impl Fn(&[String]) -> bool) {
            tokio::time::timeout(EVENT_TIMEOUT, async {
                while !condition(&self.listener.calls()) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("listener never reached the expected state");
        }
    }

    /// Issuer end of one request
    pub struct TestIssuer {
        pub loader: LoaderSender,
        pub events: ClientReceiver,
    }

    impl TestIssuer {
        pub fn issue(
            handle: &ProxyFactoryHandle,
            request: ResourceRequest,
            transport_request_id: TransportRequestId,
        ) -> Self {
            let (loader, loader_endpoint) = loader_channel();
            let (client, events) = client_channel();
            handle
                .create_loader_and_start(CreateLoaderParams {
                    routing_id: RoutingId::new(1),
                    transport_request_id,
                    options: LoadOptions::default(),
                    request,
                    loader: loader_endpoint,
                    client,
                })
                .expect("factory should accept the request");
            Self { loader, events }
        }

        pub async fn next_event(&mut self) -> ClientEvent {
            tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
                .await
                .expect("timed out waiting for an issuer event")
                .expect("proxy closed the issuer channel")
        }

        /// The proxy dropped every sender of this issuer's client channel
        pub async fn assert_closed(&mut self) {
            let next = tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
                .await
                .expect("issuer channel stayed open");
            assert!(next.is_none(), "unexpected event after terminal: {next:?}");
        }

        /// Nothing reached the issuer within the quiet period
        pub async fn assert_quiet(&mut self) {
            let next = tokio::time::timeout(QUIET_PERIOD, self.events.recv()).await;
            assert!(next.is_err(), "issuer saw an event too early: {next:?}");
        }

        pub fn command(&self, command: LoaderCommand) {
            self.loader.send(command).expect("proxy dropped the loader");
        }
    }

    pub fn expect_response(event: ClientEvent) -> ResponseHead {
        match event {
            ClientEvent::ReceiveResponse(head) => head,
            other => panic!("expected a response, got {other:?}"),
        }
    }

    pub fn expect_complete(event: ClientEvent) -> CompletionStatus {
        match event {
            ClientEvent::Complete(status) => status,
            other => panic!("expected completion, got {other:?}"),
        }
    }
}
