//! The unified client: provider registry, middleware chain, defaults.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock, RwLock};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use orrery_types::{LlmError, LlmErrorKind};

use crate::provider::{DynProvider, EventStream, ProviderAdapter};
use crate::retry::{retry, RetryPolicy};
use crate::{Request, Response};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// Wraps `complete` calls for cross-cutting concerns. The first registered
/// middleware is the outermost wrapper.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn handle(&self, request: Request, next: Next) -> Result<Response, LlmError>;
}

/// Continuation handed to a [`Middleware`]: calls the rest of the chain,
/// ending at the resolved provider adapter.
#[derive(Clone)]
pub struct Next {
    adapter: Arc<DynProvider>,
    chain: Arc<[Arc<dyn Middleware>]>,
    index: usize,
    token: CancellationToken,
}

impl Next {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn run(self, request: Request) -> BoxFuture<Result<Response, LlmError>> {
        Box::pin(async move {
            match self.chain.get(self.index).cloned() {
                Some(mw) => {
                    let next = Next {
                        index: self.index + 1,
                        ..self
                    };
                    mw.handle(request, next).await
                }
                None => self.adapter.complete(&self.token, &request).await,
            }
        })
    }
}

/// Wraps `stream` calls; mirrors [`Middleware`] for the streaming path.
pub trait StreamMiddleware: Send + Sync {
    fn handle(&self, request: Request, next: StreamNext) -> Result<EventStream, LlmError>;
}

#[derive(Clone)]
pub struct StreamNext {
    adapter: Arc<DynProvider>,
    chain: Arc<[Arc<dyn StreamMiddleware>]>,
    index: usize,
    token: CancellationToken,
}

impl StreamNext {
    pub fn run(self, request: Request) -> Result<EventStream, LlmError> {
        match self.chain.get(self.index).cloned() {
            Some(mw) => {
                let next = StreamNext {
                    index: self.index + 1,
                    ..self
                };
                mw.handle(request, next)
            }
            None => Ok(self.adapter.stream(&self.token, &request)),
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in middleware
// ---------------------------------------------------------------------------

/// Retries transient provider errors with backoff.
pub struct RetryMiddleware {
    policy: RetryPolicy,
}

impl RetryMiddleware {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }
}

impl Default for RetryMiddleware {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    async fn handle(&self, request: Request, next: Next) -> Result<Response, LlmError> {
        let token = next.token().clone();
        retry(&token, &self.policy, || {
            next.clone().run(request.clone())
        })
        .await
    }
}

/// Logs request/response metadata at info level.
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn handle(&self, request: Request, next: Next) -> Result<Response, LlmError> {
        tracing::info!(
            model = %request.model,
            messages = request.messages.len(),
            tools = request.tools.len(),
            "llm request"
        );
        let result = next.run(request).await;
        match &result {
            Ok(resp) => tracing::info!(
                model = %resp.model,
                input_tokens = resp.usage.input_tokens,
                output_tokens = resp.usage.output_tokens,
                finish = ?resp.finish_reason,
                "llm response"
            ),
            Err(err) => tracing::warn!(error = %err, "llm request failed"),
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Routes requests to registered provider adapters through the middleware
/// chain.
pub struct Client {
    providers: RwLock<std::collections::HashMap<String, Arc<DynProvider>>>,
    default_provider: RwLock<Option<String>>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    stream_middleware: RwLock<Vec<Arc<dyn StreamMiddleware>>>,
}

impl Client {
    pub fn new() -> Self {
        Self {
            providers: RwLock::new(std::collections::HashMap::new()),
            default_provider: RwLock::new(None),
            middleware: RwLock::new(Vec::new()),
            stream_middleware: RwLock::new(Vec::new()),
        }
    }

    /// Build a client from environment variables, registering an adapter for
    /// every provider whose API key is present.
    pub fn from_env() -> Result<Self, LlmError> {
        let client = Self::new();
        if let Ok(adapter) = crate::AnthropicAdapter::from_env() {
            client.register_provider(adapter);
        }
        if let Ok(adapter) = crate::OpenAiAdapter::from_env() {
            client.register_provider(adapter);
        }
        if let Ok(adapter) = crate::GeminiAdapter::from_env() {
            client.register_provider(adapter);
        }
        if !client.has_providers() {
            return Err(LlmError::new(
                LlmErrorKind::Auth,
                "client",
                "no provider API keys found in environment \
                 (set ANTHROPIC_API_KEY, OPENAI_API_KEY, GEMINI_API_KEY, or GOOGLE_API_KEY)",
            ));
        }
        Ok(client)
    }

    pub fn register_provider(&self, adapter: impl ProviderAdapter + 'static) {
        let name = adapter.name().to_string();
        self.providers
            .write()
            .expect("provider lock poisoned")
            .insert(name, Arc::new(DynProvider::new(adapter)));
    }

    pub fn has_providers(&self) -> bool {
        !self.providers.read().expect("provider lock poisoned").is_empty()
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers
            .read()
            .expect("provider lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn set_default_provider(&self, name: impl Into<String>) {
        *self.default_provider.write().expect("provider lock poisoned") = Some(name.into());
    }

    pub fn with_middleware(self, mw: impl Middleware + 'static) -> Self {
        self.middleware
            .write()
            .expect("middleware lock poisoned")
            .push(Arc::new(mw));
        self
    }

    pub fn with_stream_middleware(self, mw: impl StreamMiddleware + 'static) -> Self {
        self.stream_middleware
            .write()
            .expect("middleware lock poisoned")
            .push(Arc::new(mw));
        self
    }

    /// Resolve the adapter for a request: the request's explicit provider,
    /// the configured default, or the sole registered provider.
    fn resolve_provider(&self, request: &Request) -> Result<Arc<DynProvider>, LlmError> {
        let providers = self.providers.read().expect("provider lock poisoned");
        let name = match &request.provider {
            Some(name) => name.clone(),
            None => {
                let default = self
                    .default_provider
                    .read()
                    .expect("provider lock poisoned")
                    .clone();
                match default {
                    Some(name) => name,
                    None if providers.len() == 1 => {
                        providers.keys().next().cloned().unwrap_or_default()
                    }
                    None => {
                        return Err(LlmError::new(
                            LlmErrorKind::BadRequest,
                            "client",
                            "no provider specified and no default provider set",
                        ))
                    }
                }
            }
        };
        providers.get(&name).cloned().ok_or_else(|| {
            LlmError::new(
                LlmErrorKind::BadRequest,
                "client",
                format!("provider '{name}' not registered"),
            )
        })
    }

    /// Send a blocking request through the middleware chain to the resolved
    /// provider.
    pub async fn complete(
        &self,
        token: &CancellationToken,
        request: Request,
    ) -> Result<Response, LlmError> {
        let adapter = self.resolve_provider(&request)?;
        let chain: Arc<[Arc<dyn Middleware>]> = self
            .middleware
            .read()
            .expect("middleware lock poisoned")
            .clone()
            .into();
        let next = Next {
            adapter,
            chain,
            index: 0,
            token: token.clone(),
        };
        next.run(request).await
    }

    /// Send a streaming request through the stream middleware chain.
    pub fn stream(
        &self,
        token: &CancellationToken,
        request: Request,
    ) -> Result<EventStream, LlmError> {
        let adapter = self.resolve_provider(&request)?;
        let chain: Arc<[Arc<dyn StreamMiddleware>]> = self
            .stream_middleware
            .read()
            .expect("middleware lock poisoned")
            .clone()
            .into();
        let next = StreamNext {
            adapter,
            chain,
            index: 0,
            token: token.clone(),
        };
        next.run(request)
    }

    /// Shut down every registered adapter.
    pub async fn close(&self) {
        let adapters: Vec<Arc<DynProvider>> = self
            .providers
            .read()
            .expect("provider lock poisoned")
            .values()
            .cloned()
            .collect();
        for adapter in adapters {
            adapter.close().await;
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Process-wide default client
// ---------------------------------------------------------------------------

static GLOBAL_CLIENT: OnceLock<RwLock<Option<Arc<Client>>>> = OnceLock::new();

fn global_slot() -> &'static RwLock<Option<Arc<Client>>> {
    GLOBAL_CLIENT.get_or_init(|| RwLock::new(None))
}

/// The process-wide default client, initialized lazily from environment
/// variables on first use. Prefer passing an injected [`Client`]; this
/// exists for contexts where plumbing one through is impractical.
pub fn global() -> Result<Arc<Client>, LlmError> {
    {
        let slot = global_slot().read().expect("global client lock poisoned");
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
    }
    let client = Arc::new(Client::from_env()?);
    let mut slot = global_slot().write().expect("global client lock poisoned");
    Ok(slot.get_or_insert(client).clone())
}

/// Replace the process-wide default client (tests inject mocks here).
pub fn set_global(client: Arc<Client>) {
    *global_slot().write().expect("global client lock poisoned") = Some(client);
}

/// Tear down the process-wide default client.
pub fn reset_global() {
    *global_slot().write().expect("global client lock poisoned") = None;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::replay_as_stream;
    use crate::{FinishReason, Message, StreamAccumulator, Usage};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_stream::StreamExt;

    struct MockProvider {
        name: String,
        calls: Arc<AtomicUsize>,
        fail_first: usize,
    }

    impl MockProvider {
        fn named(name: &str) -> Self {
            Self {
                name: name.into(),
                calls: Arc::new(AtomicUsize::new(0)),
                fail_first: 0,
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for MockProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn complete(
            &self,
            _token: &CancellationToken,
            request: &Request,
        ) -> Result<Response, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                return Err(LlmError::from_status(503, "unavailable", &self.name));
            }
            let mut resp = Response::text("resp-1", &request.model, format!("from {}", self.name));
            resp.usage = Usage {
                input_tokens: 7,
                output_tokens: 3,
                total_tokens: 10,
                ..Default::default()
            };
            Ok(resp)
        }

        fn stream(&self, _token: &CancellationToken, request: &Request) -> EventStream {
            replay_as_stream(Ok(Response::text(
                "resp-1",
                &request.model,
                format!("from {}", self.name),
            )))
        }
    }

    fn request_for(model: &str, provider: Option<&str>) -> Request {
        let mut req = Request::new(model);
        req.provider = provider.map(String::from);
        req.messages.push(Message::user("hi"));
        req
    }

    #[tokio::test]
    async fn single_provider_is_auto_default() {
        let client = Client::new();
        client.register_provider(MockProvider::named("mock"));

        let resp = client
            .complete(&CancellationToken::new(), request_for("m", None))
            .await
            .unwrap();
        assert_eq!(resp.content, "from mock");
    }

    #[tokio::test]
    async fn explicit_provider_wins() {
        let client = Client::new();
        client.register_provider(MockProvider::named("alpha"));
        client.register_provider(MockProvider::named("beta"));
        client.set_default_provider("alpha");

        let resp = client
            .complete(&CancellationToken::new(), request_for("m", Some("beta")))
            .await
            .unwrap();
        assert_eq!(resp.content, "from beta");
    }

    #[tokio::test]
    async fn two_providers_without_default_is_an_error() {
        let client = Client::new();
        client.register_provider(MockProvider::named("alpha"));
        client.register_provider(MockProvider::named("beta"));

        let err = client
            .complete(&CancellationToken::new(), request_for("m", None))
            .await
            .unwrap_err();
        assert_eq!(err.kind, LlmErrorKind::BadRequest);
    }

    #[tokio::test]
    async fn unknown_provider_is_an_error() {
        let client = Client::new();
        client.register_provider(MockProvider::named("alpha"));
        let err = client
            .complete(&CancellationToken::new(), request_for("m", Some("gamma")))
            .await
            .unwrap_err();
        assert!(err.message.contains("not registered"));
    }

    #[tokio::test]
    async fn middleware_runs_in_registration_order_outermost_first() {
        struct TagMiddleware {
            tag: &'static str,
            order: Arc<std::sync::Mutex<Vec<&'static str>>>,
        }

        #[async_trait]
        impl Middleware for TagMiddleware {
            async fn handle(&self, request: Request, next: Next) -> Result<Response, LlmError> {
                self.order.lock().unwrap().push(self.tag);
                next.run(request).await
            }
        }

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let client = Client::new()
            .with_middleware(TagMiddleware {
                tag: "first",
                order: order.clone(),
            })
            .with_middleware(TagMiddleware {
                tag: "second",
                order: order.clone(),
            });
        client.register_provider(MockProvider::named("mock"));

        client
            .complete(&CancellationToken::new(), request_for("m", None))
            .await
            .unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn retry_middleware_recovers_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let provider = MockProvider {
            name: "flaky".into(),
            calls: calls.clone(),
            fail_first: 2,
        };
        let client = Client::new().with_middleware(RetryMiddleware::new(RetryPolicy {
            max_attempts: 5,
            initial_delay: std::time::Duration::from_millis(1),
            backoff_factor: 1.0,
            max_delay: std::time::Duration::from_millis(5),
            jitter: false,
        }));
        client.register_provider(provider);

        let resp = client
            .complete(&CancellationToken::new(), request_for("m", None))
            .await
            .unwrap();
        assert_eq!(resp.content, "from flaky");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stream_path_resolves_and_accumulates() {
        let client = Client::new();
        client.register_provider(MockProvider::named("mock"));

        let mut stream = client
            .stream(&CancellationToken::new(), request_for("m", None))
            .unwrap();
        let mut acc = StreamAccumulator::new();
        while let Some(event) = stream.next().await {
            acc.process(&event);
        }
        let resp = acc.finish().unwrap();
        assert_eq!(resp.content, "from mock");
        assert_eq!(resp.finish_reason, FinishReason::Stop);
    }

    #[test]
    fn global_client_injection() {
        reset_global();
        let client = Arc::new(Client::new());
        client.register_provider(MockProvider::named("mock"));
        set_global(client.clone());
        let got = global().unwrap();
        assert!(Arc::ptr_eq(&client, &got));
        reset_global();
    }
}
