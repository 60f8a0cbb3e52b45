//! Loopback HTTP transport: a one-operation listener on a local address that
//! treats the callback request's URI as the candidate.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    Router,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use url::Url;

use crate::channel::{
    ChannelBinding, ChannelDescriptor, CloseOnce, ReturnChannel, ReturnTransport,
};
use crate::error::RedirectError;
use crate::identity::OperationId;
use crate::lifecycle::{CandidateSink, OfferOutcome};
use crate::matcher::CallbackPattern;

pub const DEFAULT_CALLBACK_PATH: &str = "/callback";
pub const DEFAULT_BIND_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
/// How long connections may linger after shutdown before the server is aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const SUCCESS_PAGE: &str = "<!doctype html><html><head><meta charset=\"utf-8\"><title>Signed in</title></head><body><p>You can close this window and return to the application.</p></body></html>";
const FAILURE_PAGE: &str = "<!doctype html><html><head><meta charset=\"utf-8\"><title>Sign-in failed</title></head><body><p>The application could not complete the request. You can close this window.</p></body></html>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortPolicy {
    /// Let the OS pick a free port.
    #[default]
    Ephemeral,
    Fixed(u16),
    /// First port that binds, probing `start..=end` in ascending order.
    Range { start: u16, end: u16 },
}

impl PortPolicy {
    /// Parses `0`, a single port, or an inclusive `start-end` range.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        if let Some((start, end)) = trimmed.split_once('-') {
            let start = start
                .trim()
                .parse::<u16>()
                .map_err(|error| format!("{trimmed}: {error}"))?;
            let end = end
                .trim()
                .parse::<u16>()
                .map_err(|error| format!("{trimmed}: {error}"))?;
            if start == 0 || end < start {
                return Err(format!("{trimmed}: range must be ascending and non-zero"));
            }
            return Ok(Self::Range { start, end });
        }
        match trimmed
            .parse::<u16>()
            .map_err(|error| format!("{trimmed}: {error}"))?
        {
            0 => Ok(Self::Ephemeral),
            port => Ok(Self::Fixed(port)),
        }
    }

    fn candidates(self) -> Vec<u16> {
        match self {
            Self::Ephemeral => vec![0],
            Self::Fixed(port) => vec![port],
            Self::Range { start, end } => (start..=end).collect(),
        }
    }
}

impl fmt::Display for PortPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ephemeral => f.write_str("ephemeral"),
            Self::Fixed(port) => write!(f, "{port}"),
            Self::Range { start, end } => write!(f, "{start}-{end}"),
        }
    }
}

/// The accepted request as seen by a response builder.
#[derive(Debug, Clone)]
pub struct CallbackRequest {
    pub method: Method,
    pub uri: Url,
    pub headers: HeaderMap,
}

#[derive(Debug, Clone)]
pub struct CallbackResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl CallbackResponse {
    #[must_use]
    pub fn html(status: StatusCode, body: impl Into<String>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        Self {
            status,
            headers,
            body: body.into(),
        }
    }

    #[must_use]
    pub fn success_page() -> Self {
        Self::html(StatusCode::OK, SUCCESS_PAGE)
    }

    #[must_use]
    pub fn failure_page() -> Self {
        Self::html(StatusCode::BAD_REQUEST, FAILURE_PAGE)
    }

    /// Redirects the browser to a page the application hosts elsewhere.
    #[must_use]
    pub fn redirect(location: &str) -> Self {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(location) {
            headers.insert(header::LOCATION, value);
        }
        Self {
            status: StatusCode::FOUND,
            headers,
            body: String::new(),
        }
    }

    fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            headers: HeaderMap::new(),
            body: String::new(),
        }
    }
}

impl IntoResponse for CallbackResponse {
    fn into_response(self) -> Response {
        (self.status, self.headers, self.body).into_response()
    }
}

pub type SuccessResponseBuilder = Arc<dyn Fn(&CallbackRequest) -> CallbackResponse + Send + Sync>;
pub type FailureResponseBuilder =
    Arc<dyn Fn(&CallbackRequest, &RedirectError) -> CallbackResponse + Send + Sync>;
pub type PortBoundHook = Arc<dyn Fn(u16) + Send + Sync>;

pub struct LoopbackOptions {
    pub bind_host: IpAddr,
    pub port: PortPolicy,
    pub callback_path: String,
    pub success_response: SuccessResponseBuilder,
    pub failure_response: FailureResponseBuilder,
    /// Fires once per opened channel, right after the bind and before the
    /// listener accepts.
    pub on_port_bound: Option<PortBoundHook>,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            bind_host: DEFAULT_BIND_HOST,
            port: PortPolicy::Ephemeral,
            callback_path: DEFAULT_CALLBACK_PATH.to_string(),
            success_response: Arc::new(|_| CallbackResponse::success_page()),
            failure_response: Arc::new(|_, _| CallbackResponse::failure_page()),
            on_port_bound: None,
        }
    }
}

impl LoopbackOptions {
    #[must_use]
    pub fn with_bind_host(mut self, host: IpAddr) -> Self {
        self.bind_host = host;
        self
    }

    #[must_use]
    pub fn with_port(mut self, port: PortPolicy) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn with_callback_path(mut self, path: impl Into<String>) -> Self {
        self.callback_path = normalize_callback_path(&path.into());
        self
    }

    #[must_use]
    pub fn with_success_response(
        mut self,
        builder: impl Fn(&CallbackRequest) -> CallbackResponse + Send + Sync + 'static,
    ) -> Self {
        self.success_response = Arc::new(builder);
        self
    }

    #[must_use]
    pub fn with_failure_response(
        mut self,
        builder: impl Fn(&CallbackRequest, &RedirectError) -> CallbackResponse
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.failure_response = Arc::new(builder);
        self
    }

    #[must_use]
    pub fn on_port_bound(mut self, hook: impl Fn(u16) + Send + Sync + 'static) -> Self {
        self.on_port_bound = Some(Arc::new(hook));
        self
    }
}

fn normalize_callback_path(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

pub struct LoopbackTransport {
    bind_host: IpAddr,
    port: PortPolicy,
    callback_path: String,
    success_response: SuccessResponseBuilder,
    failure_response: FailureResponseBuilder,
    on_port_bound: Option<PortBoundHook>,
}

impl LoopbackTransport {
    #[must_use]
    pub fn new(options: LoopbackOptions) -> Self {
        Self {
            bind_host: options.bind_host,
            port: options.port,
            callback_path: normalize_callback_path(&options.callback_path),
            success_response: options.success_response,
            failure_response: options.failure_response,
            on_port_bound: options.on_port_bound,
        }
    }

    fn bind(&self, operation_id: OperationId) -> Result<StdTcpListener, RedirectError> {
        let mut last_error = None;
        for port in self.port.candidates() {
            match StdTcpListener::bind(SocketAddr::new(self.bind_host, port)) {
                Ok(listener) => return Ok(listener),
                Err(error) => {
                    tracing::debug!(
                        operation_id = %operation_id,
                        host = %self.bind_host,
                        port,
                        %error,
                        "Loopback port unavailable"
                    );
                    last_error = Some(error);
                }
            }
        }
        match (self.port, last_error) {
            (PortPolicy::Ephemeral, Some(error)) => Err(RedirectError::io("loopback bind", error)),
            _ => Err(RedirectError::NoPortAvailable {
                host: self.bind_host.to_string(),
                candidates: self.port.to_string(),
            }),
        }
    }
}

struct LoopbackState {
    sink: CandidateSink,
    pattern: CallbackPattern,
    origin: String,
    success_response: SuccessResponseBuilder,
    failure_response: FailureResponseBuilder,
}

impl ReturnTransport for LoopbackTransport {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn open(&self, binding: ChannelBinding) -> Result<Box<dyn ReturnChannel>, RedirectError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| RedirectError::NoRuntime)?;
        let operation_id = binding.operation_id;
        let std_listener = self.bind(operation_id)?;
        std_listener
            .set_nonblocking(true)
            .map_err(|error| RedirectError::io("loopback listener", error))?;
        let local_addr = std_listener
            .local_addr()
            .map_err(|error| RedirectError::io("loopback listener", error))?;
        let port = local_addr.port();

        if let Some(hook) = self.on_port_bound.as_ref() {
            hook(port);
        }

        let listener = tokio::net::TcpListener::from_std(std_listener)
            .map_err(|error| RedirectError::io("loopback listener", error))?;
        let origin = format!("http://{}", SocketAddr::new(self.bind_host, port));
        let callback_uri = Url::parse(&format!("{origin}{}", self.callback_path)).map_err(
            |error| RedirectError::Transport {
                message: format!("invalid loopback callback uri: {error}"),
            },
        )?;

        let state = Arc::new(LoopbackState {
            sink: binding.sink.clone(),
            pattern: CallbackPattern::from_callback_uri(&callback_uri),
            origin,
            success_response: Arc::clone(&self.success_response),
            failure_response: Arc::clone(&self.failure_response),
        });
        let app = Router::new().fallback(handle_callback).with_state(state);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server_sink = binding.sink;
        let server = runtime.spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(error) = server.await {
                tracing::warn!(operation_id = %operation_id, %error, "Loopback server failed");
                server_sink.fail(RedirectError::io("loopback server", error));
            }
        });

        tracing::info!(
            operation_id = %operation_id,
            port,
            callback = %callback_uri,
            "Loopback listener bound"
        );
        Ok(Box::new(LoopbackChannel {
            operation_id,
            descriptor: ChannelDescriptor {
                callback_uri: Some(callback_uri),
                channel_name: None,
                port: Some(port),
                awaits_resume: false,
            },
            shutdown: Mutex::new(Some(shutdown_tx)),
            server: server.abort_handle(),
            runtime,
            close: CloseOnce::default(),
        }))
    }
}

async fn handle_callback(
    State(state): State<Arc<LoopbackState>>,
    method: Method,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let path_and_query = uri
        .path_and_query()
        .map_or("/", |path_and_query| path_and_query.as_str());
    let raw = format!("{}{path_and_query}", state.origin);
    if method != Method::GET && method != Method::POST {
        return CallbackResponse::not_found().into_response();
    }

    match state.sink.offer(&raw, &state.pattern).await {
        OfferOutcome::Accepted(uri) => {
            let request = CallbackRequest {
                method,
                uri,
                headers,
            };
            (state.success_response)(&request).into_response()
        }
        OfferOutcome::Failed(error) => match Url::parse(&raw) {
            Ok(uri) => {
                let request = CallbackRequest {
                    method,
                    uri,
                    headers,
                };
                (state.failure_response)(&request, &error).into_response()
            }
            Err(_) => CallbackResponse::failure_page().into_response(),
        },
        OfferOutcome::Rejected(_) | OfferOutcome::AlreadyResolved => {
            CallbackResponse::not_found().into_response()
        }
    }
}

struct LoopbackChannel {
    operation_id: OperationId,
    descriptor: ChannelDescriptor,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    server: AbortHandle,
    runtime: tokio::runtime::Handle,
    close: CloseOnce,
}

impl ReturnChannel for LoopbackChannel {
    fn descriptor(&self) -> ChannelDescriptor {
        self.descriptor.clone()
    }

    fn close(&self) {
        if !self.close.begin_close() {
            return;
        }
        let shutdown = self
            .shutdown
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(());
        }
        let server = self.server.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(SHUTDOWN_GRACE).await;
            server.abort();
        });
        tracing::debug!(
            operation_id = %self.operation_id,
            port = self.descriptor.port,
            "Loopback listener closed"
        );
    }
}
