//! HTTP reverse proxying to applications running inside agents.
//!
//! A [`ReverseProxy`] rewrites each request to the agent's virtual address and
//! forwards it with an HTTP/1.1 client whose connector leases sessions from the
//! [`ConnectionCache`](crate::cache::ConnectionCache). One client, and so one
//! pool of HTTP connections, exists per agent.

use std::{
    convert::Infallible, error::Error as StdError, fmt::Write as _, future::Future, io,
    net::Ipv6Addr, pin::Pin, sync::Arc, time::Duration,
};

use bytes::Bytes;
use dynosaur::dynosaur;
use http::{
    HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Uri, Version,
    header,
    uri::{Authority, PathAndQuery, Scheme},
};
use http_body_util::{BodyExt, Full, combinators::UnsyncBoxBody};
use hyper::body::{Body, Incoming};
use hyper_util::{
    client::legacy::Client,
    rt::{TokioExecutor, TokioTimer},
};
use n0_error::{Result, StdResultExt, ensure_any};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{AgentId, TAILNET_SERVICE_PREFIX, error::ConnectError};

pub(crate) use self::connector::AgentConnector;
pub use self::tls::insecure_client_config;

mod connector;
mod tls;

/// Body type of proxied requests and responses.
pub type ProxyBody = UnsyncBoxBody<Bytes, io::Error>;

/// Header carrying the signed application token to the agent.
pub const SIGNED_TOKEN_HEADER: HeaderName = HeaderName::from_static("server-tailnet-signed-token");

/// Default time an unused HTTP connection to an agent stays pooled.
pub const DEFAULT_HTTP_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

const HOP_BY_HOP_HEADERS: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

pub(crate) type AgentClient = Client<AgentConnector, ProxyBody>;

pub(crate) fn agent_client(connector: AgentConnector, pool_idle_timeout: Duration) -> AgentClient {
    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(pool_idle_timeout)
        .pool_timer(TokioTimer::new())
        .build(connector)
}

/// The application a proxy serves, as shown on error pages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppContext {
    /// Name of the application.
    pub name: String,
    /// Name of the user owning the workspace the application runs in.
    pub owner: String,
}

/// What the [`ErrorResponder`] gets to know about a failed request.
#[derive(Debug)]
pub struct ProxyErrorContext<'a> {
    pub status: StatusCode,
    pub agent_id: AgentId,
    pub app: &'a AppContext,
    pub dashboard_url: &'a Uri,
    /// The error, with its causes.
    pub message: &'a str,
}

#[dynosaur(pub DynErrorResponder = dyn(box) ErrorResponder)]
/// Generates HTTP responses for requests that could not be proxied.
pub trait ErrorResponder: Send + Sync {
    fn error_response<'a>(
        &'a self,
        ctx: &'a ProxyErrorContext<'a>,
    ) -> impl Future<Output = Response<ProxyBody>> + Send + 'a;
}

/// Default [`ErrorResponder`]: an HTML page naming the application and linking
/// back to the dashboard.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflinePage;

impl ErrorResponder for OfflinePage {
    async fn error_response<'a>(&'a self, ctx: &'a ProxyErrorContext<'a>) -> Response<ProxyBody> {
        let mut res = Response::new(full_body(offline_page(ctx)));
        *res.status_mut() = ctx.status;
        res.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        res.headers_mut()
            .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        res
    }
}

fn offline_page(ctx: &ProxyErrorContext<'_>) -> String {
    let app = if ctx.app.name.is_empty() {
        "the application".to_string()
    } else {
        format!("<code>{}</code>", escape_html(&ctx.app.name))
    };
    let mut page = String::new();
    let _ = write!(
        page,
        "<!doctype html>\n<html>\n<head><title>Application unavailable</title></head>\n<body>\n\
         <h1>{} {}</h1>\n<p>Failed to proxy the request to {app}",
        ctx.status.as_u16(),
        escape_html(ctx.status.canonical_reason().unwrap_or("Error")),
    );
    if !ctx.app.owner.is_empty() {
        let _ = write!(page, " of <code>{}</code>", escape_html(&ctx.app.owner));
    }
    let _ = write!(
        page,
        ".</p>\n<pre>{}</pre>\n<p><a href=\"{}\">Back to the dashboard</a></p>\n</body>\n</html>\n",
        escape_html(ctx.message),
        escape_html(&ctx.dashboard_url.to_string()),
    );
    page
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Rewrites `request_uri` to target `addr` the way `destination` describes.
///
/// The scheme comes from `destination`, the authority is `[addr]:port` with the
/// destination's explicit port or the scheme's default, the destination's path
/// is joined with the request path by a single slash, and both queries are kept.
///
/// A `request_uri` that already targets `[addr]:port` keeps its path and query,
/// so rewriting twice yields the same URI.
pub fn rewrite_uri(
    destination: &Uri,
    request_uri: &Uri,
    addr: Ipv6Addr,
) -> Result<Uri, http::Error> {
    let scheme = destination.scheme().cloned().unwrap_or(Scheme::HTTP);
    let authority = agent_authority(destination, addr)?;
    if request_uri.authority() == Some(&authority) {
        let path_and_query = match request_uri.path_and_query() {
            Some(path_and_query) => path_and_query.clone(),
            None => PathAndQuery::from_static("/"),
        };
        return Uri::builder()
            .scheme(scheme)
            .authority(authority)
            .path_and_query(path_and_query)
            .build();
    }
    let path = join_paths(destination.path(), request_uri.path());
    let query = match (
        destination.query().unwrap_or_default(),
        request_uri.query().unwrap_or_default(),
    ) {
        ("", "") => None,
        (q, "") | ("", q) => Some(q.to_string()),
        (a, b) => Some(format!("{a}&{b}")),
    };
    let path_and_query = match query {
        Some(query) => format!("{path}?{query}").parse::<PathAndQuery>()?,
        None => path.parse::<PathAndQuery>()?,
    };
    Uri::builder()
        .scheme(scheme)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()
}

fn agent_authority(destination: &Uri, addr: Ipv6Addr) -> Result<Authority, http::Error> {
    let port = destination
        .port_u16()
        .unwrap_or(if destination.scheme() == Some(&Scheme::HTTPS) {
            443
        } else {
            80
        });
    Ok(format!("[{addr}]:{port}").parse::<Authority>()?)
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{base}{}", &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

/// Removes headers that only apply to a single transport hop.
///
/// This includes every header named in a `Connection` header.
pub fn filter_hop_by_hop_headers(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::try_from(name.trim()).ok())
        .collect();
    for name in listed.iter().chain(HOP_BY_HOP_HEADERS.iter()) {
        headers.remove(name);
    }
}

/// Reverse proxy to one application inside one agent.
///
/// Cloning is cheap. Mount it on a hyper server directly, it implements
/// [`hyper::service::Service`], or call [`ReverseProxy::serve`].
#[derive(Clone, derive_more::Debug)]
pub struct ReverseProxy {
    inner: Arc<ProxyInner>,
}

#[derive(derive_more::Debug)]
struct ProxyInner {
    destination: Uri,
    dashboard_url: Uri,
    agent_id: AgentId,
    addr: Ipv6Addr,
    app: AppContext,
    #[debug(skip)]
    signed_token: Option<HeaderValue>,
    #[debug(skip)]
    client: AgentClient,
    #[debug(skip)]
    responder: Option<Arc<DynErrorResponder<'static>>>,
}

impl ReverseProxy {
    pub(crate) fn new(
        destination: Uri,
        dashboard_url: Uri,
        agent_id: AgentId,
        app: AppContext,
        signed_token: &str,
        client: AgentClient,
        responder: Option<Arc<DynErrorResponder<'static>>>,
    ) -> Result<Self> {
        let scheme = destination.scheme();
        ensure_any!(
            scheme == Some(&Scheme::HTTP) || scheme == Some(&Scheme::HTTPS),
            "destination {destination} must be an http or https URI"
        );
        let signed_token = match signed_token {
            "" => None,
            token => Some(HeaderValue::from_str(token).std_context("invalid signed token")?),
        };
        Ok(Self {
            inner: Arc::new(ProxyInner {
                addr: TAILNET_SERVICE_PREFIX.addr_from_agent_id(agent_id),
                destination,
                dashboard_url,
                agent_id,
                app,
                signed_token,
                client,
                responder,
            }),
        })
    }

    pub fn agent_id(&self) -> AgentId {
        self.inner.agent_id
    }

    pub fn destination(&self) -> &Uri {
        &self.inner.destination
    }

    /// Points `req` at the agent.
    ///
    /// Sets the URI per [`rewrite_uri`] and the `Host` header to the agent's
    /// authority. Applying it to an already directed request changes nothing, and
    /// the proxy itself is never modified.
    pub fn director<B>(&self, req: &mut Request<B>) -> Result<(), http::Error> {
        let uri = rewrite_uri(&self.inner.destination, req.uri(), self.inner.addr)?;
        if let Some(authority) = uri.authority() {
            req.headers_mut()
                .insert(header::HOST, HeaderValue::from_str(authority.as_str())?);
        }
        *req.uri_mut() = uri;
        Ok(())
    }

    /// Forwards `req` to the agent and returns its response.
    ///
    /// Failures are turned into an error response; this never fails.
    pub async fn serve<B>(&self, mut req: Request<B>) -> Response<ProxyBody>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let method = req.method().clone();
        let request_uri = req.uri().clone();
        if let Err(err) = self.director(&mut req) {
            warn!(agent_id=%self.inner.agent_id.fmt_short(), uri=%request_uri, "failed to rewrite request: {err:#}");
            return self
                .error_response(StatusCode::BAD_GATEWAY, &err.to_string())
                .await;
        }
        let (mut parts, body) = req.into_parts();
        filter_hop_by_hop_headers(&mut parts.headers);
        parts.headers.remove(&SIGNED_TOKEN_HEADER);
        if let Some(token) = &self.inner.signed_token {
            parts.headers.insert(SIGNED_TOKEN_HEADER, token.clone());
        }
        parts.version = Version::HTTP_11;
        let body = body.map_err(io::Error::other).boxed_unsync();
        let req = Request::from_parts(parts, body);

        match self.inner.client.request(req).await {
            Ok(res) => {
                debug!(agent_id=%self.inner.agent_id.fmt_short(), %method, uri=%request_uri, status=%res.status(), "proxied request");
                let (mut parts, body) = res.into_parts();
                filter_hop_by_hop_headers(&mut parts.headers);
                Response::from_parts(parts, body.map_err(io::Error::other).boxed_unsync())
            }
            Err(err) => {
                let status = find_connect_error(&err)
                    .map(ConnectError::response_status)
                    .unwrap_or(StatusCode::BAD_GATEWAY);
                let message = error_chain(&err);
                warn!(agent_id=%self.inner.agent_id.fmt_short(), %method, uri=%request_uri, %status, "proxy request failed: {message}");
                self.error_response(status, &message).await
            }
        }
    }

    async fn error_response(&self, status: StatusCode, message: &str) -> Response<ProxyBody> {
        let responder: &DynErrorResponder = match self.inner.responder.as_ref() {
            Some(responder) => responder.as_ref(),
            None => DynErrorResponder::from_ref(&OfflinePage),
        };
        let ctx = ProxyErrorContext {
            status,
            agent_id: self.inner.agent_id,
            app: &self.inner.app,
            dashboard_url: &self.inner.dashboard_url,
            message,
        };
        responder.error_response(&ctx).await
    }
}

impl hyper::service::Service<Request<Incoming>> for ReverseProxy {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.serve(req).await) })
    }
}

fn find_connect_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a ConnectError> {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(err) = err.downcast_ref::<ConnectError>() {
            return Some(err);
        }
        current = err.source();
    }
    None
}

fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut current = err.source();
    while let Some(err) = current {
        let _ = write!(message, ": {err}");
        current = err.source();
    }
    message
}

fn full_body(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(infallible_to_io)
        .boxed_unsync()
}

fn infallible_to_io(err: Infallible) -> io::Error {
    match err {}
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use n0_error::{StdResultExt, e};
    use n0_tracing_test::traced_test;
    use tower_service::Service as _;

    use super::*;
    use crate::{
        DynCoordinator, InMemoryCoordinator,
        cache::{ConnectionCache, PoolOpts},
        metrics::ServerMetrics,
        overlay::{BindOverlay, OverlayConfig, memory::MemoryNet},
    };

    fn addr() -> Ipv6Addr {
        Ipv6Addr::from_str("fd7a:115c:a1e0:4c2b:8d1e:77aa:1234:5678").unwrap()
    }

    fn rewrite(destination: &str, request: &str) -> String {
        let destination = Uri::from_str(destination).unwrap();
        let request = Uri::from_str(request).unwrap();
        rewrite_uri(&destination, &request, addr()).unwrap().to_string()
    }

    #[test]
    fn rewrite_targets_virtual_address() {
        assert_eq!(
            rewrite("http://127.0.0.1:4444", "/api/v2?x=1"),
            "http://[fd7a:115c:a1e0:4c2b:8d1e:77aa:1234:5678]:4444/api/v2?x=1"
        );
        assert_eq!(
            rewrite("https://localhost", "/"),
            "https://[fd7a:115c:a1e0:4c2b:8d1e:77aa:1234:5678]:443/"
        );
        assert_eq!(
            rewrite("http://localhost", "/index.html"),
            "http://[fd7a:115c:a1e0:4c2b:8d1e:77aa:1234:5678]:80/index.html"
        );
    }

    #[test]
    fn rewrite_joins_paths_and_queries() {
        let host = "[fd7a:115c:a1e0:4c2b:8d1e:77aa:1234:5678]:8080";
        assert_eq!(
            rewrite("http://app:8080/base", "/x"),
            format!("http://{host}/base/x")
        );
        assert_eq!(
            rewrite("http://app:8080/base/", "/x/"),
            format!("http://{host}/base/x/")
        );
        assert_eq!(
            rewrite("http://app:8080/base?a=1", "/x?b=2"),
            format!("http://{host}/base/x?a=1&b=2")
        );
        assert_eq!(
            rewrite("http://app:8080/base?a=1", "/x"),
            format!("http://{host}/base/x?a=1")
        );
    }

    #[test]
    fn rewrite_is_idempotent() {
        let host = "[fd7a:115c:a1e0:4c2b:8d1e:77aa:1234:5678]:8080";
        let once = rewrite("http://app:8080/base?a=1", "/x?b=2");
        assert_eq!(once, format!("http://{host}/base/x?a=1&b=2"));
        assert_eq!(rewrite("http://app:8080/base?a=1", &once), once);

        // Another port on the same address is still rewritten.
        let other = format!("http://[{}]:9090/x", addr());
        assert_eq!(
            rewrite("http://app:8080/base", &other),
            format!("http://{host}/base/x")
        );
    }

    #[test]
    fn join_paths_uses_single_slash() {
        assert_eq!(join_paths("/a/", "/b"), "/a/b");
        assert_eq!(join_paths("/a", "b"), "/a/b");
        assert_eq!(join_paths("/a", "/b"), "/a/b");
        assert_eq!(join_paths("/", "/"), "/");
    }

    #[test]
    fn filters_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-drop-me"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-drop-me", HeaderValue::from_static("1"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
        headers.insert(header::COOKIE, HeaderValue::from_static("a=b"));

        filter_hop_by_hop_headers(&mut headers);
        assert_eq!(headers.len(), 2);
        assert!(headers.contains_key(header::ACCEPT));
        assert!(headers.contains_key(header::COOKIE));
    }

    #[tokio::test]
    async fn offline_page_escapes_context() -> n0_error::Result {
        let app = AppContext {
            name: "<script>".to_string(),
            owner: "alice".to_string(),
        };
        let dashboard_url = Uri::from_static("https://dashboard.example.com/@alice/dev");
        let ctx = ProxyErrorContext {
            status: StatusCode::BAD_GATEWAY,
            agent_id: AgentId::new_random(),
            app: &app,
            dashboard_url: &dashboard_url,
            message: "agent is not reachable",
        };
        let res = OfflinePage.error_response(&ctx).await;
        assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
        let body = res.into_body().collect().await?.to_bytes();
        let body = std::str::from_utf8(&body).anyerr()?;
        assert!(body.contains("&lt;script&gt;"));
        assert!(!body.contains("<script>"));
        assert!(body.contains("alice"));
        assert!(body.contains("href=\"https://dashboard.example.com/@alice/dev\""));
        assert!(body.contains("agent is not reachable"));
        Ok(())
    }

    #[test]
    fn finds_connect_error_in_chain() {
        let err: Box<dyn StdError + Send + Sync> = Box::new(e!(ConnectError::Closed));
        let wrapped = io::Error::other(err);
        let found = find_connect_error(&wrapped).unwrap();
        assert_eq!(found.response_status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(find_connect_error(&io::Error::other("nope")).is_none());
    }

    #[tokio::test]
    #[traced_test]
    async fn connector_refuses_foreign_hosts() -> n0_error::Result {
        let net = MemoryNet::new();
        let overlay = net.binder().bind(OverlayConfig::default()).await?;
        let metrics = ServerMetrics::new()?;
        let cache = ConnectionCache::new(
            overlay,
            DynCoordinator::new_arc(InMemoryCoordinator::new()),
            PoolOpts::default(),
            metrics.clone(),
        );
        let agent_id = AgentId::new_random();
        let mut connector = AgentConnector::new(
            cache.clone(),
            agent_id,
            TAILNET_SERVICE_PREFIX.addr_from_agent_id(agent_id),
            insecure_client_config()?,
            metrics,
        );
        let other = TAILNET_SERVICE_PREFIX.addr_from_agent_id(AgentId::new_random());
        let uri = Uri::try_from(format!("http://[{other}]:4444/")).anyerr()?;
        let Err(err) = connector.call(uri).await else {
            panic!("connected to a foreign address");
        };
        assert!(matches!(err, ConnectError::Misdirected { .. }));
        assert_eq!(err.response_status(), StatusCode::MISDIRECTED_REQUEST);
        assert!(cache.is_empty());
        Ok(())
    }
}
