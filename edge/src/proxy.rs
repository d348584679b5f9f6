//! The request path: Host → route → health gate → reverse proxy.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::Router;
use http::header::{HOST, LOCATION};
use http::{HeaderValue, Request, StatusCode, Uri};
use hyper::Body;
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::routes::{normalize_host, Backend, RouteTable};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

pub fn router(routes: Arc<RouteTable>) -> Router {
    Router::new().fallback(handle).with_state(routes)
}

fn plain_response(status: StatusCode, message: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header("content-type", "text/plain; charset=utf-8")
        .body(Body::from(message))
        .expect("static response must build")
}

/// Requested hostname: the Host header for HTTP/1, the :authority (carried in
/// the uri) for HTTP/2.
fn requested_host(request: &Request<Body>) -> Option<String> {
    if let Some(host) = request.headers().get(HOST).and_then(|h| h.to_str().ok()) {
        return Some(normalize_host(host));
    }
    request.uri().host().map(normalize_host)
}

/// TCP-level liveness gate in front of every proxied request.
async fn backend_alive(backend: Backend) -> bool {
    tokio::time::timeout(
        HEALTH_CHECK_TIMEOUT,
        TcpStream::connect((backend.ip, backend.port)),
    )
    .await
    .map(|connect| connect.is_ok())
    .unwrap_or(false)
}

async fn handle(
    State(routes): State<Arc<RouteTable>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    mut request: Request<Body>,
) -> Response<Body> {
    let Some(host) = requested_host(&request) else {
        return plain_response(StatusCode::BAD_REQUEST, "Missing Host");
    };

    let Some(backend) = routes.lookup(&host).await else {
        debug!(host, "no route");
        return plain_response(StatusCode::NOT_FOUND, "Service Not Found");
    };

    if !backend_alive(backend).await {
        warn!(host, ip = %backend.ip, port = backend.port, "backend did not answer the probe");
        return plain_response(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable");
    }

    forwarding_headers(&mut request, peer.ip());

    let target = format!("http://{}:{}", backend.ip, backend.port);
    match hyper_reverse_proxy::call(peer.ip(), &target, request).await {
        Ok(response) => response,
        Err(error) => {
            warn!(host, ?error, "upstream request failed");
            plain_response(StatusCode::BAD_GATEWAY, "Bad Gateway")
        }
    }
}

/// The proxy keeps the original Host and adds the standard forwarding
/// headers; X-Forwarded-For is appended by the proxy layer itself.
fn forwarding_headers(request: &mut Request<Body>, client_ip: IpAddr) {
    let headers = request.headers_mut();
    headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
    if let Ok(value) = HeaderValue::from_str(&client_ip.to_string()) {
        headers.insert("x-real-ip", value);
    }
}

/// Everything arriving on port 80 is redirected to the same URI on HTTPS.
/// TLS-ALPN-01 challenges never touch this port; they ride the TLS handshake
/// on 443.
pub fn redirect_router() -> Router {
    Router::new().fallback(redirect)
}

async fn redirect(request: Request<Body>) -> Response<Body> {
    let Some(host) = requested_host(&request) else {
        return plain_response(StatusCode::BAD_REQUEST, "Missing Host");
    };

    let location = https_location(&host, request.uri());
    match HeaderValue::from_str(&location) {
        Ok(location) => Response::builder()
            .status(StatusCode::MOVED_PERMANENTLY)
            .header(LOCATION, location)
            .body(Body::empty())
            .expect("redirect response must build"),
        Err(_) => plain_response(StatusCode::BAD_REQUEST, "Bad Request"),
    }
}

fn https_location(host: &str, uri: &Uri) -> String {
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("https://{host}{path_and_query}")
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn host_comes_from_the_header() {
        let request = Request::builder()
            .uri("/some/path")
            .header(HOST, "App.Example.com:443")
            .body(Body::empty())
            .unwrap();

        assert_eq!(requested_host(&request).as_deref(), Some("app.example.com"));
    }

    #[test]
    fn host_falls_back_to_the_authority() {
        let request = Request::builder()
            .uri("https://app.example.com/x")
            .body(Body::empty())
            .unwrap();

        assert_eq!(requested_host(&request).as_deref(), Some("app.example.com"));
    }

    #[test]
    fn redirects_preserve_path_and_query() {
        let uri: Uri = "/a/b?x=1".parse().unwrap();
        assert_eq!(
            https_location("app.example.com", &uri),
            "https://app.example.com/a/b?x=1"
        );

        let bare: Uri = "/".parse().unwrap();
        assert_eq!(
            https_location("app.example.com", &bare),
            "https://app.example.com/"
        );
    }

    #[test]
    fn forwarding_headers_are_set() {
        let mut request = Request::builder().body(Body::empty()).unwrap();
        forwarding_headers(&mut request, "203.0.113.9".parse().unwrap());

        assert_eq!(
            request.headers().get("x-forwarded-proto").unwrap(),
            "https"
        );
        assert_eq!(request.headers().get("x-real-ip").unwrap(), "203.0.113.9");
    }
}
