//! The HTTP seam between virtual users and the target.
use crate::run::RunError;
use std::time::Duration;
use surge_core::{Method, RequestStep, TransportErrorKind};
#[allow(unused_imports)]
use tracing::{debug, error, trace};
use url::Url;

/// Issues one request step and reports the response status.
///
/// Implementations must wait for the full response before returning so the caller's timing
/// covers the whole exchange.
#[trait_variant::make(HttpClient: Send)]
pub trait LocalHttpClient {
    async fn execute(&self, request: &RequestStep) -> Result<u16, TransportErrorKind>;
}

/// [`HttpClient`] backed by a shared `reqwest` connection pool.
#[derive(Clone, Debug)]
pub struct ReqwestClient {
    client: reqwest::Client,
    base: String,
}

impl ReqwestClient {
    pub fn new(base: &Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base: base.as_str().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

impl HttpClient for ReqwestClient {
    async fn execute(&self, request: &RequestStep) -> Result<u16, TransportErrorKind> {
        let mut builder = self
            .client
            .request(reqwest_method(request.method), self.url(&request.path));
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(classify_error)?;
        let status = response.status().as_u16();
        // Drain the body so the connection returns to the pool and latency includes transfer.
        response.bytes().await.map_err(classify_error)?;

        Ok(status)
    }
}

fn reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
        Method::Head => reqwest::Method::HEAD,
    }
}

fn classify_error(err: reqwest::Error) -> TransportErrorKind {
    trace!("Transport error: {err}");
    if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_connect() {
        TransportErrorKind::Connect
    } else {
        TransportErrorKind::Other
    }
}

/// Make sure the target host resolves before any traffic is generated.
pub async fn resolve(base: &Url) -> Result<(), RunError> {
    let host = base.host_str().unwrap_or_default().to_string();
    let port = base.port_or_known_default().unwrap_or(80);

    let first = tokio::net::lookup_host((host.as_str(), port))
        .await
        .map_err(|source| RunError::Resolve {
            host: host.clone(),
            source,
        })?
        .next();

    match first {
        Some(addr) => {
            debug!("Target {host} resolved to {addr}");
            Ok(())
        }
        None => {
            error!("Target {host} resolved to no addresses");
            Err(RunError::NoAddress(host))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_paths_onto_base() {
        let base = Url::parse("http://localhost:3000").unwrap();
        let client = ReqwestClient::new(&base, Duration::from_secs(1)).unwrap();
        assert_eq!(client.url("/products"), "http://localhost:3000/products");

        let base = Url::parse("http://localhost:3000/api/").unwrap();
        let client = ReqwestClient::new(&base, Duration::from_secs(1)).unwrap();
        assert_eq!(client.url("/products"), "http://localhost:3000/api/products");
    }

    #[tokio::test]
    async fn resolves_localhost() {
        let base = Url::parse("http://localhost:3000").unwrap();
        assert!(resolve(&base).await.is_ok());
    }

    #[tokio::test]
    async fn unresolvable_host_is_an_error() {
        let base = Url::parse("http://surge-no-such-host.invalid").unwrap();
        assert!(matches!(
            resolve(&base).await,
            Err(RunError::Resolve { .. } | RunError::NoAddress(_))
        ));
    }

    #[tokio::test]
    async fn refused_connection_is_a_connect_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let base = Url::parse(&format!("http://127.0.0.1:{port}")).unwrap();
        let client = ReqwestClient::new(&base, Duration::from_secs(2)).unwrap();
        let res = HttpClient::execute(&client, &RequestStep::get("browse", "/products")).await;
        assert_eq!(res, Err(TransportErrorKind::Connect));
    }
}
