//! Task Store client.
//!
//! [`TaskStore`] is what the foreman needs from the server; [`HttpTaskStore`]
//! speaks the HTTP API over one hyper http1 connection per request.

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE, HOST, USER_AGENT};
use http::{Method, Request, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use sandgrid_core::{DequeueRequest, DequeueResponse, Task, TaskResult, Uploaded};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::BoxFuture;
use crate::error::{ForemanError, ForemanResult};

/// Task Store operations used by the foreman, injected for testability.
pub trait TaskStore: Send + Sync + 'static {
    /// Ask for tasks fitting `request`; the server marks them assigned.
    fn dequeue<'a>(&'a self, request: &'a DequeueRequest) -> BoxFuture<'a, ForemanResult<Vec<Task>>>;

    fn get_blob<'a>(&'a self, reference: &'a str) -> BoxFuture<'a, ForemanResult<Bytes>>;

    /// Upload bytes; returns their reference.
    fn put_blob(&self, bytes: Bytes) -> BoxFuture<'_, ForemanResult<String>>;

    fn put_result<'a>(&'a self, id: &'a str, result: &'a TaskResult) -> BoxFuture<'a, ForemanResult<()>>;
}

/// HTTP client for the Task Store API.
#[derive(Debug, Clone)]
pub struct HttpTaskStore {
    /// `host:port` to connect to.
    address: String,
    /// Value of the `Host` header.
    host: String,
    /// Path prefix of the API, without trailing slash.
    prefix: String,
    token: Option<String>,
}

impl HttpTaskStore {
    pub fn new(server: &str, token: Option<String>) -> ForemanResult<Self> {
        let uri: Uri = server
            .parse()
            .map_err(|e| ForemanError::Http(format!("invalid server url {server:?}: {e}")))?;
        if uri.scheme_str().is_some_and(|scheme| scheme != "http") {
            return Err(ForemanError::Http(format!(
                "unsupported scheme in {server:?}, expected http://"
            )));
        }
        let authority = uri
            .authority()
            .ok_or_else(|| ForemanError::Http(format!("server url {server:?} has no host")))?;
        let address = match authority.port_u16() {
            Some(_) => authority.to_string(),
            None => format!("{}:80", authority.host()),
        };
        Ok(Self {
            address,
            host: authority.to_string(),
            prefix: uri.path().trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        content_type: &str,
        body: Bytes,
    ) -> ForemanResult<(StatusCode, Bytes)> {
        let uri = format!("{}{path}", self.prefix);
        let stream = tokio::net::TcpStream::connect(&self.address)
            .await
            .map_err(|e| ForemanError::Http(format!("connect {}: {e}", self.address)))?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ForemanError::Http(format!("handshake with {}: {e}", self.address)))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = Request::builder()
            .method(method.clone())
            .uri(&uri)
            .header(HOST, &self.host)
            .header(USER_AGENT, "sandgrid-foreman/0.1")
            .header(CONTENT_TYPE, content_type);
        if let Some(token) = &self.token {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|e| ForemanError::Http(e.to_string()))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| ForemanError::Http(format!("{method} {uri}: {e}")))?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|e| ForemanError::Http(format!("{method} {uri}: {e}")))?
            .to_bytes();
        debug!(%method, %uri, %status, "task store call");
        Ok((status, bytes))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        content_type: &str,
        body: Bytes,
    ) -> ForemanResult<T> {
        let (status, bytes) = self.send(method, path, content_type, body).await?;
        if !status.is_success() {
            return Err(refusal(status, &bytes));
        }
        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn refusal(status: StatusCode, body: &[u8]) -> ForemanError {
    let message = serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| String::from_utf8_lossy(body).into_owned());
    ForemanError::Refused {
        status: status.as_u16(),
        message,
    }
}

const JSON: &str = "application/json";
const OCTET_STREAM: &str = "application/octet-stream";

impl TaskStore for HttpTaskStore {
    fn dequeue<'a>(&'a self, request: &'a DequeueRequest) -> BoxFuture<'a, ForemanResult<Vec<Task>>> {
        Box::pin(async move {
            let body = Bytes::from(serde_json::to_vec(request)?);
            let response: DequeueResponse =
                self.call(Method::POST, "/queue/dequeue/", JSON, body).await?;
            Ok(response
                .tasks
                .into_iter()
                .map(|mut task| {
                    task.limits.normalize();
                    task
                })
                .collect())
        })
    }

    fn get_blob<'a>(&'a self, reference: &'a str) -> BoxFuture<'a, ForemanResult<Bytes>> {
        Box::pin(async move {
            let path = format!("/blob/{reference}/");
            let (status, bytes) = self.send(Method::GET, &path, OCTET_STREAM, Bytes::new()).await?;
            if !status.is_success() {
                return Err(refusal(status, &bytes));
            }
            Ok(bytes)
        })
    }

    fn put_blob(&self, bytes: Bytes) -> BoxFuture<'_, ForemanResult<String>> {
        Box::pin(async move {
            let uploaded: Uploaded = self.call(Method::POST, "/blob/", OCTET_STREAM, bytes).await?;
            Ok(uploaded.reference)
        })
    }

    fn put_result<'a>(&'a self, id: &'a str, result: &'a TaskResult) -> BoxFuture<'a, ForemanResult<()>> {
        Box::pin(async move {
            let body = Bytes::from(serde_json::to_vec(result)?);
            let path = format!("/result/{id}/");
            let _: serde_json::Value = self.call(Method::POST, &path, JSON, body).await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_url_parsing() {
        let store = HttpTaskStore::new("http://queue.local:8080/api/", None).unwrap();
        assert_eq!(store.address, "queue.local:8080");
        assert_eq!(store.host, "queue.local:8080");
        assert_eq!(store.prefix, "/api");

        let store = HttpTaskStore::new("http://queue.local", None).unwrap();
        assert_eq!(store.address, "queue.local:80");
        assert_eq!(store.prefix, "");

        assert!(HttpTaskStore::new("https://queue.local", None).is_err());
        assert!(HttpTaskStore::new("/just/a/path", None).is_err());
    }

    #[test]
    fn refusal_extracts_error_message() {
        let err = refusal(StatusCode::FORBIDDEN, br#"{"status":"FAIL","error":"nope"}"#);
        match err {
            ForemanError::Refused { status, message } => {
                assert_eq!(status, 403);
                assert_eq!(message, "nope");
            }
            other => panic!("unexpected {other:?}"),
        }
        let err = refusal(StatusCode::BAD_GATEWAY, b"upstream down");
        assert!(err.to_string().contains("upstream down"));
    }
}
