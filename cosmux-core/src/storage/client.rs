//! Signed HTTP transport for COS
//!
//! Pure-Rust async transport using reqwest. Every request carries `Host`,
//! `Content-Length` (when there is a body) and a signed `Authorization`
//! header.

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, HOST};
use reqwest::{Body, Client, Method, Response, StatusCode, Url};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::signer::{sign_encode, HmacSha1Signer, Signer};
use crate::config::ClientConfig;
use crate::error::{Result, TransferError};

/// Longest error body kept in [`TransferError::Http`]
const ERROR_BODY_LIMIT: usize = 4096;

/// Request payload
pub enum RequestBody {
    Empty,
    Bytes(Bytes),
    /// Streaming body of a known length
    Stream { body: Body, len: u64 },
}

impl RequestBody {
    /// Declared body length in bytes
    pub fn len(&self) -> u64 {
        match self {
            RequestBody::Empty => 0,
            RequestBody::Bytes(b) => b.len() as u64,
            RequestBody::Stream { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Low-level COS transport shared by every operation of a client
pub struct CosClient {
    http: Client,
    host: String,
    scheme: &'static str,
    signer: Arc<dyn Signer>,
    auth_expiration: Duration,
}

impl CosClient {
    /// Create a transport with a default reqwest client
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs));
        if config.request_timeout_secs > 0 {
            builder = builder.timeout(Duration::from_secs(config.request_timeout_secs));
        }
        let http = builder.build().map_err(|e| TransferError::Transport {
            message: format!("Failed to create HTTP client: {}", e),
        })?;

        Ok(Self::with_http_client(config, http))
    }

    /// Create a transport around a caller-supplied reqwest client
    pub fn with_http_client(config: &ClientConfig, http: Client) -> Self {
        Self {
            http,
            host: config.host.clone(),
            scheme: config.scheme(),
            signer: Arc::new(HmacSha1Signer::new(
                config.secret_id.clone(),
                config.secret_key.clone(),
            )),
            auth_expiration: config.transfer.auth_expiration,
        }
    }

    /// Replace the request signer
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = signer;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn scheme(&self) -> &'static str {
        self.scheme
    }

    pub fn signer(&self) -> &dyn Signer {
        self.signer.as_ref()
    }

    /// Build URL for an object (an empty id addresses the bucket)
    pub fn object_url(&self, file_id: &str, query: &[(String, String)]) -> Result<Url> {
        let mut url = Url::parse(&format!("{}://{}/", self.scheme, self.host)).map_err(|e| {
            TransferError::InvalidArgument {
                reason: format!("invalid host {}: {}", self.host, e),
            }
        })?;
        url.set_path(file_id);
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in query {
                pairs.append_pair(k, v);
            }
        }
        Ok(url)
    }

    /// Build a signed request
    pub fn build_request(
        &self,
        method: Method,
        file_id: &str,
        query: &[(String, String)],
        mut headers: HeaderMap,
        body: RequestBody,
    ) -> Result<reqwest::Request> {
        let url = self.object_url(file_id, query)?;

        headers.insert(HOST, header_value(&self.host)?);
        let content_length = body.len();
        if content_length > 0 {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(content_length));
        }
        let authorization =
            self.signer
                .sign(file_id, &method, query, &headers, self.auth_expiration);
        headers.insert(AUTHORIZATION, header_value(&authorization)?);

        let mut builder = self.http.request(method, url).headers(headers);
        builder = match body {
            RequestBody::Empty => builder,
            RequestBody::Bytes(bytes) => builder.body(bytes),
            RequestBody::Stream { body, .. } => builder.body(body),
        };
        builder.build().map_err(TransferError::from)
    }

    /// Send a request, racing it against `cancel`
    ///
    /// 404 becomes [`TransferError::NotFound`]; other non-2xx statuses become
    /// [`TransferError::Http`] carrying the response body.
    pub async fn send(&self, cancel: &CancellationToken, request: reqwest::Request) -> Result<Response> {
        let method = request.method().clone();
        let path = request.url().path().to_string();

        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            resp = self.http.execute(request) => resp?,
        };

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        if status == StatusCode::NOT_FOUND {
            drain(resp).await;
            return Err(TransferError::NotFound {
                key: path.trim_start_matches('/').to_string(),
            });
        }

        let body = match resp.bytes().await {
            Ok(b) => String::from_utf8_lossy(&b[..b.len().min(ERROR_BODY_LIMIT)]).into_owned(),
            Err(e) => format!("<unreadable body: {}>", e),
        };
        debug!("{} {} failed with status {}", method, path, status);
        Err(TransferError::Http {
            status: status.as_u16(),
            method: method.to_string(),
            path,
            body,
        })
    }

    /// Build, sign and send in one step
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        method: Method,
        file_id: &str,
        query: &[(String, String)],
        headers: HeaderMap,
        body: RequestBody,
    ) -> Result<Response> {
        let request = self.build_request(method, file_id, query, headers, body)?;
        self.send(cancel, request).await
    }

    /// Send a request whose response body is not needed
    pub async fn execute_and_drain(
        &self,
        cancel: &CancellationToken,
        method: Method,
        file_id: &str,
        query: &[(String, String)],
        headers: HeaderMap,
        body: RequestBody,
    ) -> Result<HeaderMap> {
        let resp = self
            .execute(cancel, method, file_id, query, headers, body)
            .await?;
        let headers = resp.headers().clone();
        drain(resp).await;
        Ok(headers)
    }

    /// Read a whole response body, observing cancellation
    pub async fn read_body(&self, cancel: &CancellationToken, resp: Response) -> Result<Bytes> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TransferError::Cancelled),
            body = resp.bytes() => body.map_err(TransferError::from),
        }
    }

    /// HEAD an object and return its response headers
    pub async fn head(&self, cancel: &CancellationToken, file_id: &str) -> Result<HeaderMap> {
        self.execute_and_drain(
            cancel,
            Method::HEAD,
            file_id,
            &[],
            HeaderMap::new(),
            RequestBody::Empty,
        )
        .await
    }

    /// Object size from a HEAD probe
    pub async fn file_size(&self, cancel: &CancellationToken, file_id: &str) -> Result<u64> {
        let headers = self.head(cancel, file_id).await?;
        object_size(&headers)
    }

    /// Presigned GET URL valid for `expiration`
    pub fn download_url(&self, file_id: &str, expiration: Duration) -> String {
        let sign = self
            .signer
            .sign(file_id, &Method::GET, &[], &HeaderMap::new(), expiration);
        format!(
            "{}://{}/{}?sign={}",
            self.scheme,
            self.host,
            file_id,
            sign_encode(&sign)
        )
    }
}

/// Read and discard the rest of a response so the connection can be reused
pub async fn drain(resp: Response) {
    if let Err(e) = resp.bytes().await {
        warn!("Failed to drain response body: {}", e);
    }
}

/// Parse `Content-Length` from response headers
pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Object size from HEAD headers; a missing length is an error, not an empty object
pub fn object_size(headers: &HeaderMap) -> Result<u64> {
    content_length(headers).ok_or_else(|| TransferError::Transport {
        message: "HEAD response without Content-Length".to_string(),
    })
}

/// Header value by name as a string, empty if missing or not ASCII
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    HeaderName::from_bytes(name.as_bytes())
        .ok()
        .and_then(|n| headers.get(n))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| TransferError::InvalidArgument {
        reason: format!("invalid header value {:?}: {}", value, e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> CosClient {
        let config = ClientConfig {
            host: "bucket.example.com".into(),
            secret_id: "id".into(),
            secret_key: "key".into(),
            ..Default::default()
        };
        CosClient::new(&config).unwrap()
    }

    #[test]
    fn test_object_url() {
        let c = client();
        let url = c
            .object_url(
                "dir/a b.bin",
                &[("partNumber".into(), "1".into()), ("uploadId".into(), "x".into())],
            )
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://bucket.example.com/dir/a%20b.bin?partNumber=1&uploadId=x"
        );

        let bucket = c.object_url("", &[]).unwrap();
        assert_eq!(bucket.as_str(), "http://bucket.example.com/");
    }

    #[test]
    fn test_request_headers_signed() {
        let c = client();
        let req = c
            .build_request(
                Method::PUT,
                "a",
                &[],
                HeaderMap::new(),
                RequestBody::Bytes(Bytes::from_static(b"hello")),
            )
            .unwrap();
        assert_eq!(req.headers()[HOST], "bucket.example.com");
        assert_eq!(req.headers()[CONTENT_LENGTH], "5");
        let auth = req.headers()[AUTHORIZATION].to_str().unwrap();
        assert!(auth.contains("q-header-list=content-length;host"));
    }

    #[test]
    fn test_download_url() {
        let url = client().download_url("a/b", Duration::from_secs(60));
        assert!(url.starts_with("http://bucket.example.com/a/b?sign=q-sign-algorithm%3Dsha1"));
    }

    #[test]
    fn test_content_length() {
        let mut headers = HeaderMap::new();
        assert_eq!(content_length(&headers), None);
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        assert_eq!(content_length(&headers), Some(42));
    }

    #[test]
    fn test_object_size_requires_content_length() {
        let mut headers = HeaderMap::new();
        let err = object_size(&headers).unwrap_err();
        assert!(matches!(err, TransferError::Transport { .. }), "{err}");

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("not-a-number"));
        assert!(object_size(&headers).is_err());

        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        assert_eq!(object_size(&headers).unwrap(), 0);
    }
}
