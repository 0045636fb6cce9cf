//! In-process mock COS endpoint for integration tests
//!
//! Implements just enough of the object and multipart API to exercise the
//! client: HEAD, (ranged) GET, PUT, multipart init/part/list/complete/abort,
//! DELETE, batch delete and bucket listing. Part listings are paginated two
//! entries per page. Faults and delays can be injected per test.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use cosmux_core::{Client, ClientConfig, TransferConfig};
use parking_lot::Mutex;
use percent_encoding::percent_decode_str;
use serde::Deserialize;

pub const MIB: u64 = 1024 * 1024;

/// Faults applied to subsequent requests
#[derive(Debug, Default)]
pub struct Faults {
    /// PUT of this part number answers 500
    pub fail_part: Option<u32>,
    /// Ranged GET starting at this offset returns one byte short
    pub short_range_at: Option<u64>,
    /// Ranged GET starting at this offset returns one byte extra
    pub long_range_at: Option<u64>,
    /// Completion answers 500
    pub fail_complete: bool,
    /// Delay before answering part PUTs and ranged GETs
    pub part_delay: Duration,
}

#[derive(Default)]
struct Upload {
    key: String,
    parts: BTreeMap<u32, Bytes>,
}

#[derive(Default)]
struct Store {
    objects: BTreeMap<String, Bytes>,
    uploads: HashMap<String, Upload>,
    next_upload: u64,
}

/// Mock service state shared with the test body
#[derive(Default)]
pub struct MockCos {
    store: Mutex<Store>,
    pub faults: Mutex<Faults>,
    pub init_calls: AtomicUsize,
    pub part_uploads: AtomicUsize,
    pub list_parts_calls: AtomicUsize,
    pub complete_calls: AtomicUsize,
    pub abort_calls: AtomicUsize,
    pub ranged_gets: AtomicUsize,
    pub plain_gets: AtomicUsize,
    pub single_puts: AtomicUsize,
    /// Part numbers submitted with each successful completion
    pub completed: Mutex<Vec<Vec<u32>>>,
}

impl MockCos {
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.store.lock().objects.get(key).cloned()
    }

    pub fn put_object(&self, key: &str, data: impl Into<Bytes>) {
        self.store.lock().objects.insert(key.to_string(), data.into());
    }

    pub fn open_uploads(&self) -> usize {
        self.store.lock().uploads.len()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Start the mock on a random local port; returns its state and host
pub async fn start() -> (Arc<MockCos>, String) {
    let mock = Arc::new(MockCos::default());
    let app = Router::new()
        .fallback(handle)
        .layer(DefaultBodyLimit::disable())
        .with_state(mock.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (mock, addr.to_string())
}

/// Transfer tuning with the smallest allowed part size
pub fn transfer_config(threshold: u64, concurrency: usize, buffer_in_memory: bool) -> TransferConfig {
    TransferConfig {
        part_size: MIB,
        multipart_threshold: threshold,
        concurrency,
        buffer_in_memory,
        ..Default::default()
    }
}

pub fn client(host: &str, transfer: TransferConfig) -> Client {
    let config = ClientConfig {
        host: host.to_string(),
        secret_id: "AKIDtest".into(),
        secret_key: "secret".into(),
        transfer,
        ..Default::default()
    };
    Client::new(config).unwrap()
}

/// Deterministic test payload
pub fn payload(len: u64) -> Vec<u8> {
    (0..len).map(|i| (i.wrapping_mul(31) % 251) as u8).collect()
}

fn decode(s: &str) -> String {
    percent_decode_str(&s.replace('+', " "))
        .decode_utf8_lossy()
        .into_owned()
}

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    query
        .unwrap_or("")
        .split('&')
        .filter(|kv| !kv.is_empty())
        .map(|kv| {
            let (k, v) = kv.split_once('=').unwrap_or((kv, ""));
            (decode(k), decode(v))
        })
        .collect()
}

fn etag(data: &[u8]) -> String {
    format!("\"{:x}\"", md5::compute(data))
}

fn xml(status: StatusCode, body: String) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, HeaderValue::from_static("application/xml"))],
        body,
    )
        .into_response()
}

fn error(status: StatusCode, code: &str) -> Response {
    xml(
        status,
        format!("<Error><Code>{}</Code><Message>{}</Message></Error>", code, code),
    )
}

async fn handle(
    State(mock): State<Arc<MockCos>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("q-sign-algorithm=sha1&q-ak=AKIDtest&"));
    if !authorized {
        return error(StatusCode::FORBIDDEN, "AccessDenied");
    }

    let key = decode(uri.path().trim_start_matches('/'));
    let query = parse_query(uri.query());

    match method {
        Method::HEAD => head_object(&mock, &key),
        Method::GET if key.is_empty() => list_objects(&mock, &query),
        Method::GET if query.contains_key("uploadId") => list_parts(&mock, &query),
        Method::GET => get_object(&mock, &key, &headers).await,
        Method::PUT if query.contains_key("uploadId") => upload_part(&mock, &query, body).await,
        Method::PUT => {
            mock.single_puts.fetch_add(1, Ordering::SeqCst);
            mock.put_object(&key, body);
            StatusCode::OK.into_response()
        }
        Method::POST if key.is_empty() && query.contains_key("delete") => delete_many(&mock, &body),
        Method::POST if query.contains_key("uploads") => init_upload(&mock, &key),
        Method::POST if query.contains_key("uploadId") => complete_upload(&mock, &query, &body),
        Method::DELETE if query.contains_key("uploadId") => abort_upload(&mock, &query),
        Method::DELETE => {
            mock.store.lock().objects.remove(&key);
            StatusCode::NO_CONTENT.into_response()
        }
        _ => error(StatusCode::METHOD_NOT_ALLOWED, "MethodNotAllowed"),
    }
}

fn head_object(mock: &MockCos, key: &str) -> Response {
    let Some(data) = mock.object(key) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    (
        StatusCode::OK,
        [
            (header::CONTENT_LENGTH, data.len().to_string()),
            (header::ETAG, etag(&data)),
            (header::LAST_MODIFIED, "Mon, 01 Jan 2024 00:00:00 GMT".to_string()),
            (
                header::HeaderName::from_static("x-cos-hash-crc64ecma"),
                "12345".to_string(),
            ),
        ],
        data,
    )
        .into_response()
}

async fn get_object(mock: &MockCos, key: &str, headers: &HeaderMap) -> Response {
    let Some(data) = mock.object(key) else {
        return error(StatusCode::NOT_FOUND, "NoSuchKey");
    };

    let range = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("bytes="))
        .and_then(|v| v.split_once('-'))
        .and_then(|(a, b)| Some((a.parse::<u64>().ok()?, b.parse::<u64>().ok()?)));

    let Some((start, end)) = range else {
        mock.plain_gets.fetch_add(1, Ordering::SeqCst);
        return (StatusCode::OK, data).into_response();
    };

    mock.ranged_gets.fetch_add(1, Ordering::SeqCst);
    let (delay, short, long) = {
        let faults = mock.faults.lock();
        (
            faults.part_delay,
            faults.short_range_at == Some(start),
            faults.long_range_at == Some(start),
        )
    };
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }

    let mut end = (end + 1).min(data.len() as u64) as usize;
    if short {
        end -= 1;
    }
    let mut slice = data.slice(start as usize..end).to_vec();
    if long {
        slice.push(0);
    }
    (StatusCode::PARTIAL_CONTENT, Bytes::from(slice)).into_response()
}

fn init_upload(mock: &MockCos, key: &str) -> Response {
    mock.init_calls.fetch_add(1, Ordering::SeqCst);
    let mut store = mock.store.lock();
    store.next_upload += 1;
    let upload_id = format!("upload-{}", store.next_upload);
    store.uploads.insert(
        upload_id.clone(),
        Upload {
            key: key.to_string(),
            parts: BTreeMap::new(),
        },
    );
    xml(
        StatusCode::OK,
        format!(
            "<InitiateMultipartUploadResult><Bucket>test</Bucket><Key>{}</Key>\
             <UploadId>{}</UploadId></InitiateMultipartUploadResult>",
            key, upload_id
        ),
    )
}

async fn upload_part(mock: &MockCos, query: &HashMap<String, String>, body: Bytes) -> Response {
    let Some(part_number) = query.get("partNumber").and_then(|n| n.parse::<u32>().ok()) else {
        return error(StatusCode::BAD_REQUEST, "InvalidArgument");
    };
    let (delay, fail) = {
        let faults = mock.faults.lock();
        (faults.part_delay, faults.fail_part == Some(part_number))
    };
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    if fail {
        return error(StatusCode::INTERNAL_SERVER_ERROR, "InternalError");
    }

    let tag = etag(&body);
    let mut store = mock.store.lock();
    let Some(upload) = store.uploads.get_mut(&query["uploadId"]) else {
        return error(StatusCode::NOT_FOUND, "NoSuchUpload");
    };
    upload.parts.insert(part_number, body);
    mock.part_uploads.fetch_add(1, Ordering::SeqCst);

    (StatusCode::OK, [(header::ETAG, tag)]).into_response()
}

fn list_parts(mock: &MockCos, query: &HashMap<String, String>) -> Response {
    mock.list_parts_calls.fetch_add(1, Ordering::SeqCst);
    let marker: u32 = query
        .get("part-number-marker")
        .and_then(|m| m.parse().ok())
        .unwrap_or(0);

    let store = mock.store.lock();
    let Some(upload) = store.uploads.get(&query["uploadId"]) else {
        return error(StatusCode::NOT_FOUND, "NoSuchUpload");
    };

    let remaining: Vec<_> = upload.parts.range(marker + 1..).collect();
    let page = &remaining[..remaining.len().min(2)];
    let truncated = remaining.len() > page.len();

    let mut out = format!(
        "<ListPartsResult><Bucket>test</Bucket><Key>{}</Key><UploadId>{}</UploadId>\
         <PartNumberMarker>{}</PartNumberMarker><MaxParts>2</MaxParts>\
         <IsTruncated>{}</IsTruncated>",
        upload.key, query["uploadId"], marker, truncated
    );
    if let Some((last, _)) = page.last() {
        out.push_str(&format!("<NextPartNumberMarker>{}</NextPartNumberMarker>", last));
    }
    for (number, data) in page {
        out.push_str(&format!(
            "<Part><PartNumber>{}</PartNumber><LastModified>2024-01-01T00:00:00.000Z</LastModified>\
             <ETag>{}</ETag><Size>{}</Size></Part>",
            number,
            etag(data).replace('"', "&quot;"),
            data.len()
        ));
    }
    out.push_str("</ListPartsResult>");
    xml(StatusCode::OK, out)
}

#[derive(Deserialize)]
struct CompleteRequest {
    #[serde(rename = "Part", default)]
    parts: Vec<CompletePart>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CompletePart {
    part_number: u32,
    #[serde(rename = "ETag")]
    etag: String,
}

fn complete_upload(mock: &MockCos, query: &HashMap<String, String>, body: &[u8]) -> Response {
    mock.complete_calls.fetch_add(1, Ordering::SeqCst);
    if mock.faults.lock().fail_complete {
        return error(StatusCode::INTERNAL_SERVER_ERROR, "InternalError");
    }

    let Ok(request) = quick_xml::de::from_reader::<_, CompleteRequest>(body) else {
        return error(StatusCode::BAD_REQUEST, "MalformedXML");
    };

    let mut store = mock.store.lock();
    let upload_id = &query["uploadId"];
    let Some(upload) = store.uploads.get(upload_id) else {
        return error(StatusCode::NOT_FOUND, "NoSuchUpload");
    };

    // Dense, ascending from 1, matching exactly what was stored
    let numbers: Vec<u32> = request.parts.iter().map(|p| p.part_number).collect();
    let dense: Vec<u32> = (1..=upload.parts.len() as u32).collect();
    let stored: Vec<u32> = upload.parts.keys().copied().collect();
    if numbers != dense || numbers != stored {
        return error(StatusCode::BAD_REQUEST, "InvalidPartOrder");
    }
    for part in &request.parts {
        if etag(&upload.parts[&part.part_number]) != part.etag {
            return error(StatusCode::BAD_REQUEST, "InvalidPart");
        }
    }

    let mut object = Vec::new();
    for data in upload.parts.values() {
        object.extend_from_slice(data);
    }
    let key = upload.key.clone();
    store.uploads.remove(upload_id);
    store.objects.insert(key.clone(), Bytes::from(object));
    mock.completed.lock().push(numbers);

    xml(
        StatusCode::OK,
        format!(
            "<CompleteMultipartUploadResult><Key>{}</Key></CompleteMultipartUploadResult>",
            key
        ),
    )
}

fn abort_upload(mock: &MockCos, query: &HashMap<String, String>) -> Response {
    mock.abort_calls.fetch_add(1, Ordering::SeqCst);
    match mock.store.lock().uploads.remove(&query["uploadId"]) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => error(StatusCode::NOT_FOUND, "NoSuchUpload"),
    }
}

#[derive(Deserialize)]
struct DeleteRequest {
    #[serde(rename = "Object", default)]
    objects: Vec<DeleteObject>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DeleteObject {
    key: String,
}

/// Keys under `locked/` fail to delete
fn delete_many(mock: &MockCos, body: &[u8]) -> Response {
    let Ok(request) = quick_xml::de::from_reader::<_, DeleteRequest>(body) else {
        return error(StatusCode::BAD_REQUEST, "MalformedXML");
    };

    let mut out = String::from("<DeleteResult>");
    let mut store = mock.store.lock();
    for object in request.objects {
        if object.key.starts_with("locked/") {
            out.push_str(&format!(
                "<Error><Key>{}</Key><Code>AccessDenied</Code><Message>locked</Message></Error>",
                object.key
            ));
        } else {
            store.objects.remove(&object.key);
        }
    }
    out.push_str("</DeleteResult>");
    xml(StatusCode::OK, out)
}

fn list_objects(mock: &MockCos, query: &HashMap<String, String>) -> Response {
    let prefix = query.get("prefix").cloned().unwrap_or_default();
    let marker = query.get("marker").cloned().unwrap_or_default();
    let max_keys: usize = query
        .get("max-keys")
        .and_then(|m| m.parse().ok())
        .unwrap_or(1000);

    let store = mock.store.lock();
    let matching: Vec<(&String, &Bytes)> = store
        .objects
        .iter()
        .filter(|(k, _)| k.starts_with(&prefix) && k.as_str() > marker.as_str())
        .filter(|(k, _)| !k[prefix.len()..].contains('/'))
        .collect();
    let page = &matching[..matching.len().min(max_keys)];
    let truncated = matching.len() > page.len();

    let mut out = format!(
        "<ListBucketResult><Name>test</Name><Prefix>{}</Prefix><Marker>{}</Marker>\
         <MaxKeys>{}</MaxKeys><Delimiter>/</Delimiter><IsTruncated>{}</IsTruncated>",
        prefix, marker, max_keys, truncated
    );
    if truncated {
        if let Some((last, _)) = page.last() {
            out.push_str(&format!("<NextMarker>{}</NextMarker>", last));
        }
    }
    for (key, data) in page {
        out.push_str(&format!(
            "<Contents><Key>{}</Key><LastModified>2024-01-01T00:00:00.000Z</LastModified>\
             <ETag>{}</ETag><Size>{}</Size></Contents>",
            key,
            etag(data).replace('"', "&quot;"),
            data.len()
        ));
    }
    out.push_str("</ListBucketResult>");
    xml(StatusCode::OK, out)
}
