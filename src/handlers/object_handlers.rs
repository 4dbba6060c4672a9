//! HTTP handlers for the upload / info / download API.
//! Streams request and response bodies to avoid buffering payloads in
//! memory and delegates storage concerns to `StorageService`.

use crate::{
    errors::AppError,
    models::preview::ArchiveEntry,
    services::storage_service::{Download, StorageService},
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Query, State, multipart::MultipartRejection},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use std::io;
use tokio_util::io::ReaderStream;
use tracing::debug;

/// Non-standard header carrying the original filename, percent-encoded.
pub const X_FILENAME: HeaderName = HeaderName::from_static("x-filename");

/// RFC 5987 `attr-char` set: everything else is percent-encoded.
const FILENAME_ENCODE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// Query params accepted by `GET /api`.
#[derive(Debug, Deserialize)]
pub struct ObjectQuery {
    pub id: Option<String>,
    /// Present (with any value) to request metadata instead of bytes.
    pub info: Option<String>,
}

/// Success envelope shared by the JSON endpoints.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadData {
    pub id: String,
    pub filename: String,
    pub download_url: String,
    pub expires_at: DateTime<Utc>,
    pub size: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoData {
    pub id: String,
    pub filename: String,
    pub size: u64,
    pub expires_at: DateTime<Utc>,
    pub uploaded_at: DateTime<Utc>,
    pub is_zip: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_contents: Option<Vec<ArchiveEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zip_truncated: Option<bool>,
}

/// `POST /api` — store the first file field of a multipart body.
pub async fn upload_object(
    State(service): State<StorageService>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ApiResponse<UploadData>>, AppError> {
    let mut multipart = multipart.map_err(|rejection| {
        debug!("rejected upload body: {}", rejection);
        AppError::bad_request("expected a multipart/form-data body")
    })?;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        debug!("malformed multipart body: {}", err);
        AppError::bad_request("malformed multipart body")
    })? {
        let Some(filename) = field.file_name().map(str::to_owned) else {
            continue;
        };

        let stream = field.map_err(io::Error::other);
        let record = service.upload(&filename, stream).await?;

        return Ok(Json(ApiResponse::ok(UploadData {
            download_url: service.download_url(&record.id),
            id: record.id,
            filename: record.filename,
            expires_at: record.expires_at,
            size: record.size_bytes,
        })));
    }

    Err(AppError::bad_request("no file uploaded"))
}

/// `GET /api?id=..[&info]` — metadata as JSON, or the raw bytes.
pub async fn get_object(
    State(service): State<StorageService>,
    Query(query): Query<ObjectQuery>,
) -> Response {
    let id = query.id.unwrap_or_default();
    if query.info.is_some() {
        match object_info(&service, &id).await {
            Ok(info) => info.into_response(),
            Err(err) => err.into_response(),
        }
    } else {
        match service.open_download(&id).await {
            Ok(download) => download_response(download),
            Err(err) => AppError::from(err).into_plain_response(),
        }
    }
}

async fn object_info(
    service: &StorageService,
    id: &str,
) -> Result<Json<ApiResponse<InfoData>>, AppError> {
    let info = service.info(id).await?;
    let record = info.record;
    let is_zip = info.preview.is_some();
    let (zip_contents, zip_truncated) = match info.preview {
        Some(preview) => (Some(preview.entries), Some(preview.truncated)),
        None => (None, None),
    };

    Ok(Json(ApiResponse::ok(InfoData {
        id: record.id,
        filename: record.filename,
        size: record.size_bytes,
        expires_at: record.expires_at,
        uploaded_at: record.uploaded_at,
        is_zip,
        zip_contents,
        zip_truncated,
    })))
}

fn download_response(download: Download) -> Response {
    let Download { record, file, len } = download;
    let body = Body::from_stream(ReaderStream::new(file));

    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_download_headers(response.headers_mut(), &record.filename, len, &record.etag);
    response
}

fn set_download_headers(headers: &mut HeaderMap, filename: &str, len: u64, etag: &str) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));

    let encoded = utf8_percent_encode(filename, FILENAME_ENCODE).to_string();
    let disposition = format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii_fallback(filename),
        encoded
    );
    if let Ok(value) = HeaderValue::from_str(&disposition) {
        headers.insert(header::CONTENT_DISPOSITION, value);
    }
    if let Ok(value) = HeaderValue::from_str(&encoded) {
        headers.insert(X_FILENAME, value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
        headers.insert(header::ETAG, value);
    }
}

/// Plain `filename=` value for clients that ignore `filename*`.
fn ascii_fallback(filename: &str) -> String {
    filename
        .chars()
        .map(|c| match c {
            ' '..='~' if c != '"' && c != '\\' => c,
            _ => '_',
        })
        .collect()
}
