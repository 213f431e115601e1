//! The tus protocol state machine over HTTP.
//!
//! Validates request headers, orchestrates the chunk store, and emits the
//! canonical tus response headers. Storage concerns stay behind the
//! `ChunkStore` trait; this module owns protocol semantics only.

use std::collections::HashSet;
use std::io;

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{header as http_header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::Response,
};
use chrono::{Duration, Utc};
use futures::StreamExt;
use rand::Rng;

use crate::{
    errors::ProtocolError,
    models::upload_info::{self, header, ConcatKind, UploadInfo, TUS_VERSION},
    services::{
        checksum::{self, ChecksumAlgorithm, RewindableBody, SUPPORTED_ALGORITHMS},
        chunk_store::{ByteStream, StorageError},
        range::{self, RangeOutcome},
    },
    state::AppState,
};

const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";
const EXTENSIONS: &str =
    "creation,creation-defer-length,termination,expiration,concatenation,checksum";

const CORS_ALLOW_METHODS: &str = "POST,GET,HEAD,PATCH,DELETE,OPTIONS";
const CORS_ALLOW_HEADERS: &str = "Origin, X-Requested-With, Content-Type, Tus-Resumable, \
     Upload-Length, Upload-Offset, Upload-Defer-Length, Upload-Metadata, Upload-Concat, \
     Upload-Checksum, X-HTTP-Method-Override";
const CORS_EXPOSE_HEADERS: &str = "Tus-Resumable, Tus-Version, Tus-Extension, Tus-Max-Size, \
     Tus-Checksum-Algorithm, Upload-Length, Upload-Offset, Upload-Defer-Length, \
     Upload-Metadata, Upload-Concat, Upload-Expires, Location, Content-Range, Accept-Ranges, \
     Content-Disposition, ETag";

/// `OPTIONS /` and `OPTIONS /{uid}` — advertise capabilities.
pub async fn server_options(State(state): State<AppState>) -> Response {
    let mut response = tus_response(StatusCode::NO_CONTENT);
    let headers = response.headers_mut();
    insert_header(headers, header::TUS_VERSION, TUS_VERSION);
    insert_header(headers, header::TUS_EXTENSION, EXTENSIONS);
    insert_header(headers, header::TUS_CHECKSUM_ALGORITHM, SUPPORTED_ALGORITHMS);
    if let Some(max) = state.config().max_size {
        insert_header(headers, header::TUS_MAX_SIZE, &max.to_string());
    }
    response
}

/// `POST /` — create an upload, or assemble a final one from partials.
pub async fn create_upload(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, ProtocolError> {
    require_tus_version(&headers)?;
    let config = state.config();

    let concat_raw = header_str(&headers, header::UPLOAD_CONCAT).map(str::to_string);
    let concat = match concat_raw.as_deref() {
        Some(raw) => upload_info::parse_concat(raw)
            .ok_or_else(|| ProtocolError::invalid_header("invalid Upload-Concat header"))?,
        None => ConcatKind::None,
    };
    let is_final = matches!(concat, ConcatKind::Final { .. });

    let defer = match header_str(&headers, header::UPLOAD_DEFER_LENGTH) {
        Some("1") => true,
        Some(_) => {
            return Err(ProtocolError::invalid_header(
                "invalid Upload-Defer-Length header",
            ))
        }
        None => false,
    };

    let length = match header_str(&headers, header::UPLOAD_LENGTH) {
        Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
            ProtocolError::invalid_header("invalid Upload-Length header")
        })?),
        None => None,
    };
    if defer && length.is_some() {
        return Err(ProtocolError::invalid_header(
            "Upload-Length conflicts with Upload-Defer-Length",
        ));
    }
    if length.is_none() && !defer && !is_final {
        return Err(ProtocolError::invalid_header("missing Upload-Length header"));
    }
    if let (Some(len), Some(max)) = (length, config.max_size) {
        if len > max {
            return Err(ProtocolError::SizeExceeded(
                "declared length exceeds the maximum size".into(),
            ));
        }
    }

    let metadata_raw = header_str(&headers, header::UPLOAD_METADATA).map(str::to_string);
    if let Some(raw) = metadata_raw.as_deref() {
        if !upload_info::validate_metadata(raw) {
            return Err(ProtocolError::invalid_header("invalid Upload-Metadata header"));
        }
    }

    let uid = generate_uid();
    let mut info = UploadInfo::new();
    info.set_offset(0);
    if let Some(len) = length {
        info.set_length(len);
    }
    if defer {
        info.mark_deferred();
    }
    if let Some(raw) = metadata_raw {
        info.set_metadata_header(raw);
    }
    if let Some(raw) = concat_raw {
        info.set_concat_header(raw);
    }
    info.set_expires(Utc::now() + Duration::seconds(config.expiration_secs as i64));

    state
        .hooks()
        .before_create(&uid, &info)
        .await
        .map_err(ProtocolError::Hook)?;

    match &concat {
        ConcatKind::Final { part_uids } => concat_final(&state, &uid, part_uids, &mut info).await?,
        _ => state.store().create_file(&uid, &info).await?,
    }
    state.store().update_info(&uid, &info).await?;

    state
        .hooks()
        .after_create(&uid, &info)
        .await
        .map_err(ProtocolError::Hook)?;
    tracing::info!(uid = %uid, final_upload = is_final, "created upload");

    let mut response = tus_response(StatusCode::CREATED);
    insert_header(response.headers_mut(), "location", &format!("/{uid}"));
    apply_info_headers(&mut response, &info);
    Ok(response)
}

/// Assemble a final upload from finished partials (tus concatenation).
async fn concat_final(
    state: &AppState,
    uid: &str,
    part_uids: &[String],
    info: &mut UploadInfo,
) -> Result<(), ProtocolError> {
    if part_uids.is_empty() {
        return Err(ProtocolError::invalid_header(
            "Upload-Concat references no partial uploads",
        ));
    }
    let mut seen = HashSet::new();
    if !part_uids.iter().all(|part| seen.insert(part)) {
        return Err(ProtocolError::invalid_header(
            "Upload-Concat references a partial upload twice",
        ));
    }

    let mut total: u64 = 0;
    for part in part_uids {
        let part_info = match state.store().read_info(part).await {
            Ok(info) => info,
            Err(StorageError::NotFound(_)) => {
                return Err(ProtocolError::invalid_header("partial upload not found"))
            }
            Err(err) => return Err(err.into()),
        };
        if !part_info.is_partial() {
            return Err(ProtocolError::invalid_header(
                "referenced upload is not partial",
            ));
        }
        let length = part_info.length().ok_or_else(|| {
            ProtocolError::invalid_header("partial upload has no length")
        })?;
        if part_info.offset() != length {
            return Err(ProtocolError::invalid_header(
                "partial upload is not finished",
            ));
        }
        total += length;
    }
    if let Some(max) = state.config().max_size {
        if total > max {
            return Err(ProtocolError::invalid_header(
                "combined upload exceeds the maximum size",
            ));
        }
    }

    state.store().concatenate(uid, part_uids, info).await?;
    info.set_length(total);
    info.set_offset(total);
    Ok(())
}

/// `HEAD /{uid}` — report the resume point.
pub async fn head_upload(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ProtocolError> {
    require_tus_version(&headers)?;
    let info = state.store().read_info(&uid).await?;

    let mut response = tus_response(StatusCode::NO_CONTENT);
    apply_info_headers(&mut response, &info);
    insert_header(response.headers_mut(), "cache-control", "no-store");
    Ok(response)
}

/// `PATCH /{uid}` — append a body at the current offset.
pub async fn patch_upload(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, ProtocolError> {
    require_tus_version(&headers)?;
    match header_str(&headers, "content-type") {
        Some(OFFSET_OCTET_STREAM) => {}
        _ => return Err(ProtocolError::UnsupportedMediaType),
    }
    let config = state.config();

    let _guard = state.lock_upload(&uid).await;
    let mut info = state.store().read_info(&uid).await?;

    // creation-defer-length: the first PATCH may carry the real length
    if info.defer_length() {
        if let Some(raw) = header_str(&headers, header::UPLOAD_LENGTH) {
            let length = raw.parse::<u64>().map_err(|_| {
                ProtocolError::invalid_header("invalid Upload-Length header")
            })?;
            if let Some(max) = config.max_size {
                if length > max {
                    return Err(ProtocolError::SizeExceeded(
                        "declared length exceeds the maximum size".into(),
                    ));
                }
            }
            if length < info.offset() {
                return Err(ProtocolError::invalid_header(
                    "Upload-Length is below the current offset",
                ));
            }
            info.set_length(length);
            info.clear_defer_length();
        }
    }

    let req_offset = header_str(&headers, header::UPLOAD_OFFSET)
        .and_then(|raw| raw.parse::<u64>().ok())
        .ok_or_else(|| ProtocolError::invalid_header("missing or invalid Upload-Offset header"))?;
    let offset = info.offset();
    if req_offset != offset {
        return Err(ProtocolError::OffsetMismatch {
            expected: offset,
            got: req_offset,
        });
    }

    let body_len = header_str(&headers, "content-length").and_then(|raw| raw.parse::<u64>().ok());
    if let Some(length) = info.length() {
        if offset == length {
            return Err(ProtocolError::AlreadyFinished);
        }
        if let Some(size) = body_len {
            if offset + size > length {
                return Err(ProtocolError::SizeExceeded(
                    "body runs past the declared length".into(),
                ));
            }
        }
    }
    if let (Some(size), Some(max)) = (body_len, config.max_size) {
        if offset + size > max {
            return Err(ProtocolError::SizeExceeded(
                "body runs past the maximum size".into(),
            ));
        }
    }

    let stream: ByteStream = body
        .into_data_stream()
        .map(|piece| piece.map_err(io::Error::other))
        .boxed();

    let written = match header_str(&headers, header::UPLOAD_CHECKSUM) {
        Some(raw) => {
            let (algorithm, digest) = checksum::parse_header(raw)
                .ok_or_else(|| ProtocolError::invalid_header("invalid Upload-Checksum header"))?;
            let algorithm: ChecksumAlgorithm = algorithm.parse().map_err(|_| {
                ProtocolError::invalid_header("unsupported checksum algorithm")
            })?;
            let digest = digest.to_string();

            let mut buffered = RewindableBody::buffer(stream)
                .await
                .map_err(|err| ProtocolError::Internal(err.to_string()))?;
            if !algorithm.verify(buffered.read_all(), &digest) {
                return Err(ProtocolError::ChecksumMismatch);
            }
            buffered.rewind();
            state
                .store()
                .patch_file(&uid, buffered.into_stream(), &info)
                .await?
        }
        None => state.store().patch_file(&uid, stream, &info).await?,
    };

    let new_offset = offset + written;
    info.set_offset(new_offset);
    info.set_expires(Utc::now() + Duration::seconds(config.expiration_secs as i64));
    state.store().update_info(&uid, &info).await?;

    let finished = info.length() == Some(new_offset);
    if finished {
        state.store().finalize_file(&uid, &info).await?;
        state
            .hooks()
            .after_finish(&uid, &info)
            .await
            .map_err(ProtocolError::Hook)?;
    }
    tracing::debug!(uid = %uid, offset = new_offset, finished, "patched upload");

    let mut response = tus_response(StatusCode::NO_CONTENT);
    let resp_headers = response.headers_mut();
    insert_header(resp_headers, header::UPLOAD_OFFSET, &new_offset.to_string());
    if let Some(raw) = info.expires() {
        insert_header(resp_headers, header::UPLOAD_EXPIRES, raw);
    }
    Ok(response)
}

/// `GET /{uid}` — stream the stored bytes, honoring `Range`.
pub async fn download_upload(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ProtocolError> {
    let config = state.config();
    let info = state.store().read_info(&uid).await?;

    if let Some(template) = &config.redirect_download {
        let mut response = tus_response(StatusCode::FOUND);
        let url = template.replace("{uid}", &uid);
        insert_header(response.headers_mut(), "location", &url);
        return Ok(response);
    }

    let total = info.offset();
    let (status, start, end) = match range::negotiate(header_str(&headers, "range"), total) {
        RangeOutcome::Unsatisfiable => {
            return Err(ProtocolError::RangeUnsatisfiable { length: total })
        }
        RangeOutcome::Full => (StatusCode::OK, 0, total.saturating_sub(1)),
        RangeOutcome::Partial(r) => (StatusCode::PARTIAL_CONTENT, r.start, r.end),
    };

    let download = state.store().read_file(&uid, Some((start, end))).await?;

    let mut response = Response::new(Body::from_stream(download.stream));
    *response.status_mut() = status;
    let resp_headers = response.headers_mut();
    insert_header(resp_headers, "accept-ranges", "bytes");
    insert_header(resp_headers, "content-length", &download.length.to_string());
    let content_type = info
        .content_type()
        .unwrap_or_else(|| "application/octet-stream".into());
    insert_header(resp_headers, "content-type", &content_type);
    insert_header(resp_headers, "etag", &format!("W/\"{uid}\""));
    let disposition = match info.filename() {
        Some(name) => format!(
            "{}; filename=\"{}\"",
            config.disposition.as_str(),
            name.replace('"', "'")
        ),
        None => config.disposition.as_str().to_string(),
    };
    insert_header(resp_headers, "content-disposition", &disposition);
    if status == StatusCode::PARTIAL_CONTENT {
        insert_header(
            resp_headers,
            "content-range",
            &format!("bytes {start}-{end}/{total}"),
        );
    }
    Ok(response)
}

/// `DELETE /{uid}` — terminate an upload.
pub async fn terminate_upload(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ProtocolError> {
    require_tus_version(&headers)?;

    let guard = state.lock_upload(&uid).await;
    let info = state.store().read_info(&uid).await?;
    state.store().delete_file(&uid).await?;
    drop(guard);
    state.forget_lock(&uid).await;

    state
        .hooks()
        .after_terminate(&uid, &info)
        .await
        .map_err(ProtocolError::Hook)?;
    tracing::info!(uid = %uid, "terminated upload");
    Ok(tus_response(StatusCode::NO_CONTENT))
}

/// Rewrite the HTTP verb once from `X-HTTP-Method-Override`.
pub async fn override_method(mut request: Request, next: Next) -> Response {
    if let Some(method) = request
        .headers_mut()
        .remove(HeaderName::from_static(header::METHOD_OVERRIDE))
        .and_then(|value| Method::from_bytes(value.as_bytes()).ok())
    {
        *request.method_mut() = method;
    }
    next.run(request).await
}

/// Reflect allow-listed origins and emit the tus CORS header set.
pub async fn cors(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let origin = request
        .headers()
        .get(http_header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let preflight = request.method() == Method::OPTIONS;
    let mut response = next.run(request).await;

    let Some(origin) = origin else {
        return response;
    };
    if !state.config().request_origins.iter().any(|o| o == &origin) {
        return response;
    }

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&origin) {
        headers.insert(http_header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    if preflight {
        headers.insert(
            http_header::ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static(CORS_ALLOW_METHODS),
        );
        headers.insert(
            http_header::ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static(CORS_ALLOW_HEADERS),
        );
        headers.insert(
            http_header::ACCESS_CONTROL_MAX_AGE,
            HeaderValue::from_static("86400"),
        );
    } else {
        headers.insert(
            http_header::ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static(CORS_EXPOSE_HEADERS),
        );
    }
    response
}

/// 128 bits of CSPRNG entropy as 32 lowercase hex characters.
fn generate_uid() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn require_tus_version(headers: &HeaderMap) -> Result<(), ProtocolError> {
    match header_str(headers, header::TUS_RESUMABLE) {
        Some(TUS_VERSION) => Ok(()),
        Some(other) => Err(ProtocolError::UnsupportedVersion(other.to_string())),
        None => Err(ProtocolError::UnsupportedVersion("missing".into())),
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

fn tus_response(status: StatusCode) -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = status;
    insert_header(response.headers_mut(), header::TUS_RESUMABLE, TUS_VERSION);
    response
}

fn apply_info_headers(response: &mut Response, info: &UploadInfo) {
    for (name, value) in info.headers() {
        insert_header(response.headers_mut(), name, &value);
    }
}
