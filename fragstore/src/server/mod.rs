//! RangeServer
//!
//! Responsibilities:
//! - Serve `GET` / `HEAD /{bucket}/{*key}` from `ObjectIo` with HTTP byte
//!   range semantics: 200 full, 206 partial, 400 malformed, 416
//!   unsatisfiable, 500 when metadata cannot be read.
//! - Prefetch the object tail in the background when a read starts at 0.
//!
//! Submodules:
//! - `range`: `Range` header parsing
pub mod range;

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{self, HeaderMap};
use axum::http::{StatusCode, response::Builder};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use thiserror::Error;

use crate::chunk::range::ByteRange;
use crate::error::Error;
use crate::object_io::ObjectIo;
use range::{RangeError, parse_range};

/// Bytes pulled from the reader per body frame.
const BODY_PIECE: u64 = 256 * 1024;

pub struct ServerState {
    pub io: Arc<ObjectIo>,
    pub prefetch_tail: u64,
}

impl ServerState {
    pub fn new(io: Arc<ObjectIo>) -> Self {
        let prefetch_tail = io.config().prefetch_tail;
        Self { io, prefetch_tail }
    }

    /// Warms the range cache with the last `prefetch_tail` bytes without
    /// holding up the response.
    fn prefetch_tail(&self, bucket: &str, key: &str, size: u64) {
        let tail = self.prefetch_tail.min(size);
        if tail == 0 {
            return;
        }
        let io = self.io.clone();
        let (bucket, key) = (bucket.to_string(), key.to_string());
        tokio::spawn(async move {
            match io.read_range(&bucket, &key, size - tail, size).await {
                Ok(data) => tracing::debug!(%bucket, %key, bytes = data.len(), "tail prefetched"),
                Err(e) => tracing::debug!(%bucket, %key, error = %e, "tail prefetch failed"),
            }
        });
    }
}

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("{0}")]
    Metadata(Error),

    #[error("malformed range: {0}")]
    BadRange(String),

    #[error("range not satisfiable for object of {size} bytes")]
    Unsatisfiable { size: u64 },
}

impl IntoResponse for ServeError {
    fn into_response(self) -> Response {
        tracing::error!("Generating response for ServeError: {:?}", self);
        let builder = match &self {
            Self::Metadata(_) => Response::builder().status(StatusCode::INTERNAL_SERVER_ERROR),
            Self::BadRange(_) => Response::builder().status(StatusCode::BAD_REQUEST),
            Self::Unsatisfiable { size } => Response::builder()
                .status(StatusCode::RANGE_NOT_SATISFIABLE)
                .header(header::CONTENT_RANGE, format!("bytes */{size}")),
        };
        finish(builder, Body::from(self.to_string()))
    }
}

fn finish(builder: Builder, body: Body) -> Response {
    builder.body(body).unwrap_or_else(|e| {
        tracing::error!("failed to build response: {e}");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}

pub fn create_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/{bucket}/{*key}", get(get_object_handler))
        .with_state(state)
}

/// GET|HEAD /{bucket}/{*key}
pub async fn get_object_handler(
    State(state): State<Arc<ServerState>>,
    Path((bucket, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ServeError> {
    let md = state
        .io
        .read_object_md(&bucket, &key)
        .await
        .map_err(ServeError::Metadata)?;

    let raw = headers
        .get(header::RANGE)
        .map(|v| v.to_str())
        .transpose()
        .map_err(|_| ServeError::BadRange("range header is not ASCII".into()))?;
    let requested = parse_range(raw, md.size).map_err(|e| match e {
        RangeError::Malformed(msg) => ServeError::BadRange(msg),
        RangeError::Unsatisfiable => ServeError::Unsatisfiable { size: md.size },
    })?;

    let (status, span) = match requested {
        Some(span) => (StatusCode::PARTIAL_CONTENT, span),
        None => (StatusCode::OK, ByteRange::new(0, md.size)),
    };
    if span.start == 0 {
        state.prefetch_tail(&bucket, &key, md.size);
    }

    let reader = state
        .io
        .open_reader(&bucket, &key, span.start, Some(span.end))
        .await
        .map_err(ServeError::Metadata)?;

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, md.content_type.as_str())
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, span.len());
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", span.start, span.end - 1, md.size),
        );
    }
    if let Some(etag) = &md.etag {
        builder = builder.header(header::ETAG, format!("\"{etag}\""));
    }
    tracing::debug!(%bucket, %key, start = span.start, end = span.end, status = status.as_u16(), "serving object");
    Ok(finish(
        builder,
        Body::from_stream(reader.into_stream(BODY_PIECE)),
    ))
}
