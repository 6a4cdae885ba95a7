use axum::{
    Json,
    extract::{Query, State, rejection::JsonRejection},
    http::{
        HeaderMap, HeaderValue,
        header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE},
    },
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    bilibili::{BilibiliClient, DEFAULT_CONTENT_TYPE, VideoInfo},
    error::ApiError,
    non_empty,
};

const URL_REQUIRED: &str = "URL is required";
const DOWNLOAD_FAILED: &str = "Download failed";
const DEFAULT_TITLE: &str = "video";

#[derive(Clone)]
pub struct AppState {
    pub bilibili: BilibiliClient,
}

#[derive(Debug, Deserialize)]
pub struct ParseRequest {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    sessdata: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ParseResponse {
    success: bool,
    data: VideoInfo,
}

#[derive(Debug, Deserialize)]
pub struct DownloadQuery {
    url: Option<String>,
    title: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    sessdata: Option<String>,
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn parse_video(
    State(state): State<AppState>,
    payload: Result<Json<ParseRequest>, JsonRejection>,
) -> Result<Json<ParseResponse>, ApiError> {
    // An unreadable body carries no usable url either.
    let Json(payload) = payload.map_err(|rejection| {
        debug!("Unreadable parse body: {rejection}");
        ApiError::bad_request(URL_REQUIRED)
    })?;

    let url = payload
        .url
        .as_deref()
        .and_then(non_empty)
        .ok_or_else(|| ApiError::bad_request(URL_REQUIRED))?;
    let sessdata = credential(payload.sessdata.as_deref());

    let data = state
        .bilibili
        .parse_video(url, sessdata)
        .await
        .map_err(|error| {
            warn!("Parse failed for {url:?}: {error}");
            ApiError::from(error)
        })?;

    info!(
        bv_id = %data.bv_id,
        qualities = data.qualities.len(),
        has_audio = !data.audio_url.is_empty(),
        "parsed video"
    );
    Ok(Json(ParseResponse {
        success: true,
        data,
    }))
}

pub async fn download(
    State(state): State<AppState>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    let Some(url) = query.url.as_deref().and_then(non_empty) else {
        return Err(ApiError::bad_request(URL_REQUIRED).plain_text());
    };
    let sessdata = credential(query.sessdata.as_deref());

    let media = state
        .bilibili
        .open_stream(url, sessdata)
        .await
        .map_err(|error| {
            warn!("Download failed: {error}");
            ApiError::internal(DOWNLOAD_FAILED).plain_text()
        })?;

    let title = query.title.as_deref().and_then(non_empty).unwrap_or(DEFAULT_TITLE);
    let filename = format!(
        "{}.{}",
        sanitize_title(title),
        extension_for(query.kind.as_deref())
    );

    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(&media.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static(DEFAULT_CONTENT_TYPE)),
    );
    headers.insert(
        CONTENT_DISPOSITION,
        HeaderValue::from_str(&content_disposition(&filename))
            .map_err(|_| ApiError::internal(DOWNLOAD_FAILED).plain_text())?,
    );
    if let Some(length) = media.content_length {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
    }

    debug!(
        filename = %filename,
        content_type = %media.content_type,
        content_length = ?media.content_length,
        "relaying media"
    );
    Ok((headers, media.into_body()).into_response())
}

/// Blank tokens count as absent; anything else is forwarded byte for byte.
fn credential(value: Option<&str>) -> Option<&str> {
    value.filter(|token| non_empty(token).is_some())
}

/// Replace the characters Windows refuses in filenames.
pub fn sanitize_title(title: &str) -> String {
    title
        .chars()
        .map(|character| match character {
            '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            other => other,
        })
        .collect()
}

pub fn extension_for(kind: Option<&str>) -> &'static str {
    match kind {
        Some("audio") => "m4a",
        _ => "mp4",
    }
}

/// Percent-encodes like `encodeURIComponent`, which also leaves `! ' ( ) *` alone.
pub fn content_disposition(filename: &str) -> String {
    let encoded = urlencoding::encode(filename)
        .replace("%21", "!")
        .replace("%27", "'")
        .replace("%28", "(")
        .replace("%29", ")")
        .replace("%2A", "*");
    format!("attachment; filename=\"{encoded}\"")
}
