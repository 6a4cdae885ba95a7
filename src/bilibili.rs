use std::{collections::HashSet, sync::LazyLock};

use axum::body::Body;
use regex::Regex;
use reqwest::{
    RequestBuilder,
    header::{CONTENT_TYPE, COOKIE, REFERER},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::{debug, warn};
use url::Url;

use crate::{error::ServiceError, non_empty};

pub const DEFAULT_API_BASE: &str = "https://api.bilibili.com";
pub const REFERER_ORIGIN: &str = "https://www.bilibili.com";
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

// qn=80 caps anonymous sessions at 1080P, fnval=4048 asks for DASH with every
// codec flag set and fourk=1 lets logged-in sessions see 4K tracks.
const PLAYURL_QUALITY: &str = "80";
const PLAYURL_FNVAL: &str = "4048";
const PLAYURL_FOURK: &str = "1";

const VIEW_FAILED: &str = "failed to fetch video info";
const PLAYURL_FAILED: &str = "failed to resolve playback url";

static BV_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"BV[0-9A-Za-z]{10}").expect("BV id pattern is valid"));

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityVariant {
    pub quality: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoInfo {
    pub title: String,
    pub cover: String,
    pub duration: String,
    pub author: String,
    pub bv_id: String,
    pub qualities: Vec<QualityVariant>,
    pub audio_url: String,
}

/// Every Bilibili web API wraps its payload as `{code, message, data}`.
#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

impl<T> ApiEnvelope<T> {
    fn into_data(self, fallback: &str) -> Result<T, ServiceError> {
        if self.code != 0 {
            let message = self.message.as_deref().and_then(non_empty).unwrap_or(fallback);
            return Err(ServiceError::upstream(message));
        }

        self.data.ok_or_else(|| ServiceError::upstream(fallback))
    }
}

#[derive(Debug, Deserialize)]
struct ViewData {
    title: String,
    pic: String,
    duration: u64,
    owner: ViewOwner,
    cid: i64,
    #[serde(default)]
    pages: Vec<ViewPage>,
}

#[derive(Debug, Deserialize)]
struct ViewOwner {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ViewPage {
    #[serde(default)]
    cid: Option<i64>,
    #[serde(default)]
    page: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct PlayData {
    #[serde(default)]
    dash: Option<DashPayload>,
    #[serde(default)]
    durl: Option<Vec<DurlEntry>>,
}

#[derive(Debug, Deserialize)]
struct DashPayload {
    #[serde(default)]
    video: Option<Vec<DashTrack>>,
    #[serde(default)]
    audio: Option<Vec<DashTrack>>,
}

#[derive(Debug, Deserialize)]
struct DashTrack {
    #[serde(default)]
    id: i64,
    #[serde(default, rename = "baseUrl")]
    base_url: Option<String>,
    #[serde(default, rename = "backupUrl")]
    backup_url: Option<Vec<String>>,
}

impl DashTrack {
    fn media_url(&self) -> Option<&str> {
        self.base_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .or_else(|| {
                self.backup_url
                    .as_ref()
                    .and_then(|urls| urls.first())
                    .map(String::as_str)
            })
    }
}

#[derive(Debug, Deserialize)]
struct DurlEntry {
    url: String,
}

/// An upstream media response that has been opened but not yet read.
///
/// The body is pulled lazily; dropping the handle closes the upstream
/// connection.
pub struct MediaStream {
    pub content_type: String,
    pub content_length: Option<u64>,
    response: reqwest::Response,
}

impl MediaStream {
    pub fn into_body(self) -> Body {
        Body::from_stream(self.response.bytes_stream())
    }
}

#[derive(Clone)]
pub struct BilibiliClient {
    http: reqwest::Client,
    api_base: String,
}

impl BilibiliClient {
    pub fn new(api_base: impl Into<String>) -> Result<Self, ServiceError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|error| ServiceError::upstream(format!("could not build HTTP client: {error}")))?;

        Ok(Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
        })
    }

    /// Resolve a video page link into its metadata and direct stream URLs.
    ///
    /// `sessdata` is forwarded as the `SESSDATA` cookie on the playurl call,
    /// which is what unlocks the 1080P+ and 4K tiers.
    pub async fn parse_video(
        &self,
        url: &str,
        sessdata: Option<&str>,
    ) -> Result<VideoInfo, ServiceError> {
        let bv_id =
            extract_bv_id(url).ok_or_else(|| ServiceError::invalid_input("invalid link"))?;

        debug!(bv_id, "fetching video info");
        let view: ViewData = self
            .fetch_api(
                self.http
                    .get(format!("{}/x/web-interface/view", self.api_base))
                    .query(&[("bvid", bv_id)]),
                VIEW_FAILED,
            )
            .await?;

        let cid = select_cid(&view, requested_page(url));
        let cid_param = cid.to_string();

        debug!(bv_id, cid, authenticated = sessdata.is_some(), "resolving playback url");
        let request = self
            .http
            .get(format!("{}/x/player/playurl", self.api_base))
            .query(&[
                ("bvid", bv_id),
                ("cid", cid_param.as_str()),
                ("qn", PLAYURL_QUALITY),
                ("fnval", PLAYURL_FNVAL),
                ("fourk", PLAYURL_FOURK),
            ]);
        let play: PlayData = self
            .fetch_api(with_site_headers(request, sessdata), PLAYURL_FAILED)
            .await?;

        let (qualities, audio_url) = collect_streams(play)?;

        Ok(VideoInfo {
            title: view.title,
            cover: normalize_cover(view.pic),
            duration: format_duration(view.duration),
            author: view.owner.name,
            bv_id: bv_id.to_string(),
            qualities,
            audio_url,
        })
    }

    /// Open a CDN media URL for relaying. Nothing is buffered here.
    pub async fn open_stream(
        &self,
        media_url: &str,
        sessdata: Option<&str>,
    ) -> Result<MediaStream, ServiceError> {
        let response = with_site_headers(self.http.get(media_url), sessdata)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|error| {
                warn!("media request failed: {error}");
                ServiceError::upstream(format!("media request failed: {error}"))
            })?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(non_empty)
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let content_length = response.content_length();

        Ok(MediaStream {
            content_type,
            content_length,
            response,
        })
    }

    async fn fetch_api<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        fallback: &str,
    ) -> Result<T, ServiceError> {
        let response = request
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|error| {
                warn!("{fallback}: {error}");
                ServiceError::upstream(format!("{fallback}: {error}"))
            })?;

        let envelope: ApiEnvelope<T> = response.json().await.map_err(|error| {
            warn!("{fallback}: undecodable response: {error}");
            ServiceError::upstream(format!("{fallback}: {error}"))
        })?;

        envelope.into_data(fallback)
    }
}

fn with_site_headers(request: RequestBuilder, sessdata: Option<&str>) -> RequestBuilder {
    let request = request.header(REFERER, REFERER_ORIGIN);
    match sessdata {
        Some(token) => request.header(COOKIE, format!("SESSDATA={token}")),
        None => request,
    }
}

pub fn extract_bv_id(input: &str) -> Option<&str> {
    BV_ID_PATTERN.find(input).map(|found| found.as_str())
}

/// `h:mm:ss` once the video passes an hour, `mm:ss` below that.
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{secs:02}")
    } else {
        format!("{minutes:02}:{secs:02}")
    }
}

pub fn quality_label(code: i64) -> String {
    match code {
        112 => "1080P+".to_string(),
        80 => "1080P".to_string(),
        64 => "720P".to_string(),
        32 => "480P".to_string(),
        16 => "360P".to_string(),
        other => format!("{other}P"),
    }
}

fn requested_page(input: &str) -> Option<u32> {
    let parsed = Url::parse(input.trim()).ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == "p")
        .and_then(|(_, value)| value.parse().ok())
}

fn select_cid(view: &ViewData, page: Option<u32>) -> i64 {
    page.and_then(|number| view.pages.iter().find(|entry| entry.page == Some(number)))
        .and_then(|entry| entry.cid)
        .unwrap_or(view.cid)
}

fn normalize_cover(cover: String) -> String {
    if cover.starts_with("//") {
        format!("https:{cover}")
    } else {
        cover
    }
}

fn collect_streams(play: PlayData) -> Result<(Vec<QualityVariant>, String), ServiceError> {
    if let Some(dash) = play.dash {
        let audio_url = match dash.audio.as_deref().and_then(<[DashTrack]>::first) {
            Some(track) => track
                .media_url()
                .ok_or_else(|| ServiceError::upstream("audio track has no playable url"))?
                .to_string(),
            None => String::new(),
        };

        // The same resolution shows up once per codec (avc/hevc/av1).
        let mut seen = HashSet::new();
        let mut qualities = Vec::new();
        for track in dash.video.unwrap_or_default() {
            if !seen.insert(track.id) {
                continue;
            }

            let url = track.media_url().ok_or_else(|| {
                ServiceError::upstream(format!("quality {} has no playable url", track.id))
            })?;
            qualities.push(QualityVariant {
                quality: quality_label(track.id),
                url: url.to_string(),
            });
        }

        return Ok((qualities, audio_url));
    }

    if let Some(durl) = play.durl {
        // Muxed FLV/MP4: audio cannot be split out without transcoding.
        let first = durl
            .into_iter()
            .next()
            .ok_or_else(|| ServiceError::upstream("playback url list is empty"))?;
        return Ok((
            vec![QualityVariant {
                quality: "Default".to_string(),
                url: first.url,
            }],
            String::new(),
        ));
    }

    Ok((Vec::new(), String::new()))
}
