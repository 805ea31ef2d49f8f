use std::{collections::BTreeMap, future, process::Stdio, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{StreamExt, TryStreamExt, stream};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use tokio::{io::AsyncReadExt, process::Command, time::timeout};
use tokio_util::io::ReaderStream;
use tracing::debug;

use super::{ByteStream, VideoResolver};
use crate::{
    config::AppConfig,
    error::{ResolveError, StreamError, stderr_message},
    format::{Format, VideoInfo},
    video_id::VideoId,
};

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    id: Option<String>,
    title: Option<String>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    format_id: String,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<u32>,
    format_note: Option<String>,
    filesize: Option<u64>,
    url: Option<String>,
    protocol: Option<String>,
    #[serde(default)]
    http_headers: BTreeMap<String, String>,
}

impl From<YtDlpFormat> for Format {
    fn from(item: YtDlpFormat) -> Self {
        let has_video = has_codec(item.vcodec.as_deref());
        let has_audio = has_codec(item.acodec.as_deref());
        let quality_label = item
            .format_note
            .filter(|note| !note.trim().is_empty())
            .or_else(|| item.height.filter(|_| has_video).map(|h| format!("{h}p")));

        Format {
            itag: item.format_id,
            quality_label,
            has_audio,
            has_video,
            height: item.height,
            ext: item.ext,
            filesize: item.filesize,
            url: item.url,
            protocol: item.protocol,
            http_headers: item.http_headers,
        }
    }
}

fn has_codec(codec: Option<&str>) -> bool {
    matches!(codec, Some(value) if value != "none")
}

fn parse_video_info(stdout: &[u8]) -> Result<VideoInfo, ResolveError> {
    let info: YtDlpVideoInfo = serde_json::from_slice(stdout)?;
    Ok(VideoInfo {
        id: info.id.unwrap_or_default(),
        title: info.title,
        formats: info.formats.into_iter().map(Format::from).collect(),
    })
}

#[derive(Debug, Clone)]
pub struct YtDlpResolver {
    program: String,
    resolve_timeout: Option<Duration>,
    http_client: reqwest::Client,
}

impl YtDlpResolver {
    pub fn new(config: &AppConfig) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .tcp_nodelay(true)
            .build()?;

        Ok(Self {
            program: config.yt_dlp_path.clone(),
            resolve_timeout: config.resolve_timeout,
            http_client,
        })
    }

    pub async fn probe_version(&self) -> Option<String> {
        let output = Command::new(&self.program)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .ok()?;

        output.status.success().then(|| {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        })
    }

    async fn fetch_direct(&self, url: &str, format: &Format) -> Result<ByteStream, StreamError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &format.http_headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| StreamError::InvalidHeader(name.clone()))?;
            let header_value =
                HeaderValue::from_str(value).map_err(|_| StreamError::InvalidHeader(name.clone()))?;
            headers.insert(header_name, header_value);
        }

        let response = self.http_client.get(url).headers(headers).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::UpstreamStatus(status));
        }

        debug!(
            "Direct fetch of format {} answered {status} (length {:?})",
            format.itag,
            response.content_length()
        );
        Ok(response.bytes_stream().map_err(StreamError::from).boxed())
    }

    fn pipe_through_ytdlp(&self, id: &VideoId, format: &Format) -> Result<ByteStream, StreamError> {
        let mut command = Command::new(&self.program);
        command
            .args(["--no-playlist", "--no-warnings", "--quiet", "--no-part", "-f"])
            .arg(&format.itag)
            .args(["-o", "-"])
            .arg(id.watch_url())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| StreamError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("yt-dlp stdout was not captured"))?;

        // Drained on its own task so a chatty stderr cannot stall stdout.
        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buffer = Vec::new();
                let _ = stderr.read_to_end(&mut buffer).await;
                buffer
            })
        });

        let body = ReaderStream::new(stdout).map_err(StreamError::from);
        let exit = stream::once(async move {
            let status = match child.wait().await {
                Ok(status) => status,
                Err(error) => return Some(Err(StreamError::Io(error))),
            };
            if status.success() {
                return None;
            }

            let stderr = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => Vec::new(),
            };
            let failure: Result<Bytes, StreamError> = Err(StreamError::Exit {
                status: status.to_string(),
                message: stderr_message(&stderr),
            });
            Some(failure)
        })
        .filter_map(future::ready);

        Ok(body.chain(exit).boxed())
    }
}

#[async_trait]
impl VideoResolver for YtDlpResolver {
    async fn resolve(&self, id: &VideoId) -> Result<VideoInfo, ResolveError> {
        let mut command = Command::new(&self.program);
        command
            .args(["-J", "--no-playlist", "--no-warnings"])
            .arg(id.watch_url())
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let command_future = command.output();

        let output = match self.resolve_timeout {
            Some(limit) => timeout(limit, command_future)
                .await
                .map_err(|_| ResolveError::Timeout(limit))?,
            None => command_future.await,
        }
        .map_err(|source| ResolveError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        if !output.status.success() {
            return Err(ResolveError::Exit {
                status: output.status.to_string(),
                message: stderr_message(&output.stderr),
            });
        }

        let info = parse_video_info(&output.stdout)?;
        debug!(
            "Resolved {id} as {:?} ({:?}) with {} format(s)",
            info.id,
            info.title,
            info.formats.len()
        );
        Ok(info)
    }

    async fn open_stream(&self, id: &VideoId, format: &Format) -> Result<ByteStream, StreamError> {
        match format.url.as_deref() {
            Some(url) if format.is_direct_http() => self.fetch_direct(url, format).await,
            _ => self.pipe_through_ytdlp(id, format),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video_id::parse_video_id;
    use axum::{
        Router,
        http::{HeaderMap as AxumHeaderMap, StatusCode},
        response::IntoResponse,
        routing::get,
    };
    use tokio::net::TcpListener;

    const SAMPLE_INFO: &str = r#"{
        "id": "dQw4w9WgXcQ",
        "title": "Sample",
        "formats": [
            {"format_id": "140", "ext": "m4a", "vcodec": "none", "acodec": "mp4a.40.2",
             "height": null, "format_note": "medium", "protocol": "https",
             "url": "https://example.invalid/140"},
            {"format_id": "136", "ext": "mp4", "vcodec": "avc1.4d401f", "acodec": "none",
             "height": 720, "format_note": "720p", "filesize": 1234, "protocol": "https",
             "url": "https://example.invalid/136",
             "http_headers": {"User-Agent": "Mozilla/5.0"}},
            {"format_id": "18", "ext": "mp4", "vcodec": "avc1.42001E", "acodec": "mp4a.40.2",
             "height": 360, "protocol": "https"},
            {"format_id": "sb0", "ext": "mhtml", "vcodec": "none", "acodec": "none",
             "protocol": "mhtml"}
        ]
    }"#;

    fn test_config(program: &str) -> AppConfig {
        AppConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            yt_dlp_path: program.to_string(),
            resolve_timeout: Some(Duration::from_secs(5)),
            connect_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn decodes_track_presence_from_codecs() {
        let info = parse_video_info(SAMPLE_INFO.as_bytes()).unwrap();
        assert_eq!(info.id, "dQw4w9WgXcQ");
        assert_eq!(info.formats.len(), 4);

        let audio = &info.formats[0];
        assert!(audio.has_audio && !audio.has_video);

        let preferred = &info.formats[1];
        assert_eq!(preferred.itag, "136");
        assert_eq!(preferred.quality_label.as_deref(), Some("720p"));
        assert!(preferred.is_video_only());
        assert_eq!(preferred.filesize, Some(1234));
        assert_eq!(
            preferred.http_headers.get("User-Agent").map(String::as_str),
            Some("Mozilla/5.0")
        );

        let muxed = &info.formats[2];
        assert!(muxed.has_audio && muxed.has_video);
        assert_eq!(muxed.quality_label.as_deref(), Some("360p"));

        let storyboard = &info.formats[3];
        assert!(!storyboard.has_audio && !storyboard.has_video);
        assert_eq!(storyboard.quality_label, None);
    }

    #[test]
    fn rejects_malformed_extractor_output() {
        let error = parse_video_info(b"ERROR: not json").unwrap_err();
        assert!(matches!(error, ResolveError::Decode(_)));
    }

    #[tokio::test]
    async fn missing_executable_is_a_spawn_error() {
        let resolver = YtDlpResolver::new(&test_config("/nonexistent/yt-dlp")).unwrap();
        let id = parse_video_id("dQw4w9WgXcQ").unwrap();

        assert_eq!(resolver.probe_version().await, None);

        let error = resolver.resolve(&id).await.unwrap_err();
        assert!(matches!(error, ResolveError::Spawn { .. }));

        let format = Format {
            itag: "136".to_string(),
            ..Format::default()
        };
        let error = resolver.open_stream(&id, &format).await.err().unwrap();
        assert!(matches!(error, StreamError::Spawn { .. }));
    }

    async fn upstream_media(headers: AxumHeaderMap) -> impl IntoResponse {
        match headers.get("x-format-token").and_then(|v| v.to_str().ok()) {
            Some("secret") => (StatusCode::OK, "media-bytes"),
            _ => (StatusCode::FORBIDDEN, "denied"),
        }
    }

    async fn spawn_upstream() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().route("/videoplayback", get(upstream_media));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/videoplayback")
    }

    fn direct_format(url: String, token: Option<&str>) -> Format {
        let mut http_headers = BTreeMap::new();
        if let Some(token) = token {
            http_headers.insert("X-Format-Token".to_string(), token.to_string());
        }
        Format {
            itag: "137".to_string(),
            has_video: true,
            url: Some(url),
            protocol: Some("http".to_string()),
            http_headers,
            ..Format::default()
        }
    }

    #[tokio::test]
    async fn direct_fetch_forwards_format_headers() {
        let url = spawn_upstream().await;
        let resolver = YtDlpResolver::new(&test_config("/nonexistent/yt-dlp")).unwrap();
        let id = parse_video_id("dQw4w9WgXcQ").unwrap();

        let stream = resolver
            .open_stream(&id, &direct_format(url, Some("secret")))
            .await
            .unwrap();
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"media-bytes");
    }

    #[tokio::test]
    async fn direct_fetch_rejects_error_status() {
        let url = spawn_upstream().await;
        let resolver = YtDlpResolver::new(&test_config("/nonexistent/yt-dlp")).unwrap();
        let id = parse_video_id("dQw4w9WgXcQ").unwrap();

        let error = resolver
            .open_stream(&id, &direct_format(url, None))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            error,
            StreamError::UpstreamStatus(status) if status == reqwest::StatusCode::FORBIDDEN
        ));
    }

    #[cfg(unix)]
    fn fake_ytdlp(dir: &tempfile::TempDir, script: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.path().join("yt-dlp");
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[cfg(unix)]
    fn piped_format() -> Format {
        Format {
            itag: "137".to_string(),
            has_video: true,
            height: Some(1080),
            protocol: Some("http_dash_segments".to_string()),
            ..Format::default()
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pipe_exit_failure_follows_the_last_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_ytdlp(&dir, "printf 'abc'; echo 'ERROR: boom' >&2; exit 3");
        let resolver = YtDlpResolver::new(&test_config(&program)).unwrap();
        let id = parse_video_id("dQw4w9WgXcQ").unwrap();

        let stream = resolver.open_stream(&id, &piped_format()).await.unwrap();
        let items: Vec<Result<Bytes, StreamError>> = stream.collect().await;

        assert_eq!(items.len(), 2);
        assert!(matches!(&items[0], Ok(chunk) if chunk.as_ref() == b"abc"));
        assert!(matches!(
            &items[1],
            Err(StreamError::Exit { message, .. }) if message == "ERROR: boom"
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pipe_clean_exit_ends_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_ytdlp(&dir, "printf 'abc'");
        let resolver = YtDlpResolver::new(&test_config(&program)).unwrap();
        let id = parse_video_id("dQw4w9WgXcQ").unwrap();

        let stream = resolver.open_stream(&id, &piped_format()).await.unwrap();
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"abc");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_metadata_resolution_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let program = fake_ytdlp(&dir, "sleep 30");
        let mut config = test_config(&program);
        config.resolve_timeout = Some(Duration::from_secs(1));
        let resolver = YtDlpResolver::new(&config).unwrap();
        let id = parse_video_id("dQw4w9WgXcQ").unwrap();

        let started = std::time::Instant::now();
        let error = resolver.resolve(&id).await.unwrap_err();

        assert!(matches!(error, ResolveError::Timeout(limit) if limit == Duration::from_secs(1)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pipe_failing_before_first_byte_is_a_failed_download() {
        use axum::{
            body::{Body, to_bytes},
            http::Request,
        };
        use std::sync::Arc;
        use tower::ServiceExt;

        let dir = tempfile::tempdir().unwrap();
        let program = fake_ytdlp(
            &dir,
            r#"case "$1" in
  -J) printf '%s' '{"id":"dQw4w9WgXcQ","formats":[{"format_id":"137","vcodec":"avc1.640028","acodec":"none","height":1080,"protocol":"http_dash_segments"}]}' ;;
  *) echo 'ERROR: fragment 1 not found' >&2; exit 1 ;;
esac"#,
        );
        let resolver = YtDlpResolver::new(&test_config(&program)).unwrap();
        let app = crate::download::router(Arc::new(resolver));

        let request = Request::builder()
            .uri("/api/download?videoId=dQw4w9WgXcQ")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json, serde_json::json!({ "error": "Download failed" }));
    }
}
