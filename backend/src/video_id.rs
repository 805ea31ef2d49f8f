use std::fmt;

use url::Url;

const ID_LENGTH: usize = 11;

const QUERY_DOMAINS: [&str; 5] = [
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "gaming.youtube.com",
];

const PATH_PREFIXES: [&str; 4] = ["embed", "v", "shorts", "live"];

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VideoId(String);

impl VideoId {
    pub fn watch_url(&self) -> String {
        format!("https://www.youtube.com/watch?v={}", self.0)
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn validate_id(value: &str) -> bool {
    value.len() == ID_LENGTH
        && value
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_'))
}

fn url_video_id(link: &str) -> Option<String> {
    let parsed = Url::parse(link.trim()).ok()?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }
    let host = parsed.host_str()?.to_ascii_lowercase();

    let query_id = parsed
        .query_pairs()
        .find(|(key, _)| key == "v")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty());

    let id = match query_id {
        Some(id) if QUERY_DOMAINS.contains(&host.as_str()) => id,
        Some(_) => return None,
        None => path_video_id(&parsed, &host)?,
    };

    let id: String = id.chars().take(ID_LENGTH).collect();
    validate_id(&id).then_some(id)
}

fn path_video_id(parsed: &Url, host: &str) -> Option<String> {
    let mut segments = parsed.path_segments()?;
    if host == "youtu.be" {
        return segments.next().map(ToString::to_string);
    }
    if host != "youtube.com" && host != "www.youtube.com" {
        return None;
    }

    let prefix = segments.next()?;
    if !PATH_PREFIXES.contains(&prefix) {
        return None;
    }
    segments.next().map(ToString::to_string)
}

pub fn parse_video_id(raw: &str) -> Option<VideoId> {
    if validate_id(raw) {
        return Some(VideoId(raw.to_string()));
    }

    url_video_id(&format!("https://www.youtube.com/watch?v={raw}")).map(VideoId)
}
