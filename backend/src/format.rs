use std::{cmp::Reverse, collections::BTreeMap};

const PREFERRED_ITAG: &str = "136";
const PREFERRED_QUALITY_LABEL: &str = "720p";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Format {
    pub itag: String,
    pub quality_label: Option<String>,
    pub has_audio: bool,
    pub has_video: bool,
    pub height: Option<u32>,
    pub ext: Option<String>,
    pub filesize: Option<u64>,
    pub url: Option<String>,
    pub protocol: Option<String>,
    pub http_headers: BTreeMap<String, String>,
}

impl Format {
    pub fn is_video_only(&self) -> bool {
        self.has_video && !self.has_audio
    }

    pub fn is_direct_http(&self) -> bool {
        self.url.is_some() && matches!(self.protocol.as_deref(), Some("http" | "https"))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VideoInfo {
    pub id: String,
    pub title: Option<String>,
    pub formats: Vec<Format>,
}

pub fn select_format(formats: &[Format]) -> Option<&Format> {
    let preferred = formats.iter().find(|format| {
        format.itag == PREFERRED_ITAG
            && format.quality_label.as_deref() == Some(PREFERRED_QUALITY_LABEL)
            && !format.has_audio
    });
    if preferred.is_some() {
        return preferred;
    }

    formats
        .iter()
        .filter(|format| format.is_video_only())
        .min_by_key(|format| Reverse(format.height.unwrap_or_default()))
}
