mod ytdlp;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::{
    error::{ResolveError, StreamError},
    format::{Format, VideoInfo},
    video_id::VideoId,
};

pub use ytdlp::YtDlpResolver;

/// Media bytes for one format. Dropping the stream cancels the transfer.
pub type ByteStream = BoxStream<'static, Result<Bytes, StreamError>>;

#[async_trait]
pub trait VideoResolver: Send + Sync {
    async fn resolve(&self, id: &VideoId) -> Result<VideoInfo, ResolveError>;

    async fn open_stream(&self, id: &VideoId, format: &Format) -> Result<ByteStream, StreamError>;
}
