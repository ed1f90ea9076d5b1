use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("receiver closed")]
    ReceiverClosed,
    #[error("down track already exists")]
    DownTrackAlreadyExists,
    #[error("buffer not found")]
    BufferNotFound,
    #[error("invalid layer, target: {target}, reference: {reference}")]
    InvalidLayer { target: i32, reference: i32 },
    #[error("offset unavailable, target: {target}, reference: {reference}")]
    OffsetUnavailable { target: i32, reference: i32 },
    #[error(transparent)]
    Buffer(#[from] buffer::Error),
}
