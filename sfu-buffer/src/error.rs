use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("buffer closed")]
    Closed,
    #[error("uninitialized")]
    Uninitialized,
    #[error("packet not found")]
    PacketNotFound,
    #[error("packet too old")]
    PacketTooOld,
    #[error("buffer too small")]
    BufferTooSmall,
    #[error("packet size invalid")]
    InvalidPacket,
}
