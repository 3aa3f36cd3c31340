use thiserror::Error;

agentim_common::impl_context!();

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Message(String),
    #[error("router selection timed out")]
    Timeout,
    #[error("router returned a malformed response")]
    MalformedResponse,
    #[error(transparent)]
    Ssrf(#[from] agentim_ssrf::Error),
    #[error(transparent)]
    Crypto(#[from] agentim_auth::crypto::CryptoError),
}

impl agentim_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
