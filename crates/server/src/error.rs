use thiserror::Error;

agentim_common::impl_context!();

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Auth(#[from] agentim_auth::Error),
    #[error(transparent)]
    Store(#[from] agentim_rooms::store::Error),
    #[error(transparent)]
    Routing(#[from] agentim_routing::Error),
}

impl agentim_common::FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Maps server-side failures onto the wire error codes named in spec §4.6
/// and the auth/store errors surfaced back to a client as `server:error`.
pub fn wire_code(error: &Error) -> &'static str {
    match error {
        Error::Auth(agentim_auth::Error::InvalidToken) => "NOT_AUTHENTICATED",
        Error::Auth(agentim_auth::Error::Revoked) => "NOT_AUTHENTICATED",
        Error::Auth(agentim_auth::Error::ConnectionLimitExceeded) => "CONNECTION_LIMIT_EXCEEDED",
        Error::Store(agentim_rooms::store::Error::RoomNotFound) => agentim_protocol::error_codes::ROOM_NOT_FOUND,
        Error::Store(agentim_rooms::store::Error::NotAMember) => agentim_protocol::error_codes::NOT_A_MEMBER,
        _ => agentim_protocol::error_codes::INTERNAL_ERROR,
    }
}
