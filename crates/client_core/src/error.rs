use thiserror::Error;

use crate::{api::ApiError, connection::ConnectionError, transport::TransportError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not signed in")]
    NotAuthenticated,
    #[error("no conversation is selected")]
    NoActiveConversation,
    #[error("message content is empty")]
    EmptyMessage,
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("invalid api url: {0}")]
    Url(#[from] url::ParseError),
}

impl ClientError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ClientError::Api(ApiError::Unauthorized))
    }
}
