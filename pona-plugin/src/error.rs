use pona_api::cni::v1::{CniError, ErrorCode};
use prost::Message;
use semver::Version;
use thiserror::Error;

use crate::response::{CniErrorResponse, Response};

/// Code reported when ponad fails without a decodable `CniError`.
pub const INTERNAL_CODE: u32 = ErrorCode::Internal as u32;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("incompatible version {0}")]
    IncompatibleVersion(Version),

    #[error("invalid environment variables: {0}")]
    InvalidRequiredEnvVariables(String),

    #[error("invalid network config: {0}")]
    InvalidNetworkConfig(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("missing previous result: {0}")]
    NoPreviousResult(String),

    #[error("{0}")]
    Tonic(#[from] tonic::Status),

    #[error("{0}")]
    TonicTransport(#[from] tonic::transport::Error),
}

impl Error {
    fn code_msg(&self) -> (u32, String) {
        match self {
            Error::IncompatibleVersion(_) => (
                ErrorCode::IncompatibleCniVersion as u32,
                "Incompatible CNI Version".into(),
            ),
            Error::InvalidRequiredEnvVariables(_) | Error::Parse(_) => (
                ErrorCode::InvalidEnvironmentVariables as u32,
                "Invalid Required Environment Variables".into(),
            ),
            Error::Io(_) => (ErrorCode::IoFailure as u32, "I/O Error".into()),
            Error::Json(_) => (
                ErrorCode::DecodingFailure as u32,
                "failed to parse config from stdin data".into(),
            ),
            Error::InvalidNetworkConfig(_) => (
                ErrorCode::InvalidNetworkConfig as u32,
                "Invalid Network Config".into(),
            ),
            Error::NoPreviousResult(_) => {
                (INTERNAL_CODE, "pona must be called as chained plugin".into())
            }
            Error::TonicTransport(_) => (
                ErrorCode::TryAgainLater as u32,
                "failed to connect to socket".into(),
            ),
            Error::Tonic(status) => (INTERNAL_CODE, status.message().to_owned()),
        }
    }

    pub fn into_response(self, cni_version: Version) -> Response {
        if let Error::Tonic(status) = &self
            && let Ok(err) = CniError::decode(status.details())
            && !status.details().is_empty()
        {
            return Response::Error(CniErrorResponse {
                cni_version,
                code: err.code as u32,
                msg: err.msg,
                details: err.details,
            });
        }
        let (code, msg) = self.code_msg();
        Response::Error(CniErrorResponse {
            cni_version,
            code,
            msg,
            details: self.to_string(),
        })
    }
}
