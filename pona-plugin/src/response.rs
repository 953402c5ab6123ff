use std::io::Write;
use std::process::ExitCode;

use semver::Version;
use serde::Serialize;
use tracing::error;

/// What the plugin prints on stdout before exiting.
#[derive(Debug)]
pub enum Response {
    /// A CNI result, already serialized.
    Result(Vec<u8>),
    Error(CniErrorResponse),
    Version(VersionResponse),
    Empty,
}

impl Response {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Response::Result(result) => Ok(result.clone()),
            Response::Error(err) => serde_json::to_vec(err),
            Response::Version(version) => serde_json::to_vec(version),
            Response::Empty => Ok(vec![]),
        }
    }

    pub fn write_out(self) -> ExitCode {
        let code = match &self {
            Response::Error(_) => ExitCode::FAILURE,
            _ => ExitCode::SUCCESS,
        };
        let out = match self.to_bytes() {
            Ok(out) => out,
            Err(e) => {
                error!(%e, "failed to serialize response");
                return ExitCode::FAILURE;
            }
        };
        if let Err(e) = std::io::stdout().write_all(&out) {
            error!(%e, "failed to write response to stdout");
            return ExitCode::FAILURE;
        }
        code
    }
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct VersionResponse {
    #[serde(serialize_with = "crate::serialize_to_string")]
    pub cni_version: Version,
    #[serde(serialize_with = "crate::serialize_to_string_slice")]
    pub supported_versions: Vec<Version>,
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CniErrorResponse {
    #[serde(serialize_with = "crate::serialize_to_string")]
    pub cni_version: Version,
    pub code: u32,
    pub msg: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
}
