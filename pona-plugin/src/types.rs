use semver::Version;
use serde::Deserialize;
use serde_json::value::RawValue;

pub const DEFAULT_SOCKET: &str = "/run/ponad.sock";

fn default_socket() -> String {
    DEFAULT_SOCKET.to_owned()
}

/// The plugin's network configuration read from stdin. Only the fields pona
/// needs are decoded; the raw bytes are forwarded to ponad as they are.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Input {
    #[serde(deserialize_with = "crate::deserialize_from_str")]
    pub cni_version: Version,

    #[serde(default)]
    pub name: String,

    /// Unix socket ponad listens on
    #[serde(default = "default_socket")]
    pub socket: String,

    #[serde(default, rename = "prevResult")]
    pub previous_result: Option<Box<RawValue>>,
}

impl Input {
    pub fn parse(stdin: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(stdin)?)
    }
}
