use std::collections::{BTreeMap, HashMap};

use clap::Parser;
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Invocation environment defined by the CNI runtime contract.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Possible values are ADD, DEL, CHECK, GC, STATUS, VERSION
    #[arg(long, env = "CNI_COMMAND", value_parser = parse_command)]
    pub command: Command,

    /// Container ID
    #[arg(long, env = "CNI_CONTAINERID", default_value = "")]
    pub container_id: String,

    /// Path to the network namespace
    #[arg(long, env = "CNI_NETNS", default_value = "")]
    pub net_ns: String,

    /// Name of the interface inside the container
    #[arg(long, env = "CNI_IFNAME", default_value = "")]
    pub ifname: String,

    /// Key-value pairs separated by semi-colons
    #[arg(long, env = "CNI_ARGS", default_value = "", value_parser = parse_key_value)]
    pub args: BTreeMap<String, String>,

    /// List of paths to search for plugins
    #[arg(long, env = "CNI_PATH", default_value = "")]
    pub paths: String,
}

fn parse_key_value(s: &str) -> Result<BTreeMap<String, String>> {
    let mut kv = BTreeMap::new();

    if s.is_empty() {
        return Ok(kv);
    };

    for split in s.split(';') {
        match split.split_once('=') {
            Some((k, v)) => {
                kv.insert(k.to_owned(), v.to_owned());
            }
            None if split.is_empty() => {}
            None => {
                return Err(Error::InvalidRequiredEnvVariables(format!(
                    "CNI_ARGS item {split} is not a key=value pair"
                )));
            }
        }
    }

    Ok(kv)
}

fn parse_command(s: &str) -> Result<Command> {
    let cmd = match s {
        "ADD" => Command::Add,
        "DEL" => Command::Delete,
        "CHECK" => Command::Check,
        "STATUS" => Command::Status,
        "VERSION" => Command::Version,
        "GC" => Command::Gc,
        _ => return Err(Error::Parse(format!("command {s} not supported"))),
    };
    Ok(cmd)
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Add,
    Delete,
    Check,
    Status,
    Version,
    Gc,
}

/// Network configuration list, as found in the CNI configuration directory.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(
        serialize_with = "crate::serialize_to_string",
        deserialize_with = "crate::deserialize_from_str"
    )]
    /// cni version
    pub cni_version: Version,
    #[serde(
        serialize_with = "crate::serialize_to_string_slice",
        deserialize_with = "crate::deserialize_from_str_vec",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    /// supported cni versions
    pub cni_versions: Vec<Version>,

    /// Name of the config
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Disable the Check command
    pub disable_check: Option<bool>,

    #[serde(default, rename = "disableGC", skip_serializing_if = "Option::is_none")]
    /// Disable the GC command
    pub disable_gc: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_only_inlined_plugins: Option<bool>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    /// List of chained plugins
    pub plugins: Vec<PluginConfig>,
}

/// https://www.cni.dev/docs/spec/#plugin-configuration-objects
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    /// Matches the name of the CNI plugin binary on disk.
    pub r#type: String,

    #[serde(flatten)]
    pub options: HashMap<String, Value>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        let kv = parse_key_value(
            "IgnoreUnknown=1;K8S_POD_NAMESPACE=app;K8S_POD_NAME=client;K8S_POD_INFRA_CONTAINER_ID=c0ffee",
        )
        .unwrap();
        assert_eq!(kv.get("K8S_POD_NAMESPACE").map(String::as_str), Some("app"));
        assert_eq!(kv.get("K8S_POD_NAME").map(String::as_str), Some("client"));
        assert_eq!(kv.len(), 4);

        assert!(parse_key_value("").unwrap().is_empty());
        assert!(parse_key_value("K8S_POD_NAME").is_err());
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("ADD").unwrap(), Command::Add);
        assert_eq!(parse_command("DEL").unwrap(), Command::Delete);
        assert!(parse_command("add").is_err());
    }

    #[test]
    fn test_version_args_need_no_container() {
        let args = Args::try_parse_from(["pona", "--command", "VERSION"]).unwrap();
        assert_eq!(args.command, Command::Version);
        assert!(args.container_id.is_empty());
        assert!(args.args.is_empty());
    }
}
