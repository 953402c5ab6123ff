use std::ffi::OsStr;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use pona_plugin::config::{Config, PluginConfig};
use serde_json::Value;
use tracing::info;

use crate::Result;
use crate::config::AgentArgs;

const PLUGIN_PATH: &str = "./pona";
const PLUGIN_NAME: &str = "pona";
const CONFLIST_NAME: &str = "05-pona.conflist";

pub fn ensure_cni_preconditions(args: &AgentArgs) -> Result<()> {
    ensure_cni_log_dir(&args.cni_plugin_log_dir)?;
    if args.skip_cni_install {
        info!("skipping cni installation");
        return Ok(());
    }
    ensure_cni_bin(&args.cni_bin_dir)?;
    let existing = get_existing_conf(&args.cni_conf_dir)?;
    let conflist = update_cni_conf(&existing, &args.socket)?;
    ensure_cni_conf(&args.cni_conf_dir, &conflist)?;
    Ok(())
}

fn ensure_cni_log_dir(dst: impl AsRef<Path>) -> Result<()> {
    info!("creating cni plugin log directory");
    fs::create_dir_all(dst).map_err(|e| e.into())
}

fn ensure_cni_conf(cni_conf_dir: impl AsRef<Path>, conflist: &[u8]) -> Result<()> {
    info!("writing cni configuration");
    let path = cni_conf_dir.as_ref().join(CONFLIST_NAME);
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(conflist)?;
    Ok(())
}

/// Network configuration found in the conf dir, other than our own.
#[derive(Debug, PartialEq)]
enum ExistingConf {
    List(Vec<u8>),
    Single(Vec<u8>),
}

// Returns the first conflist if found, then checks for conf
fn get_existing_conf(cni_conf_dir: impl AsRef<Path>) -> Result<ExistingConf> {
    let mut files: Vec<PathBuf> = fs::read_dir(cni_conf_dir)?
        .filter_map(|f| f.ok())
        .filter(|f| f.file_name() != CONFLIST_NAME)
        .map(|f| f.path())
        .collect();
    files.sort();

    let with_ext = |ext: &str| {
        files
            .iter()
            .find(|p| p.extension() == Some(OsStr::new(ext)))
            .cloned()
    };

    if let Some(conflist) = with_ext("conflist") {
        info!(path = %conflist.display(), "found existing conflist");
        return Ok(ExistingConf::List(fs::read(conflist)?));
    }
    if let Some(conf) = with_ext("conf") {
        info!(path = %conf.display(), "found existing conf");
        return Ok(ExistingConf::Single(fs::read(conf)?));
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "existing conflist/conf file not found".to_string(),
    )
    .into())
}

fn ensure_cni_bin(dst: impl AsRef<Path>) -> Result<()> {
    info!("copying plugin to cni bin");
    let path = dst.as_ref().join(PLUGIN_NAME);
    fs::copy(PLUGIN_PATH, &path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

fn pona_plugin(socket: &Path) -> PluginConfig {
    PluginConfig {
        r#type: PLUGIN_NAME.into(),
        options: [(
            "socket".to_owned(),
            Value::String(socket.display().to_string()),
        )]
        .into_iter()
        .collect(),
    }
}

// chains pona after the plugins of the existing configuration
fn update_cni_conf(existing: &ExistingConf, socket: &Path) -> Result<Vec<u8>> {
    let mut conf: Config = match existing {
        ExistingConf::List(bytes) => serde_json::from_slice(bytes)?,
        ExistingConf::Single(bytes) => {
            let mut conf: Config = serde_json::from_slice(bytes)?;
            let mut plugin: PluginConfig = serde_json::from_slice(bytes)?;
            plugin.options.remove("cniVersion");
            plugin.options.remove("name");
            conf.plugins = vec![plugin];
            conf
        }
    };
    conf.plugins.retain(|p| p.r#type != PLUGIN_NAME);
    conf.plugins.push(pona_plugin(socket));

    serde_json::to_vec_pretty(&conf).map_err(|e| e.into())
}

#[cfg(test)]
mod test {
    use super::*;

    const SOCKET: &str = "/run/ponad.sock";

    fn plugin_types(conflist: &[u8]) -> Vec<String> {
        let conf: Value = serde_json::from_slice(conflist).unwrap();
        conf["plugins"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p["type"].as_str().unwrap().to_owned())
            .collect()
    }

    #[test]
    fn test_update_conflist_appends_plugin() -> Result<()> {
        let existing = br#"{
            "cniVersion": "1.0.0",
            "name": "k8s-pod-network",
            "plugins": [{"type": "ptp", "ipam": {"type": "host-local"}}, {"type": "portmap"}]
        }"#;
        let out = update_cni_conf(&ExistingConf::List(existing.to_vec()), Path::new(SOCKET))?;
        assert_eq!(plugin_types(&out), vec!["ptp", "portmap", "pona"]);

        let conf: Value = serde_json::from_slice(&out)?;
        assert_eq!(conf["plugins"][2]["socket"], SOCKET);
        assert_eq!(conf["plugins"][0]["ipam"]["type"], "host-local");
        assert_eq!(conf["name"], "k8s-pod-network");

        // installing twice does not chain pona twice
        let again = update_cni_conf(&ExistingConf::List(out), Path::new(SOCKET))?;
        assert_eq!(plugin_types(&again), vec!["ptp", "portmap", "pona"]);
        Ok(())
    }

    #[test]
    fn test_update_conf_wraps_single_plugin() -> Result<()> {
        let existing = br#"{"cniVersion": "0.4.0", "name": "bridge-net", "type": "bridge", "bridge": "cni0"}"#;
        let out = update_cni_conf(&ExistingConf::Single(existing.to_vec()), Path::new(SOCKET))?;
        assert_eq!(plugin_types(&out), vec!["bridge", "pona"]);

        let conf: Value = serde_json::from_slice(&out)?;
        assert_eq!(conf["cniVersion"], "0.4.0");
        assert_eq!(conf["plugins"][0]["bridge"], "cni0");
        assert!(conf["plugins"][0].get("name").is_none());
        Ok(())
    }

    #[test]
    fn test_existing_conf_prefers_conflist() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("pona-cni-conf-{}", std::process::id()));
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("10-bridge.conf"), b"conf")?;
        fs::write(dir.join("20-calico.conflist"), b"list")?;
        fs::write(dir.join(CONFLIST_NAME), b"ours")?;

        let existing = get_existing_conf(&dir)?;
        assert_eq!(existing, ExistingConf::List(b"list".to_vec()));

        fs::remove_file(dir.join("20-calico.conflist"))?;
        let existing = get_existing_conf(&dir)?;
        assert_eq!(existing, ExistingConf::Single(b"conf".to_vec()));

        fs::remove_dir_all(&dir)?;
        assert!(get_existing_conf(&dir).is_err());
        Ok(())
    }
}
