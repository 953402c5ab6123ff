use std::fmt;
use std::path::PathBuf;
use std::process::Command;

use tokio::sync::oneshot;
use tracing::debug;

use crate::kernel::Netlink;
use crate::{Error, Result};

/// A network namespace kernel operations are issued in.
///
/// Work for a namespace other than the daemon's own runs on a dedicated OS
/// thread that enters the namespace and exits afterwards, so no pooled thread
/// is ever left in a foreign namespace. Sockets and child processes created on
/// that thread stay bound to the namespace.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum NetNs {
    #[default]
    Host,
    Path(PathBuf),
}

impl fmt::Display for NetNs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetNs::Host => write!(f, "host"),
            NetNs::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

impl NetNs {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        NetNs::Path(path.into())
    }

    /// Runs `f` inside the namespace.
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        match self {
            NetNs::Host => tokio::task::spawn_blocking(f)
                .await
                .map_err(|e| Error::Task(e.to_string()))?,
            NetNs::Path(path) => {
                let path = path.clone();
                let runtime = tokio::runtime::Handle::current();
                let (tx, rx) = oneshot::channel();
                std::thread::Builder::new()
                    .name("pona-netns".into())
                    .spawn(move || {
                        // sockets opened here register with the daemon's reactor
                        let _guard = runtime.enter();
                        let res = netns_rs::get_from_path(&path)
                            .map_err(Error::from)
                            .and_then(|netns| {
                                netns.enter()?;
                                f()
                            });
                        let _ = tx.send(res);
                    })?;
                rx.await
                    .map_err(|_| Error::Task("netns worker exited without result".into()))?
            }
        }
    }

    /// Opens an rtnetlink connection bound to the namespace.
    pub async fn netlink(&self) -> Result<Netlink> {
        self.run(|| {
            let (conn, handle, _) = rtnetlink::new_connection()?;
            let task = tokio::spawn(conn);
            Ok(Netlink::new(handle, task))
        })
        .await
    }

    /// Runs a command to completion, failing on a non-zero exit. Returns stdout.
    pub async fn exec(&self, program: &str, args: &[String]) -> Result<String> {
        let program = program.to_owned();
        let args = args.to_vec();
        self.run(move || {
            debug!("exec {} {}", program, args.join(" "));
            let out = Command::new(&program).args(&args).output()?;
            if !out.status.success() {
                return Err(Error::Command {
                    program,
                    args,
                    status: out.status,
                    stderr: String::from_utf8_lossy(&out.stderr).trim().to_owned(),
                });
            }
            Ok(String::from_utf8_lossy(&out.stdout).into_owned())
        })
        .await
    }

    /// Runs a command used as a predicate: exit 0 is true, exit 1 is false and
    /// anything else is an error.
    pub async fn test(&self, program: &str, args: &[String]) -> Result<bool> {
        let program = program.to_owned();
        let args = args.to_vec();
        self.run(move || {
            let out = Command::new(&program).args(&args).output()?;
            match out.status.code() {
                Some(0) => Ok(true),
                Some(1) => Ok(false),
                _ => Err(Error::Command {
                    program,
                    args,
                    status: out.status,
                    stderr: String::from_utf8_lossy(&out.stderr).trim().to_owned(),
                }),
            }
        })
        .await
    }

    /// Writes `value` to the sysctl `key` given in dotted form.
    pub async fn sysctl(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_owned();
        let value = value.to_owned();
        self.run(move || {
            let path = sysctl_path(&key);
            std::fs::write(&path, value.as_bytes()).map_err(|source| Error::Sysctl {
                key: key.clone(),
                source,
            })
        })
        .await
    }
}

fn sysctl_path(key: &str) -> PathBuf {
    let mut path = PathBuf::from("/proc/sys");
    path.extend(key.split('.'));
    path
}

/// Loads a kernel module. Modules are global, so this always runs on the host.
pub async fn modprobe(module: &str) -> Result<()> {
    NetNs::Host
        .exec("/sbin/modprobe", &[module.to_owned()])
        .await
        .map(|_| ())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sysctl_path() {
        assert_eq!(
            sysctl_path("net.ipv4.conf.all.rp_filter"),
            PathBuf::from("/proc/sys/net/ipv4/conf/all/rp_filter")
        );
    }

    #[tokio::test]
    async fn test_exec_host() -> Result<()> {
        let out = NetNs::Host.exec("echo", &["pona".into()]).await?;
        assert_eq!(out.trim(), "pona");
        Ok(())
    }

    #[tokio::test]
    async fn test_exec_failure_is_command_error() {
        let err = NetNs::Host.exec("false", &[]).await.unwrap_err();
        assert!(matches!(err, Error::Command { .. }));
    }

    #[tokio::test]
    async fn test_predicate() -> Result<()> {
        assert!(NetNs::Host.test("true", &[]).await?);
        assert!(!NetNs::Host.test("false", &[]).await?);
        Ok(())
    }
}
