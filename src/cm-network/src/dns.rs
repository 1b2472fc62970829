//! Hosts-file + PID-file/SIGHUP reload (spec.md §4.3), ported from
//! `dnsserver.cpp`: an append-only in-memory hosts map is written as a plain
//! `IP<TAB>name [name ...]` file and the sidecar resolver is told to reread
//! it by sending `SIGHUP` to the PID recorded in a PID file alongside it.

use std::collections::HashMap;
use std::path::PathBuf;

use cm_ore::error::CmError;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

const HOSTS_FILE_NAME: &str = "addnhosts";
const PID_FILE_NAME: &str = "pidfile";

pub struct DnsController {
    storage_path: PathBuf,
    ip: String,
    hosts: tokio::sync::Mutex<HashMap<String, Vec<String>>>,
}

impl DnsController {
    pub fn new(storage_path: impl Into<PathBuf>, ip: impl Into<String>) -> Self {
        DnsController { storage_path: storage_path.into(), ip: ip.into(), hosts: tokio::sync::Mutex::new(HashMap::new()) }
    }

    /// The DNS controller's own address, handed out to instances as their
    /// resolver (spec.md §4.4 `PrepareInstanceNetworkParameters`).
    pub fn ip(&self) -> &str {
        &self.ip
    }

    /// Appends `hostnames` under `ip`, failing if any of them is already
    /// registered against a different IP (spec.md §4.4 "hostname collision
    /// fails with AlreadyExists"). A hostname already registered against
    /// this exact `ip` is a no-op rather than a collision, so callers that
    /// re-prepare an already-persisted instance (e.g. on restart) can call
    /// this idempotently.
    pub async fn add_hosts(&self, ip: &str, hostnames: &[String]) -> Result<(), CmError> {
        let mut hosts = self.hosts.lock().await;
        let mut to_add = Vec::new();
        for name in hostnames {
            match hosts.iter().find(|(_, names)| names.contains(name)) {
                Some((existing_ip, _)) if existing_ip == ip => {}
                Some(_) => return Err(CmError::already_exists(format!("host already exists: {name}"))),
                None => to_add.push(name.clone()),
            }
        }
        hosts.entry(ip.to_string()).or_default().extend(to_add);
        Ok(())
    }

    pub async fn remove_hosts_for_ip(&self, ip: &str) {
        self.hosts.lock().await.remove(ip);
    }

    /// Writes the hosts file atomically (temp file + rename), then signals
    /// the resolver via PID file + `SIGHUP`. A write failure aborts before
    /// any signal is sent; a signal failure is reported but the file write
    /// already happened and is not rolled back (matches the original).
    pub async fn reload(&self) -> Result<(), CmError> {
        let hosts = self.hosts.lock().await;
        let mut contents = String::new();
        for (ip, names) in hosts.iter() {
            contents.push_str(ip);
            for name in names {
                contents.push('\t');
                contents.push_str(name);
            }
            contents.push('\n');
        }
        drop(hosts);

        let hosts_path = self.storage_path.join(HOSTS_FILE_NAME);
        let tmp_path = self.storage_path.join(format!("{HOSTS_FILE_NAME}.tmp"));
        tokio::fs::write(&tmp_path, contents).await.map_err(|e| CmError::internal(format!("failed to write hosts file: {e}")))?;
        tokio::fs::rename(&tmp_path, &hosts_path).await.map_err(|e| CmError::internal(format!("failed to replace hosts file: {e}")))?;

        self.signal_reload().await
    }

    async fn signal_reload(&self) -> Result<(), CmError> {
        let pid_path = self.storage_path.join(PID_FILE_NAME);
        let pid_content = tokio::fs::read_to_string(&pid_path).await.map_err(|e| CmError::unavailable(format!("failed to open PID file: {e}")))?;
        let pid: i32 = pid_content.trim().parse().map_err(|_| CmError::unavailable(format!("invalid PID format: {}", pid_content.trim())))?;

        signal::kill(Pid::from_raw(pid), Signal::SIGHUP).map_err(|e| CmError::unavailable(format!("failed to send SIGHUP: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rejects_duplicate_hostnames() {
        let dir = tempfile_dir();
        let dns = DnsController::new(&dir, "10.0.0.1");
        dns.add_hosts("10.0.0.2", &["0.a.item".to_string()]).await.unwrap();
        let err = dns.add_hosts("10.0.0.3", &["0.a.item".to_string()]).await.unwrap_err();
        assert_eq!(err.kind(), cm_ore::ErrorKind::AlreadyExists);
    }

    #[tokio::test]
    async fn reload_writes_a_tab_separated_hosts_file() {
        let dir = tempfile_dir();
        let dns = DnsController::new(&dir, "10.0.0.1");
        dns.add_hosts("10.0.0.2", &["a.b.c".to_string(), "d.e.f".to_string()]).await.unwrap();

        // No PID file: the write must succeed even though the signal step fails.
        let err = dns.reload().await.unwrap_err();
        assert_eq!(err.kind(), cm_ore::ErrorKind::Unavailable);

        let contents = tokio::fs::read_to_string(dir.join(HOSTS_FILE_NAME)).await.unwrap();
        assert_eq!(contents, "10.0.0.2\ta.b.c\td.e.f\n");
    }

    fn tempfile_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("cm-dns-test-{}-{}", std::process::id(), rand::random::<u64>()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
