//! # Network Link Monitor
//!
//! Polls `/sys/class/net/<iface>/flags` and publishes the interface's
//! up/down state on a watch channel. Only changes are published.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};

/// `IFF_UP` from `<net/if.h>`.
const IFF_UP: u32 = 0x1;

const DEFAULT_SYS_NET: &str = "/sys/class/net";

/// Reads the interface flags under `sys_net` and checks `IFF_UP`.
pub async fn read_interface_up(sys_net: &Path, interface: &str) -> SyncResult<bool> {
    let path = sys_net.join(interface).join("flags");
    let raw = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| SyncError::StorageFailed(format!("{}: {}", path.display(), e)))?;

    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let flags = u32::from_str_radix(digits, 16)
        .map_err(|e| SyncError::StorageFailed(format!("{}: bad flags {trimmed:?}: {e}", path.display())))?;

    Ok(flags & IFF_UP != 0)
}

/// Watches one interface.
#[derive(Debug, Clone)]
pub struct LinkMonitor {
    sys_net: PathBuf,
    interface: String,
    interval: Duration,
}

impl LinkMonitor {
    pub fn new(interface: impl Into<String>, interval: Duration) -> Self {
        LinkMonitor {
            sys_net: PathBuf::from(DEFAULT_SYS_NET),
            interface: interface.into(),
            interval,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.network.interface.clone(), config.link_poll_interval())
    }

    /// Reads flags from a different sysfs root.
    pub fn with_sys_root(mut self, sys_net: impl Into<PathBuf>) -> Self {
        self.sys_net = sys_net.into();
        self
    }

    /// Current state. An unreadable interface counts as down.
    pub async fn poll(&self) -> bool {
        match read_interface_up(&self.sys_net, &self.interface).await {
            Ok(up) => up,
            Err(e) => {
                debug!(interface = %self.interface, error = %e, "Cannot read link state");
                false
            }
        }
    }

    /// Spawns the poller. The first value is read before returning.
    pub async fn spawn(self) -> (watch::Receiver<bool>, JoinHandle<()>) {
        let initial = self.poll().await;
        info!(interface = %self.interface, up = initial, "Link monitor started");
        let (tx, rx) = watch::channel(initial);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let up = self.poll().await;
                let changed = tx.send_if_modified(|current| {
                    if *current == up {
                        false
                    } else {
                        *current = up;
                        true
                    }
                });
                if changed {
                    if up {
                        info!(interface = %self.interface, "Link up");
                    } else {
                        warn!(interface = %self.interface, "Link down");
                    }
                }
                if tx.is_closed() {
                    debug!("Link monitor stopping, no receivers");
                    break;
                }
            }
        });

        (rx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_flags(root: &Path, iface: &str, flags: &str) {
        let dir = root.join(iface);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("flags"), flags).unwrap();
    }

    #[tokio::test]
    async fn test_read_interface_flags() {
        let root = tempfile::tempdir().unwrap();
        write_flags(root.path(), "eth0", "0x1003\n");
        write_flags(root.path(), "wlan0", "0x1002\n");

        assert!(read_interface_up(root.path(), "eth0").await.unwrap());
        assert!(!read_interface_up(root.path(), "wlan0").await.unwrap());
        assert!(read_interface_up(root.path(), "missing").await.is_err());
    }

    #[tokio::test]
    async fn test_bad_flags_are_errors() {
        let root = tempfile::tempdir().unwrap();
        write_flags(root.path(), "eth0", "garbage");
        assert!(read_interface_up(root.path(), "eth0").await.is_err());
    }

    #[tokio::test]
    async fn test_unreadable_interface_counts_as_down() {
        let root = tempfile::tempdir().unwrap();
        let monitor = LinkMonitor::new("eth9", Duration::from_secs(30)).with_sys_root(root.path());
        assert!(!monitor.poll().await);

        let (rx, handle) = monitor.spawn().await;
        assert!(!*rx.borrow());
        handle.abort();
    }

    #[tokio::test]
    async fn test_monitor_publishes_changes() {
        let root = tempfile::tempdir().unwrap();
        write_flags(root.path(), "eth0", "0x1002");

        let monitor = LinkMonitor::new("eth0", Duration::from_millis(10)).with_sys_root(root.path());
        let (mut rx, handle) = monitor.spawn().await;
        assert!(!*rx.borrow());

        write_flags(root.path(), "eth0", "0x1003");
        tokio::time::timeout(Duration::from_secs(2), rx.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(*rx.borrow_and_update());

        handle.abort();
    }
}
