// ABOUTME: Host identity reported to the server
// ABOUTME: MAC address, host name and the stable client id for the Hello message

use crate::config::ClientSettings;
use crate::protocol::messages::Hello;
use std::path::{Path, PathBuf};

/// Reported when the MAC of the connection interface is unknown
pub const UNKNOWN_MAC: &str = "00:00:00:00:00:00";

/// MACs shared by many hosts; never used as a client id
const PLACEHOLDER_MACS: [&str; 3] = [UNKNOWN_MAC, "02:00:00:00:00:00", "ac:de:48:00:11:22"];

const SYS_CLASS_NET: &str = "/sys/class/net";

const IFF_LOOPBACK: u32 = 0x8;

/// Name of this host
///
/// Falls back to `HOSTNAME` and finally to the crate name.
pub fn host_name() -> String {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok().filter(|name| !name.is_empty()))
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string())
}

/// Hardware address of the first non-loopback network interface
pub fn mac_address() -> Option<String> {
    mac_address_in(Path::new(SYS_CLASS_NET))
}

fn mac_address_in(root: &Path) -> Option<String> {
    let mut interfaces: Vec<PathBuf> = std::fs::read_dir(root)
        .ok()?
        .filter_map(|entry| entry.ok().map(|entry| entry.path()))
        .collect();
    interfaces.sort();

    interfaces
        .iter()
        .filter(|interface| !is_loopback(interface))
        .find_map(|interface| read_mac(interface))
}

fn is_loopback(interface: &Path) -> bool {
    std::fs::read_to_string(interface.join("flags"))
        .ok()
        .and_then(|flags| u32::from_str_radix(flags.trim().trim_start_matches("0x"), 16).ok())
        .is_some_and(|flags| flags & IFF_LOOPBACK != 0)
}

fn read_mac(interface: &Path) -> Option<String> {
    let mac = std::fs::read_to_string(interface.join("address")).ok()?;
    let mac = mac.trim().to_ascii_lowercase();
    let well_formed = mac.len() == 17 && mac.as_bytes()[2] == b':';
    (well_formed && !PLACEHOLDER_MACS.contains(&mac.as_str())).then_some(mac)
}

/// Client id derived from `mac`; the host name when the MAC is missing or a placeholder
pub fn host_id(mac: &str) -> String {
    let mac = mac.trim();
    if mac.is_empty() || PLACEHOLDER_MACS.contains(&mac) {
        host_name()
    } else {
        mac.to_string()
    }
}

/// Build the Hello sent at the start of every connection
///
/// An empty `host_id` in `settings` is derived from `mac`.
pub fn hello(settings: &ClientSettings, mac: &str) -> Hello {
    let id = if settings.host_id.is_empty() {
        host_id(mac)
    } else {
        settings.host_id.clone()
    };
    Hello {
        mac: if mac.is_empty() { UNKNOWN_MAC } else { mac }.to_string(),
        host_name: host_name(),
        instance: settings.instance,
        id,
        ..Hello::default()
    }
}
