//! WAN interface discovery.

use std::{fs, path::Path};

/// Interfaces tried, in order, when the routing table has no default route.
pub const COMMON_WAN_INTERFACES: [&str; 5] = ["eth0", "eth1", "ppp0", "wan", "br-wan"];

/// Finds the interface carrying the IPv4 default route, falling back to the first common WAN
/// interface that is up.
pub fn detect_wan_interface() -> Option<String> {
    if let Some(iface) =
        fs::read_to_string("/proc/net/route").ok().as_deref().and_then(default_route_interface)
    {
        tracing::debug!(%iface, "WAN interface from default route");
        return Some(iface);
    }

    let iface = COMMON_WAN_INTERFACES
        .iter()
        .find(|iface| interface_is_up(Path::new("/sys/class/net"), iface))
        .map(|iface| iface.to_string());

    if let Some(iface) = &iface {
        tracing::debug!(%iface, "WAN interface from common names");
    }
    iface
}

/// Extracts the default-route interface from the contents of `/proc/net/route`.
///
/// ```
/// use qos_common::net::default_route_interface;
/// let table = "Iface\tDestination\tGateway\tFlags\n\
///              br-lan\t0000A8C0\t00000000\t0001\n\
///              pppoe-wan\t00000000\t0101A8C0\t0003\n";
/// assert_eq!(default_route_interface(table).as_deref(), Some("pppoe-wan"));
/// ```
pub fn default_route_interface(table: &str) -> Option<String> {
    table.lines().skip(1).find_map(|line| {
        let mut fields = line.split_whitespace();
        let iface = fields.next()?;
        let destination = fields.next()?;
        let _gateway = fields.next()?;
        let flags = u16::from_str_radix(fields.next()?, 16).ok()?;

        // RTF_UP
        (destination == "00000000" && flags & 0x1 == 0x1).then(|| iface.to_string())
    })
}

fn interface_is_up(sysfs: &Path, iface: &str) -> bool {
    fs::read_to_string(sysfs.join(iface).join("operstate"))
        .map(|state| state.trim() == "up")
        .unwrap_or(false)
}
