//! Address check containers use to reach the agent API.

use std::net::Ipv4Addr;

use nix::ifaddrs::getifaddrs;

use crate::error::AddrError;

/// `ip:port` built from the first IPv4 address of `iface`.
pub fn agent_addr(iface: &str, port: u16) -> Result<String, AddrError> {
    let ip = interface_ipv4(iface)?;
    Ok(format!("{ip}:{port}"))
}

fn interface_ipv4(iface: &str) -> Result<Ipv4Addr, AddrError> {
    let mut found = false;
    for ifaddr in getifaddrs()?.filter(|a| a.interface_name == iface) {
        found = true;
        if let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            return Ok(sin.ip());
        }
    }
    if found {
        Err(AddrError::NoIpv4 {
            name: iface.to_string(),
        })
    } else {
        Err(AddrError::InterfaceNotFound {
            name: iface.to_string(),
        })
    }
}
