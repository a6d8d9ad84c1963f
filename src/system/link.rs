//! Downstream interface control through iproute2.

use std::net::Ipv4Addr;

use async_trait::async_trait;

use super::command;
use super::{InterfaceConfig, InterfaceControl};
use crate::error::{NetShareError, Result};

/// [`InterfaceControl`] backed by the `ip` command.
#[derive(Debug, Default, Clone)]
pub struct IpLink;

impl IpLink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl InterfaceControl for IpLink {
    async fn set_interface_up(&self, name: &str) -> Result<()> {
        command::run("ip", &["link", "set", "dev", name, "up"]).await?;
        Ok(())
    }

    async fn set_interface_down(&self, name: &str) -> Result<()> {
        command::run("ip", &["link", "set", "dev", name, "down"]).await?;
        Ok(())
    }

    async fn get_interface_config(&self, name: &str) -> Result<InterfaceConfig> {
        let link = command::run("ip", &["-o", "link", "show", "dev", name]).await?;
        let addr = command::run("ip", &["-o", "-4", "addr", "show", "dev", name]).await?;
        parse_interface_config(name, &link, &addr)
    }
}

/// Build an [`InterfaceConfig`] from `ip -o link show` and `ip -o -4 addr show`.
fn parse_interface_config(name: &str, link_output: &str, addr_output: &str) -> Result<InterfaceConfig> {
    let is_up = link_output
        .lines()
        .filter_map(parse_link_line)
        .find(|(iface, _)| iface == name)
        .map(|(_, up)| up)
        .ok_or_else(|| NetShareError::ParseError(format!("no link entry for {}", name)))?;

    let address = parse_ipv4(addr_output);

    Ok(InterfaceConfig {
        name: name.to_string(),
        ipv4_address: address.map(|(ip, _)| ip),
        prefix_len: address.map(|(_, prefix)| prefix),
        is_up,
    })
}

/// Parse one `ip -o link` line into (name, admin up).
///
/// Format: `5: wlan1: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc ...`
fn parse_link_line(line: &str) -> Option<(String, bool)> {
    let mut fields = line.splitn(3, ": ");
    fields.next()?;
    let name = fields.next()?.trim();
    // veth pairs show up as "veth0@if3"
    let name = name.split('@').next().unwrap_or(name).to_string();

    let rest = fields.next()?;
    let flags = rest.strip_prefix('<')?.split('>').next()?;
    let is_up = flags.split(',').any(|flag| flag == "UP");

    Some((name, is_up))
}

/// First IPv4 address with prefix from `ip -o -4 addr` output.
///
/// Format: `5: wlan1    inet 192.168.43.1/24 brd 192.168.43.255 scope global wlan1`
fn parse_ipv4(output: &str) -> Option<(Ipv4Addr, u8)> {
    output.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        parts.find(|p| *p == "inet")?;
        let (ip, prefix) = parts.next()?.split_once('/')?;
        Some((ip.parse().ok()?, prefix.parse().ok()?))
    })
}
