//! PUSH_REPLY parsing

use std::net::Ipv4Addr;

use crate::datapath::MAX_PEER_ID;
use crate::{Error, Result};

const PUSH_REPLY_PREFIX: &str = "PUSH_REPLY";

/// Settings pushed by the server once authenticated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushReply {
    pub address: Ipv4Addr,
    pub gateway_address: Ipv4Addr,
    pub dns_servers: Vec<Ipv4Addr>,
    pub auth_token: Option<String>,
    pub peer_id: Option<u32>,
}

impl PushReply {
    /// Parse a control message
    ///
    /// Returns `Ok(None)` for messages that aren't a PUSH_REPLY. A PUSH_REPLY
    /// without a usable `ifconfig` is malformed.
    pub fn parse(message: &str) -> Result<Option<Self>> {
        let Some(body) = message.strip_prefix(PUSH_REPLY_PREFIX) else {
            return Ok(None);
        };

        let mut ifconfig = None;
        let mut dns_servers = Vec::new();
        let mut auth_token = None;
        let mut peer_id = None;

        // options are comma separated, but some servers only use spaces
        let mut words = body
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|w| !w.is_empty());
        while let Some(word) = words.next() {
            match word {
                "ifconfig" => {
                    let address = parse_address(words.next(), "ifconfig address")?;
                    let gateway = parse_address(words.next(), "ifconfig gateway")?;
                    ifconfig = Some((address, gateway));
                }
                "dhcp-option" => {
                    if words.next() == Some("DNS") {
                        match words.next().map(str::parse::<Ipv4Addr>) {
                            Some(Ok(server)) => dns_servers.push(server),
                            _ => log::debug!("Skipping non-IPv4 DNS option"),
                        }
                    }
                }
                "auth-token" => {
                    auth_token = words.next().map(str::to_string);
                }
                "peer-id" => {
                    let raw = words.next().unwrap_or_default();
                    let id = raw
                        .parse::<u32>()
                        .ok()
                        .filter(|&id| id <= MAX_PEER_ID)
                        .ok_or_else(|| Error::MalformedPushReply(format!("bad peer-id '{}'", raw)))?;
                    peer_id = Some(id);
                }
                _ => {}
            }
        }

        let (address, gateway_address) =
            ifconfig.ok_or_else(|| Error::MalformedPushReply("missing ifconfig".into()))?;

        Ok(Some(Self {
            address,
            gateway_address,
            dns_servers,
            auth_token,
            peer_id,
        }))
    }
}

fn parse_address(word: Option<&str>, what: &str) -> Result<Ipv4Addr> {
    word.and_then(|w| w.parse().ok())
        .ok_or_else(|| Error::MalformedPushReply(format!("bad {}", what)))
}
