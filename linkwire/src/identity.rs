//! Address validation and the identity tracked for each connection.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An IPv4 socket address, kept as the dotted-quad string the wire protocol
/// and the in-band `$GETCLT$`/`$CLTHELLO$` payloads already use, rather
/// than `std::net::Ipv4Addr`, so `address_to_string`/`string_to_address`
/// round-trip exactly what peers send.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Per-connection identity, mutable only by the server in response to
/// in-band rename/regroup commands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub address: Address,
    pub name: Option<String>,
    pub group: Option<String>,
}

/// Failure validating an address or identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressError(pub String);

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for AddressError {}

/// Validate that `host` is four dotted-decimal octets in `0..=255`.
pub fn validate_ipv4(host: &str) -> Result<(), AddressError> {
    let octets: Vec<&str> = host.split('.').collect();
    if octets.len() != 4 {
        return Err(AddressError(format!("{host:?} is not a dotted-quad IPv4 address")));
    }
    for octet in octets {
        if octet.is_empty() || octet.len() > 3 || !octet.bytes().all(|b| b.is_ascii_digit()) {
            return Err(AddressError(format!("{host:?} is not a dotted-quad IPv4 address")));
        }
        let value: u16 = octet
            .parse()
            .map_err(|_| AddressError(format!("{host:?} is not a dotted-quad IPv4 address")))?;
        if value > 255 {
            return Err(AddressError(format!("octet {value} out of range in {host:?}")));
        }
    }
    Ok(())
}

/// Validate a full address: a valid IPv4 host and a port in `1..=65535`.
pub fn validate_address(host: &str, port: u16) -> Result<(), AddressError> {
    validate_ipv4(host)?;
    if port == 0 {
        return Err(AddressError("port must be in 1..=65535".to_string()));
    }
    Ok(())
}

pub fn address_to_string(addr: &Address) -> String {
    addr.to_string()
}

pub fn string_to_address(s: &str) -> Result<Address, AddressError> {
    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| AddressError(format!("{s:?} is not host:port")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| AddressError(format!("{s:?} has an invalid port")))?;
    validate_address(host, port)?;
    Ok(Address {
        host: host.to_string(),
        port,
    })
}
