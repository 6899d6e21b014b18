//! In-band control protocol: fixed string prefixes carried in the frame
//! payload, classified before anything is handed to the dispatch core.

use serde::{Deserialize, Serialize};

use crate::identity::ClientInfo;

pub const CLTHELLO: &str = "$CLTHELLO$";
pub const CLTCONN: &str = "$CLTCONN$";
pub const CLTDISCONN: &str = "$CLTDISCONN$";
pub const CHNAME: &str = "$CHNAME$";
pub const CHGROUP: &str = "$CHGROUP$";
pub const GETCLT: &str = "$GETCLT$";
pub const KEEPALIVE: &str = "$KEEPALIVE$";
pub const KEEPACK: &str = "$KEEPACK$";
pub const DISCONN: &str = "$DISCONN$";
pub const USRCLOSE: &str = "$USRCLOSE$";
pub const CMD: &str = "$CMD$";
pub const MSG: &str = "$MSG$";
pub const NOEXIST: &str = "$NOEXIST$";

#[derive(Debug, Serialize, Deserialize)]
struct HelloPayload {
    name: Option<String>,
    group: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LookupMiss {
    traceback: String,
}

/// The response to an in-band `$GETCLT$` lookup. Unlike every other S→C
/// message this one carries no fixed prefix — it's bare JSON — so callers
/// classify it with [`try_parse_lookup_reply`] only after [`classify`] has
/// already failed to match anything else.
#[derive(Debug, Clone, PartialEq)]
pub enum LookupReply {
    Found(ClientInfo),
    Miss,
}

/// Try to parse a payload as a `$GETCLT$` reply. Returns `None` if it
/// doesn't parse as either shape, so callers can fall back to treating the
/// frame as a protocol violation.
pub fn try_parse_lookup_reply(payload: &[u8]) -> Option<LookupReply> {
    if let Ok(info) = serde_json::from_slice::<ClientInfo>(payload) {
        return Some(LookupReply::Found(info));
    }
    if let Ok(miss) = serde_json::from_slice::<LookupMiss>(payload) {
        if miss.traceback == NOEXIST {
            return Some(LookupReply::Miss);
        }
    }
    None
}

/// A classified inbound frame payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Control {
    ClientHello { name: Option<String>, group: Option<String> },
    ClientConnect(ClientInfo),
    ClientDisconnect(ClientInfo),
    /// Empty string restores the name/group remembered at handshake.
    ChangeName(String),
    ChangeGroup(String),
    GetClient(String),
    Keepalive,
    KeepAck,
    Disconnect,
    UserClose,
    Command { command: String, message: Vec<u8> },
}

/// Error classifying or parsing an in-band control payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlError(pub String);

impl std::fmt::Display for ControlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ControlError {}

/// Classify a raw frame payload into a [`Control`] value.
///
/// A payload that matches none of the fixed prefixes and does not parse as
/// `$CMD$<command>$MSG$<content>` is a protocol violation ([`ControlError`]).
pub fn classify(payload: &[u8]) -> Result<Control, ControlError> {
    if let Some(rest) = strip_prefix(payload, CLTHELLO) {
        let parsed: HelloPayload = serde_json::from_slice(rest)
            .map_err(|e| ControlError(format!("bad $CLTHELLO$ payload: {e}")))?;
        return Ok(Control::ClientHello {
            name: parsed.name,
            group: parsed.group,
        });
    }
    if let Some(rest) = strip_prefix(payload, CLTCONN) {
        let info: ClientInfo = serde_json::from_slice(rest)
            .map_err(|e| ControlError(format!("bad $CLTCONN$ payload: {e}")))?;
        return Ok(Control::ClientConnect(info));
    }
    if let Some(rest) = strip_prefix(payload, CLTDISCONN) {
        let info: ClientInfo = serde_json::from_slice(rest)
            .map_err(|e| ControlError(format!("bad $CLTDISCONN$ payload: {e}")))?;
        return Ok(Control::ClientDisconnect(info));
    }
    if let Some(rest) = strip_prefix(payload, CHNAME) {
        return Ok(Control::ChangeName(String::from_utf8_lossy(rest).into_owned()));
    }
    if let Some(rest) = strip_prefix(payload, CHGROUP) {
        return Ok(Control::ChangeGroup(String::from_utf8_lossy(rest).into_owned()));
    }
    if let Some(rest) = strip_prefix(payload, GETCLT) {
        return Ok(Control::GetClient(String::from_utf8_lossy(rest).into_owned()));
    }
    if payload == KEEPALIVE.as_bytes() {
        return Ok(Control::Keepalive);
    }
    if payload == KEEPACK.as_bytes() {
        return Ok(Control::KeepAck);
    }
    if payload == DISCONN.as_bytes() {
        return Ok(Control::Disconnect);
    }
    if payload == USRCLOSE.as_bytes() {
        return Ok(Control::UserClose);
    }
    if let Some((command, message)) = parse_command(payload) {
        return Ok(Control::Command { command, message });
    }

    Err(ControlError(format!(
        "payload matched no known control prefix or $CMD$...$MSG$... envelope ({} bytes)",
        payload.len()
    )))
}

fn strip_prefix<'a>(payload: &'a [u8], prefix: &str) -> Option<&'a [u8]> {
    payload.strip_prefix(prefix.as_bytes())
}

fn parse_command(payload: &[u8]) -> Option<(String, Vec<u8>)> {
    let rest = payload.strip_prefix(CMD.as_bytes())?;
    let msg_bytes = MSG.as_bytes();
    let split_at = rest
        .windows(msg_bytes.len())
        .position(|window| window == msg_bytes)?;
    let command = String::from_utf8(rest[..split_at].to_vec()).ok()?;
    let message = rest[split_at + msg_bytes.len()..].to_vec();
    Some((command, message))
}

pub fn build_hello(name: Option<&str>, group: Option<&str>) -> Vec<u8> {
    build(
        CLTHELLO,
        &HelloPayload {
            name: name.map(String::from),
            group: group.map(String::from),
        },
    )
}

pub fn build_client_connect(info: &ClientInfo) -> Vec<u8> {
    build(CLTCONN, info)
}

pub fn build_client_disconnect(info: &ClientInfo) -> Vec<u8> {
    build(CLTDISCONN, info)
}

pub fn build_change_name(name: &str) -> Vec<u8> {
    concat(CHNAME, name.as_bytes())
}

pub fn build_change_group(group: &str) -> Vec<u8> {
    concat(CHGROUP, group.as_bytes())
}

pub fn build_get_client(identifier: &str) -> Vec<u8> {
    concat(GETCLT, identifier.as_bytes())
}

pub fn build_client_info_reply(info: &ClientInfo) -> Vec<u8> {
    serde_json::to_vec(info).expect("ClientInfo serialization cannot fail")
}

pub fn build_lookup_miss() -> Vec<u8> {
    serde_json::to_vec(&LookupMiss {
        traceback: NOEXIST.to_string(),
    })
    .expect("LookupMiss serialization cannot fail")
}

pub fn build_keepalive() -> Vec<u8> {
    KEEPALIVE.as_bytes().to_vec()
}

pub fn build_keepack() -> Vec<u8> {
    KEEPACK.as_bytes().to_vec()
}

pub fn build_disconnect() -> Vec<u8> {
    DISCONN.as_bytes().to_vec()
}

pub fn build_user_close() -> Vec<u8> {
    USRCLOSE.as_bytes().to_vec()
}

pub fn build_command(command: &str, message: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(CMD.len() + command.len() + MSG.len() + message.len());
    out.extend_from_slice(CMD.as_bytes());
    out.extend_from_slice(command.as_bytes());
    out.extend_from_slice(MSG.as_bytes());
    out.extend_from_slice(message);
    out
}

fn build(prefix: &str, value: &impl Serialize) -> Vec<u8> {
    let json = serde_json::to_vec(value).expect("control payload serialization cannot fail");
    concat(prefix, &json)
}

fn concat(prefix: &str, rest: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(prefix.len() + rest.len());
    out.extend_from_slice(prefix.as_bytes());
    out.extend_from_slice(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Address;

    fn sample_info() -> ClientInfo {
        ClientInfo {
            address: Address {
                host: "127.0.0.1".to_string(),
                port: 5001,
            },
            name: Some("Alice".to_string()),
            group: Some("g1".to_string()),
        }
    }

    #[test]
    fn hello_roundtrip() {
        let payload = build_hello(Some("Alice"), Some("g1"));
        match classify(&payload).unwrap() {
            Control::ClientHello { name, group } => {
                assert_eq!(name.as_deref(), Some("Alice"));
                assert_eq!(group.as_deref(), Some("g1"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn client_connect_roundtrip() {
        let payload = build_client_connect(&sample_info());
        match classify(&payload).unwrap() {
            Control::ClientConnect(info) => assert_eq!(info, sample_info()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn command_roundtrip() {
        let payload = build_command("announce", b"hello");
        match classify(&payload).unwrap() {
            Control::Command { command, message } => {
                assert_eq!(command, "announce");
                assert_eq!(message, b"hello");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn command_with_empty_message() {
        let payload = build_command("ping", b"");
        match classify(&payload).unwrap() {
            Control::Command { command, message } => {
                assert_eq!(command, "ping");
                assert!(message.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn fixed_prefixes_roundtrip() {
        assert_eq!(classify(&build_keepalive()).unwrap(), Control::Keepalive);
        assert_eq!(classify(&build_keepack()).unwrap(), Control::KeepAck);
        assert_eq!(classify(&build_disconnect()).unwrap(), Control::Disconnect);
        assert_eq!(classify(&build_user_close()).unwrap(), Control::UserClose);
    }

    #[test]
    fn garbage_payload_is_an_error() {
        assert!(classify(b"not a recognized payload at all").is_err());
    }

    #[test]
    fn change_name_empty_means_restore() {
        let payload = build_change_name("");
        assert_eq!(classify(&payload).unwrap(), Control::ChangeName(String::new()));
    }

    #[test]
    fn lookup_reply_roundtrip() {
        let found = build_client_info_reply(&sample_info());
        assert_eq!(
            try_parse_lookup_reply(&found),
            Some(LookupReply::Found(sample_info()))
        );

        let miss = build_lookup_miss();
        assert_eq!(try_parse_lookup_reply(&miss), Some(LookupReply::Miss));

        assert_eq!(try_parse_lookup_reply(b"not json at all"), None);
    }
}
