/// NTLMSSP message recognition.
///
/// Tokens are produced and consumed by an external security provider; this
/// module only looks at the fixed message header so the handshake can log
/// which of the three messages went over the wire:
///   Type 1 – Negotiate     (client → server)
///   Type 2 – Challenge     (server → client)
///   Type 3 – Authenticate  (client → server)

use std::fmt;

const NTLMSSP_SIGNATURE: &[u8; 8] = b"NTLMSSP\0";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Negotiate,
    Challenge,
    Authenticate,
    Unknown(u32),
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageType::Negotiate => write!(f, "negotiate (type 1)"),
            MessageType::Challenge => write!(f, "challenge (type 2)"),
            MessageType::Authenticate => write!(f, "authenticate (type 3)"),
            MessageType::Unknown(t) => write!(f, "unknown (type {})", t),
        }
    }
}

/// Identify an NTLMSSP message from its header.
///
/// Returns `None` when `data` does not start with the `NTLMSSP\0` signature,
/// which is the normal case for other schemes such as Kerberos-backed
/// `Negotiate` tokens.
pub fn message_type(data: &[u8]) -> Option<MessageType> {
    if data.len() < 12 || &data[0..8] != NTLMSSP_SIGNATURE {
        return None;
    }
    let raw = u32::from_le_bytes([data[8], data[9], data[10], data[11]]);
    Some(match raw {
        1 => MessageType::Negotiate,
        2 => MessageType::Challenge,
        3 => MessageType::Authenticate,
        other => MessageType::Unknown(other),
    })
}
