use std::time::SystemTime;

use bytes::Bytes;

use crate::transport::{IncomingPacket, Packet};

pub mod resolver;
pub mod transport;

pub use resolver::MockLookup;
pub use transport::{MockSender, MockTransport};

pub const CLIENT_BRANCH: &str = "z9hG4bK776asdhds";

pub const INVITE: &str = "INVITE sip:alice@example.com SIP/2.0\r\n\
Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
Max-Forwards: 70\r\n\
To: Alice <sip:alice@example.com>\r\n\
From: Bob <sip:bob@biloxi.com>;tag=1928301774\r\n\
Call-ID: a84b4c76e66710@pc33.atlanta.com\r\n\
CSeq: 314159 INVITE\r\n\
Contact: <sip:bob@pc33.atlanta.com>\r\n\
Content-Length: 0\r\n\r\n";

/// [`INVITE`] with another Call-ID and branch.
pub fn invite(call_id: &str) -> String {
    INVITE
        .replace("a84b4c76e66710@pc33.atlanta.com", call_id)
        .replace(CLIENT_BRANCH, &format!("z9hG4bK{call_id}"))
}

/// A packet received from `source` on a UDP socket.
pub fn incoming(data: &str, source: &str) -> IncomingPacket {
    IncomingPacket {
        transport: MockTransport::new_udp().into(),
        packet: Packet {
            data: Bytes::from(data.to_string()),
            source: source.parse().unwrap(),
            time: SystemTime::now(),
        },
    }
}
