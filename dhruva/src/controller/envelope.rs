use std::net::SocketAddr;

use crate::error::Result;
use crate::message::{Request, Response, SipMessage};
use crate::parser::Parser;
use crate::transport::{IncomingPacket, Transport};

use super::ExecutionContext;

/// The connection a message came in on, where answers go back.
#[derive(Debug, Clone)]
pub struct MessageSource {
    pub transport: Transport,
    pub addr: SocketAddr,
}

/// Where a message stands in its call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallType {
    /// A request without a To tag, starting a call or standing alone.
    OutOfDialog,
    /// A request of an established dialog.
    InDialog,
    Response,
}

impl CallType {
    fn of(message: &SipMessage) -> Self {
        match message {
            SipMessage::Request(request) => {
                if request.headers.to_hdr().is_some_and(|to| to.tag().is_some()) {
                    CallType::InDialog
                } else {
                    CallType::OutOfDialog
                }
            }
            SipMessage::Response(_) => CallType::Response,
        }
    }
}

/// A SIP message with its [`ExecutionContext`].
///
/// The session id is the Call-ID and the correlation id is the one of the
/// context.
#[derive(Debug, Clone)]
pub struct DhruvaMessage {
    pub context: ExecutionContext,
    pub message: SipMessage,
    pub source: Option<MessageSource>,
    pub session_id: Option<String>,
    /// The Request-URI as written on the wire, `None` for responses.
    pub req_uri: Option<String>,
    pub call_type: CallType,
}

impl DhruvaMessage {
    pub fn new(context: ExecutionContext, message: SipMessage) -> Self {
        Self {
            session_id: message.call_id().map(|call_id| call_id.to_string()),
            req_uri: message.as_request().map(|request| request.uri().to_string()),
            call_type: CallType::of(&message),
            context,
            message,
            source: None,
        }
    }

    /// Parses a packet into a message with a fresh context.
    pub fn from_packet(incoming: &IncomingPacket) -> Result<Self> {
        let message = Parser::parse(&incoming.packet.data)?;
        let mut context = ExecutionContext::new();
        if let Some(call_id) = message.call_id() {
            context.set_call_id(call_id.to_string());
        }
        if let SipMessage::Request(request) = &message {
            if let Some(user) = &request.uri().user {
                context.set_user_id(user.to_string());
            }
        }

        let mut message = Self::new(context, message);
        message.source = Some(MessageSource {
            transport: incoming.transport.clone(),
            addr: incoming.packet.source,
        });
        Ok(message)
    }

    pub fn is_request(&self) -> bool {
        self.message.is_request()
    }

    pub fn request(&self) -> Option<&Request> {
        self.message.as_request()
    }

    pub fn response(&self) -> Option<&Response> {
        self.message.as_response()
    }

    pub fn correlation_id(&self) -> &str {
        self.context.correlation_id()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn req_uri(&self) -> Option<&str> {
        self.req_uri.as_deref()
    }
}
