//! Listeners that assemble typed values from parser callbacks.

use std::mem;

use util::WireStr;

use super::listener::{ElementHandler, ElementId, ElementListener, ListenerResult, MessageListener};
use crate::error::{ListenerError, ParseError, Result};
use crate::message::*;

/// Collects the parts of a URI.
#[derive(Default)]
pub struct UriBuilder {
    scheme: Option<WireStr>,
    user: Option<WireStr>,
    password: Option<WireStr>,
    host: Option<WireStr>,
    port: Option<u16>,
    params: Params,
    headers: Params,
}

impl UriBuilder {
    /// Takes the collected parts, leaving the builder empty.
    pub fn build(&mut self) -> Option<Uri> {
        let builder = mem::take(self);
        Some(Uri {
            scheme: Scheme::from(builder.scheme?),
            user: builder.user,
            password: builder.password,
            host_port: HostPort::new(Host::from_wire(builder.host?), builder.port),
            params: builder.params,
            headers: builder.headers,
        })
    }
}

impl ElementListener for UriBuilder {
    fn element_found(&mut self, id: ElementId, value: WireStr) -> ListenerResult {
        match id {
            ElementId::Scheme => self.scheme = Some(value),
            ElementId::User => self.user = Some(value),
            ElementId::Password => self.password = Some(value),
            ElementId::Host => self.host = Some(value),
            ElementId::Port => self.port = value.parse(),
            _ => (),
        }
        Ok(())
    }

    fn parameter_found(
        &mut self,
        owner: ElementId,
        name: WireStr,
        value: Option<WireStr>,
    ) -> ListenerResult {
        match owner {
            ElementId::UriHeader => self.headers.push(name, value),
            _ => self.params.push(name, value),
        }
        Ok(())
    }
}

/// Collects a name-addr, recursing into its URI.
#[derive(Default)]
pub struct NameAddrBuilder {
    display: Option<WireStr>,
    uri: UriBuilder,
    params: Params,
}

impl NameAddrBuilder {
    pub fn build(&mut self) -> Option<NameAddr> {
        let uri = self.uri.build()?;
        Some(NameAddr {
            display: self.display.take(),
            uri,
            params: mem::take(&mut self.params),
        })
    }
}

impl ElementListener for NameAddrBuilder {
    fn element_begin(&mut self, id: ElementId) -> ElementHandler<'_> {
        match id {
            ElementId::Uri => ElementHandler::Parse(&mut self.uri),
            _ => ElementHandler::Defer,
        }
    }

    fn element_found(&mut self, id: ElementId, value: WireStr) -> ListenerResult {
        if id == ElementId::DisplayName {
            self.display = Some(value);
        }
        Ok(())
    }

    fn parameter_found(
        &mut self,
        _owner: ElementId,
        name: WireStr,
        value: Option<WireStr>,
    ) -> ListenerResult {
        self.params.push(name, value);
        Ok(())
    }
}

#[derive(Default)]
pub struct ViaBuilder {
    transport: Option<WireStr>,
    host: Option<WireStr>,
    port: Option<u16>,
    params: Params,
}

impl ViaBuilder {
    pub fn build(&mut self) -> Option<Via> {
        Some(Via {
            transport: self.transport.take()?,
            sent_by: HostPort::new(Host::from_wire(self.host.take()?), self.port.take()),
            params: mem::take(&mut self.params),
        })
    }
}

impl ElementListener for ViaBuilder {
    fn element_found(&mut self, id: ElementId, value: WireStr) -> ListenerResult {
        match id {
            ElementId::Transport => self.transport = Some(value),
            ElementId::Host => self.host = Some(value),
            ElementId::Port => self.port = value.parse(),
            _ => (),
        }
        Ok(())
    }

    fn parameter_found(
        &mut self,
        _owner: ElementId,
        name: WireStr,
        value: Option<WireStr>,
    ) -> ListenerResult {
        self.params.push(name, value);
        Ok(())
    }
}

#[derive(Default)]
pub struct CSeqBuilder {
    seq: Option<u32>,
    method: Option<Method>,
}

impl CSeqBuilder {
    pub fn build(&mut self) -> Option<CSeq> {
        Some(CSeq {
            seq: self.seq.take()?,
            method: self.method.take()?,
        })
    }
}

impl ElementListener for CSeqBuilder {
    fn element_found(&mut self, id: ElementId, value: WireStr) -> ListenerResult {
        match id {
            ElementId::Number => self.seq = value.parse(),
            ElementId::Method => self.method = Some(Method::from(value)),
            _ => (),
        }
        Ok(())
    }

    fn parameter_found(&mut self, _: ElementId, _: WireStr, _: Option<WireStr>) -> ListenerResult {
        Ok(())
    }
}

#[derive(Default)]
pub struct NumberBuilder(Option<u32>);

impl NumberBuilder {
    pub fn build(&mut self) -> Option<u32> {
        self.0.take()
    }
}

impl ElementListener for NumberBuilder {
    fn element_found(&mut self, id: ElementId, value: WireStr) -> ListenerResult {
        if id == ElementId::Number {
            self.0 = value.parse();
        }
        Ok(())
    }

    fn parameter_found(&mut self, _: ElementId, _: WireStr, _: Option<WireStr>) -> ListenerResult {
        Ok(())
    }
}

/// Builds a [`SipMessage`].
///
/// The Request-URI is parsed right away, headers are kept raw and parsed
/// on first access.
#[derive(Default)]
pub struct MessageBuilder {
    request_uri: UriBuilder,
    request_line: Option<RequestLine>,
    status_line: Option<StatusLine>,
    headers: Headers,
    body: Option<bytes::Bytes>,
}

impl MessageBuilder {
    pub fn finish(self) -> Result<SipMessage> {
        let message = match (self.request_line, self.status_line) {
            (Some(req_line), _) => SipMessage::Request(Request {
                req_line,
                headers: self.headers,
                body: self.body,
            }),
            (None, Some(status_line)) => SipMessage::Response(Response {
                status_line,
                headers: self.headers,
                body: self.body,
            }),
            (None, None) => return Err(ParseError::new("no start line found", 0, 0).into()),
        };

        Ok(message)
    }
}

impl MessageListener for MessageBuilder {
    fn request_uri_begin(&mut self, _method: &Method) -> ElementHandler<'_> {
        ElementHandler::Parse(&mut self.request_uri)
    }

    fn request_uri_found(&mut self, method: Method, _uri: WireStr) -> ListenerResult {
        let uri = self
            .request_uri
            .build()
            .ok_or_else(|| ListenerError::new("incomplete Request-URI"))?;
        self.request_line = Some(RequestLine { method, uri });
        Ok(())
    }

    fn status_line_found(&mut self, code: StatusCode, reason: WireStr) -> ListenerResult {
        self.status_line = Some(StatusLine { code, reason });
        Ok(())
    }

    fn element_found(&mut self, name: HeaderName, value: WireStr, _valid: bool) -> ListenerResult {
        self.headers.push(Header::new(name, value));
        Ok(())
    }

    fn body_found(&mut self, body: WireStr) -> ListenerResult {
        self.body = Some(body.to_bytes());
        Ok(())
    }
}
