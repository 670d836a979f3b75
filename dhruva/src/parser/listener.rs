//! Parser callbacks.
//!
//! The [`Parser`](super::Parser) reports what it finds to a [`MessageListener`]
//! for the message level (start line, headers, body) and to an
//! [`ElementListener`] for the inside of an element (URI parts, parameters).
//!
//! Every `*_begin` callback answers with an [`ElementHandler`]: either a
//! listener to recurse into the element, or [`ElementHandler::Defer`] to skip
//! its structure. A deferred element is still reported whole through the
//! matching `*_found` callback and can be parsed later, on first access.

use util::WireStr;

use crate::error::ListenerError;
use crate::message::{HeaderName, Method, StatusCode};

/// Result type of the listener callbacks.
pub type ListenerResult<T = ()> = std::result::Result<T, ListenerError>;

/// The sub-elements the parser can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementId {
    /// A whole URI.
    Uri,
    Scheme,
    User,
    Password,
    Host,
    Port,
    /// The display name of a name-addr, without quotes.
    DisplayName,
    /// `SIP/2.0` in a `Via`.
    Protocol,
    /// The transport token in a `Via`.
    Transport,
    /// A decimal number, as in `CSeq` or `Content-Length`.
    Number,
    Method,
    /// A header value with no inner structure, as `Call-ID`.
    Token,
    /// The `?name=value` part of a URI.
    UriHeader,
    /// The whole header, owner of the header parameters.
    Header,
}

/// What the listener wants for an element about to be parsed.
pub enum ElementHandler<'l> {
    /// Parse the element reporting to this listener.
    Parse(&'l mut dyn ElementListener),
    /// Do not parse the element now.
    Defer,
}

/// Receives the parts of an element.
pub trait ElementListener {
    /// A nested element starts, [`ElementId::Uri`] inside a name-addr.
    fn element_begin(&mut self, _id: ElementId) -> ElementHandler<'_> {
        ElementHandler::Defer
    }

    /// A sub-element was read.
    fn element_found(&mut self, id: ElementId, value: WireStr) -> ListenerResult;

    /// A parameter of `owner` was read.
    fn parameter_found(
        &mut self,
        owner: ElementId,
        name: WireStr,
        value: Option<WireStr>,
    ) -> ListenerResult;
}

/// Receives the parts of a message.
pub trait MessageListener {
    /// A request line starts, the answer decides if the Request-URI is parsed.
    fn request_uri_begin(&mut self, method: &Method) -> ElementHandler<'_>;

    /// The Request-URI was read.
    fn request_uri_found(&mut self, method: Method, uri: WireStr) -> ListenerResult;

    /// A `body` header was found in the Request-URI.
    fn body_found_in_request_uri(&mut self, _body: WireStr) -> ListenerResult {
        Ok(())
    }

    /// The status line of a response was read.
    fn status_line_found(&mut self, code: StatusCode, reason: WireStr) -> ListenerResult;

    /// The `SIP/2.0` token of the start line was read.
    fn protocol_found(&mut self, _protocol: WireStr) -> ListenerResult {
        Ok(())
    }

    /// A header element starts.
    fn element_begin(&mut self, _name: &HeaderName) -> ElementHandler<'_> {
        ElementHandler::Defer
    }

    /// A header element was read.
    ///
    /// `valid` is `false` when the listener asked to parse the element and
    /// it is malformed. Parsing goes on with the next header.
    fn element_found(&mut self, name: HeaderName, value: WireStr, valid: bool) -> ListenerResult;

    /// The message body was read.
    fn body_found(&mut self, body: WireStr) -> ListenerResult;
}
