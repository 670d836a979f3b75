//! SIP Parser
//!
//! The module provides the [`Parser`] struct, an event driven parser for SIP
//! messages. It reports the start line, headers and body to a
//! [`MessageListener`] and, when asked to, the inside of each element to an
//! [`ElementListener`]. Every value handed out is a [`WireStr`] view of the
//! caller buffer, nothing is copied.

use bytes::Bytes;
use util::{Scanner, WireStr};

use crate::error::{Error, ParseError, Result};
use crate::macros::lookup_table;
use crate::message::*;

mod builder;
pub mod listener;

pub use builder::*;
pub use listener::*;

/// Alphanumeric is valid in all sip message components.
const ALPHANUMERIC: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
/// Unreserved characters in user, password, uri and header
/// parameters in SIP uris.
const UNRESERVED: &[u8] = b"-_.!~*'()%";
/// Unreserverd charaters in user part of SIP URIs.
const USER_UNRESERVED: &[u8] = b"&=+$,;?/";
/// Token in SIP Messages
const TOKEN: &[u8] = b"-.!%*_`'~+";
/// Password valid characters in SIP URIs.
const PASS: &[u8] = b"&=+$,";
/// Valid characters in SIP URIs host part.
const HOST: &[u8] = b"_-.";

lookup_table!(USER_TAB => ALPHANUMERIC, UNRESERVED, USER_UNRESERVED);
lookup_table!(PASS_TAB => ALPHANUMERIC, UNRESERVED, PASS);
lookup_table!(HOST_TAB => ALPHANUMERIC, HOST);
lookup_table!(SCHEME_TAB => ALPHANUMERIC, b"+-.");
lookup_table!(PARAM_TAB => b"[]/:&+$", ALPHANUMERIC, UNRESERVED);
lookup_table!(HDR_TAB => b"[]/?:+$", ALPHANUMERIC, UNRESERVED);
lookup_table!(TOKEN_TAB => ALPHANUMERIC, TOKEN);
lookup_table!(PARAM_VALUE_TAB => b"[:]", ALPHANUMERIC, TOKEN);

#[inline]
fn is_sp(b: u8) -> bool {
    b == b' ' || b == b'\t'
}

#[inline]
fn is_lws(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\r' | b'\n')
}

#[inline]
fn is_eol(b: u8) -> bool {
    b == b'\r' || b == b'\n'
}

/// A SIP message parser.
///
/// Offsets reported in [`ParseError`]s are offsets in the caller buffer.
pub struct Parser<'buf> {
    src: &'buf Bytes,
    scanner: Scanner<'buf>,
    base: usize,
}

impl<'buf> Parser<'buf> {
    fn new(src: &'buf Bytes, offset: usize, count: usize) -> Result<Self> {
        let end = offset
            .checked_add(count)
            .filter(|end| *end <= src.len())
            .ok_or_else(|| ParseError::new("range out of buffer bounds", offset, count))?;

        Ok(Self {
            src,
            scanner: Scanner::new(&src[offset..end]),
            base: offset,
        })
    }

    /// Parses the message in `buf[offset..offset + count]`, reporting to `listener`.
    ///
    /// Returns the number of bytes the message takes, bytes following the
    /// declared body are not consumed.
    pub fn parse_message(
        listener: &mut dyn MessageListener,
        buf: &Bytes,
        offset: usize,
        count: usize,
    ) -> Result<usize> {
        let mut parser = Parser::new(buf, offset, count)?;
        parser.message(listener)
    }

    /// Parses a whole [`SipMessage`].
    pub fn parse(buf: &Bytes) -> Result<SipMessage> {
        let mut builder = MessageBuilder::default();
        Parser::parse_message(&mut builder, buf, 0, buf.len())?;

        builder.finish()
    }

    /// Parses a URI in addr-spec form.
    pub fn parse_uri(src: &WireStr) -> Result<Uri> {
        let mut builder = UriBuilder::default();
        Self::with_element(src, |p| p.uri(&mut builder, true))?;

        builder.build().ok_or_else(|| incomplete("URI", src))
    }

    pub fn parse_via(src: &WireStr) -> Result<Via> {
        let mut builder = ViaBuilder::default();
        Self::with_element(src, |p| p.via(&mut builder))?;

        builder.build().ok_or_else(|| incomplete("Via", src))
    }

    pub fn parse_name_addr(src: &WireStr) -> Result<NameAddr> {
        let mut builder = NameAddrBuilder::default();
        Self::with_element(src, |p| p.name_addr(&mut builder))?;

        builder.build().ok_or_else(|| incomplete("name-addr", src))
    }

    pub fn parse_cseq(src: &WireStr) -> Result<CSeq> {
        let mut builder = CSeqBuilder::default();
        Self::with_element(src, |p| p.cseq(&mut builder))?;

        builder.build().ok_or_else(|| incomplete("CSeq", src))
    }

    pub fn parse_number(src: &WireStr) -> Result<u32> {
        let mut builder = NumberBuilder::default();
        Self::with_element(src, |p| p.number(&mut builder))?;

        builder.build().ok_or_else(|| incomplete("number", src))
    }

    /// Parses the value of header `name`, reporting its parts to `listener`.
    pub fn parse_element(
        name: &HeaderName,
        src: &WireStr,
        listener: &mut dyn ElementListener,
    ) -> Result<()> {
        Self::with_element(src, |p| match name {
            HeaderName::Via => p.via(listener),
            HeaderName::Contact if src.as_bytes() == b"*" => {
                p.scanner.advance_by(1);
                listener.element_found(ElementId::Token, src.clone())?;
                Ok(())
            }
            HeaderName::From
            | HeaderName::To
            | HeaderName::Contact
            | HeaderName::Route
            | HeaderName::RecordRoute => p.name_addr(listener),
            HeaderName::CSeq => p.cseq(listener),
            HeaderName::ContentLength | HeaderName::MaxForwards => p.number(listener),
            _ => {
                p.scanner.advance_by(src.len());
                listener.element_found(ElementId::Token, src.clone())?;
                Ok(())
            }
        })
    }

    fn with_element<F>(src: &WireStr, func: F) -> Result<()>
    where
        F: FnOnce(&mut Parser<'_>) -> Result<()>,
    {
        let bytes = src.to_bytes();
        let mut parser = Parser::new(&bytes, 0, bytes.len())?;
        func(&mut parser)?;
        parser.scanner.read_while(is_lws);
        if !parser.scanner.is_eof() {
            return Err(parser.error("unexpected trailing characters", parser.scanner.offset()));
        }

        Ok(())
    }

    // -----------------------------------------------------------------
    // Message level
    // -----------------------------------------------------------------

    fn message(&mut self, listener: &mut dyn MessageListener) -> Result<usize> {
        // keep-alive pings before the start line
        self.scanner.read_while(is_lws);

        if self.scanner.peek_bytes(4) == Some(&b"SIP/"[..]) {
            self.status_line(listener)?;
        } else {
            self.request_line(listener)?;
        }

        let mut content_length = None;
        loop {
            if self.scanner.is_eof() {
                return Err(self.error("message ends inside the header section", self.scanner.offset()));
            }
            if self.eol()? {
                break;
            }
            if let Some(length) = self.header(listener)? {
                content_length = Some(length);
            }
        }

        let start = self.scanner.offset();
        let Some(length) = content_length else {
            return Err(self.error("Content-Length not found", start));
        };
        if self.scanner.remaining().len() < length {
            return Err(ParseError::new(
                format!("body shorter than Content-Length {length}"),
                self.base + start,
                self.scanner.remaining().len(),
            )
            .into());
        }
        if length > 0 {
            listener.body_found(self.view(start, start + length))?;
        }
        self.scanner.advance_by(length);

        Ok(self.scanner.offset())
    }

    fn request_line(&mut self, listener: &mut dyn MessageListener) -> Result<()> {
        let start = self.scanner.offset();
        let method = self.scanner.read_while(|b| TOKEN_TAB[b as usize]);
        if method.is_empty() || !self.scanner.advance_if_eq(b' ') {
            return Err(self.error("malformed start line", start));
        }
        let method = Method::from(self.view(start, start + method.len()));

        let uri_start = self.scanner.offset();
        let uri = self.scanner.read_while(|b| b != b' ' && !is_eol(b));
        if uri.is_empty() {
            return Err(self.error("malformed start line", uri_start));
        }
        let uri = self.view(uri_start, uri_start + uri.len());

        if let ElementHandler::Parse(uri_listener) = listener.request_uri_begin(&method) {
            Self::with_element(&uri, |p| p.uri(uri_listener, true))
                .map_err(|err| self.shift(err, uri_start))?;
        }
        listener.request_uri_found(method, uri.clone())?;
        if let Some(body) = uri_body_header(&uri) {
            listener.body_found_in_request_uri(body)?;
        }

        if !self.scanner.advance_if_eq(b' ') {
            return Err(self.error("malformed start line", self.scanner.offset()));
        }
        self.protocol(listener)?;
        self.line_end()
    }

    fn status_line(&mut self, listener: &mut dyn MessageListener) -> Result<()> {
        self.protocol(listener)?;
        if !self.scanner.advance_if_eq(b' ') {
            return Err(self.error("malformed start line", self.scanner.offset()));
        }

        let start = self.scanner.offset();
        let digits = self.scanner.read_while(|b| b.is_ascii_digit());
        let code = StatusCode::try_from(digits)
            .map_err(|_| self.error("invalid status code", start))?;

        self.scanner.read_while(is_sp);
        let reason_start = self.scanner.offset();
        let reason = self.scanner.read_while(|b| !is_eol(b));
        let reason = self.view(reason_start, reason_start + reason.len());

        listener.status_line_found(code, reason)?;
        self.line_end()
    }

    fn protocol(&mut self, listener: &mut dyn MessageListener) -> Result<()> {
        let start = self.scanner.offset();
        let protocol = self.scanner.read_while(|b| b != b' ' && !is_eol(b));
        if protocol != SIPV2.as_bytes() {
            return Err(self.error("invalid protocol version", start));
        }
        listener.protocol_found(self.view(start, start + protocol.len()))?;

        Ok(())
    }

    /// Parses one header line, with its continuation lines.
    ///
    /// Returns the `Content-Length` value when this is that header.
    fn header(&mut self, listener: &mut dyn MessageListener) -> Result<Option<usize>> {
        let start = self.scanner.offset();
        let name = self.scanner.read_while(|b| TOKEN_TAB[b as usize]);
        let name_end = start + name.len();
        self.scanner.read_while(is_sp);
        if name.is_empty() || !self.scanner.advance_if_eq(b':') {
            return Err(self.error("header syntax error", start));
        }
        let name = HeaderName::from_wire(self.view(start, name_end));

        self.scanner.read_while(is_sp);
        let value_start = self.scanner.offset();
        let value_end = loop {
            self.scanner.read_while(|b| !is_eol(b));
            let end = self.scanner.offset();
            if !self.eol()? {
                return Err(self.error("message ends inside the header section", end));
            }
            match self.scanner.peek_byte() {
                Some(b) if is_sp(b) => continue,
                _ => break end,
            }
        };
        let value = self.view(value_start, value_end).trim();

        let content_length = if name == HeaderName::ContentLength {
            let length = value
                .parse::<usize>()
                .ok_or_else(|| self.error("invalid Content-Length", value_start))?;
            Some(length)
        } else {
            None
        };

        if name.is_list() {
            for element in split_list(&value) {
                self.element(listener, name.clone(), element)?;
            }
        } else {
            self.element(listener, name, value)?;
        }

        Ok(content_length)
    }

    fn element(
        &mut self,
        listener: &mut dyn MessageListener,
        name: HeaderName,
        value: WireStr,
    ) -> Result<()> {
        let valid = match listener.element_begin(&name) {
            ElementHandler::Parse(element_listener) => {
                match Self::parse_element(&name, &value, element_listener) {
                    Ok(()) => true,
                    Err(Error::Parse(err)) => {
                        log::debug!("Invalid {name} header '{value}': {err}");
                        false
                    }
                    Err(err) => return Err(err),
                }
            }
            ElementHandler::Defer => true,
        };
        listener.element_found(name, value, valid)?;

        Ok(())
    }

    // -----------------------------------------------------------------
    // Element level
    // -----------------------------------------------------------------

    /// `scheme:user:password@host:port;params?headers`
    ///
    /// With `with_params` unset the URI stops before the first `;`, as in a
    /// name-addr without angle brackets.
    fn uri(&mut self, listener: &mut dyn ElementListener, with_params: bool) -> Result<()> {
        let start = self.scanner.offset();
        let scheme = self.scanner.read_while(|b| SCHEME_TAB[b as usize]);
        if scheme.is_empty() || !self.scanner.advance_if_eq(b':') {
            return Err(self.error("invalid URI scheme", start));
        }
        listener.element_found(ElementId::Scheme, self.view(start, start + scheme.len()))?;

        let has_user = self
            .scanner
            .peek_while(|b| b != b'>' && !is_lws(b))
            .contains(&b'@');
        if has_user {
            let user_start = self.scanner.offset();
            let user = self.scanner.read_while(|b| b != b':' && USER_TAB[b as usize]);
            listener.element_found(ElementId::User, self.view(user_start, user_start + user.len()))?;
            if self.scanner.advance_if_eq(b':') {
                let pass_start = self.scanner.offset();
                let pass = self.scanner.read_while(|b| PASS_TAB[b as usize]);
                let pass = self.view(pass_start, pass_start + pass.len());
                listener.element_found(ElementId::Password, pass)?;
            }
            if !self.scanner.advance_if_eq(b'@') {
                return Err(self.error("invalid URI user part", user_start));
            }
        }

        self.host_port(listener)?;

        if with_params {
            while self.scanner.advance_if_eq(b';') {
                let name_start = self.scanner.offset();
                let name = self.scanner.read_while(|b| PARAM_TAB[b as usize]);
                if name.is_empty() {
                    return Err(self.error("invalid URI parameter", name_start));
                }
                let name = self.view(name_start, name_start + name.len());
                let value = if self.scanner.advance_if_eq(b'=') {
                    let value_start = self.scanner.offset();
                    let value = self.scanner.read_while(|b| PARAM_TAB[b as usize]);
                    Some(self.view(value_start, value_start + value.len()))
                } else {
                    None
                };
                listener.parameter_found(ElementId::Uri, name, value)?;
            }

            if self.scanner.advance_if_eq(b'?') {
                loop {
                    let name_start = self.scanner.offset();
                    let name = self.scanner.read_while(|b| b != b'=' && HDR_TAB[b as usize]);
                    let name = self.view(name_start, name_start + name.len());
                    let value = if self.scanner.advance_if_eq(b'=') {
                        let value_start = self.scanner.offset();
                        let value = self.scanner.read_while(|b| HDR_TAB[b as usize]);
                        Some(self.view(value_start, value_start + value.len()))
                    } else {
                        None
                    };
                    listener.parameter_found(ElementId::UriHeader, name, value)?;
                    if !self.scanner.advance_if_eq(b'&') {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    fn host_port(&mut self, listener: &mut dyn ElementListener) -> Result<()> {
        let start = self.scanner.offset();
        let host = if self.scanner.peek_byte() == Some(b'[') {
            let host = self.scanner.read_until(b']');
            self.scanner.must_read(b']')?;
            host.len() + 1
        } else {
            self.scanner.read_while(|b| HOST_TAB[b as usize]).len()
        };
        if host == 0 {
            return Err(self.error("invalid host", start));
        }
        listener.element_found(ElementId::Host, self.view(start, start + host))?;

        if self.scanner.advance_if_eq(b':') {
            let port_start = self.scanner.offset();
            let port = self.scanner.read_u32()?;
            if port > u32::from(u16::MAX) {
                return Err(self.error("invalid port", port_start));
            }
            let port_end = self.scanner.offset();
            listener.element_found(ElementId::Port, self.view(port_start, port_end))?;
        }

        Ok(())
    }

    /// `"display" <uri>;params` or `uri;params`.
    fn name_addr(&mut self, listener: &mut dyn ElementListener) -> Result<()> {
        self.scanner.read_while(is_lws);

        let bracketed = if self.scanner.peek_byte() == Some(b'"') {
            self.scanner.next_byte();
            let start = self.scanner.offset();
            loop {
                match self.scanner.next_byte() {
                    Some(b'\\') => {
                        self.scanner.next_byte();
                    }
                    Some(b'"') => break,
                    Some(_) => (),
                    None => return Err(self.error("unterminated quoted string", start)),
                }
            }
            let display = self.view(start, self.scanner.offset() - 1);
            listener.element_found(ElementId::DisplayName, display)?;
            self.scanner.read_while(is_lws);
            true
        } else if self.scanner.remaining().contains(&b'<') {
            let start = self.scanner.offset();
            self.scanner.read_until(b'<');
            let display = self.view(start, self.scanner.offset()).trim();
            if !display.is_empty() {
                listener.element_found(ElementId::DisplayName, display)?;
            }
            true
        } else {
            false
        };

        let uri_start;
        let uri_end;
        if bracketed {
            self.scanner.must_read(b'<')?;
            uri_start = self.scanner.offset();
            self.scanner.read_until(b'>');
            uri_end = self.scanner.offset();
            if !self.scanner.advance_if_eq(b'>') {
                return Err(self.error("unterminated '<'", uri_start));
            }
        } else {
            uri_start = self.scanner.offset();
            let rest = self.scanner.remaining();
            let user_end = rest.iter().position(|&b| b == b'@').map_or(0, |at| at + 1);
            let len = rest[user_end..]
                .iter()
                .position(|&b| b == b';' || is_lws(b))
                .map_or(rest.len(), |end| user_end + end);
            self.scanner.advance_by(len);
            uri_end = uri_start + len;
        }

        let uri = self.view(uri_start, uri_end);
        if let ElementHandler::Parse(uri_listener) = listener.element_begin(ElementId::Uri) {
            let with_params = bracketed;
            Self::with_element(&uri, |p| p.uri(uri_listener, with_params))
                .map_err(|err| self.shift(err, uri_start))?;
        }
        listener.element_found(ElementId::Uri, uri)?;

        self.params(listener, ElementId::Header)
    }

    /// `SIP/2.0/UDP host:port;params`
    fn via(&mut self, listener: &mut dyn ElementListener) -> Result<()> {
        self.scanner.read_while(is_lws);
        let start = self.scanner.offset();
        self.scanner.read_while(|b| TOKEN_TAB[b as usize]);
        self.scanner.read_while(is_lws);
        self.scanner.must_read(b'/')?;
        self.scanner.read_while(is_lws);
        self.scanner.read_while(|b| TOKEN_TAB[b as usize]);
        let protocol = self.view(start, self.scanner.offset());
        if !protocol.eq_ignore_case(SIPV2) {
            return Err(self.error("invalid protocol version", start));
        }
        listener.element_found(ElementId::Protocol, protocol)?;

        self.scanner.read_while(is_lws);
        self.scanner.must_read(b'/')?;
        self.scanner.read_while(is_lws);
        let transport_start = self.scanner.offset();
        let transport = self.scanner.read_while(|b| TOKEN_TAB[b as usize]);
        if transport.is_empty() {
            return Err(self.error("missing Via transport", transport_start));
        }
        let transport = self.view(transport_start, transport_start + transport.len());
        listener.element_found(ElementId::Transport, transport)?;

        self.scanner.read_while(is_lws);
        self.host_port(listener)?;

        self.params(listener, ElementId::Header)
    }

    /// `4711 INVITE`
    fn cseq(&mut self, listener: &mut dyn ElementListener) -> Result<()> {
        self.number(listener)?;

        let start = self.scanner.offset();
        let method = self.scanner.read_while(|b| TOKEN_TAB[b as usize]);
        if method.is_empty() {
            return Err(self.error("missing CSeq method", start));
        }
        listener.element_found(ElementId::Method, self.view(start, start + method.len()))?;

        Ok(())
    }

    fn number(&mut self, listener: &mut dyn ElementListener) -> Result<()> {
        self.scanner.read_while(is_lws);
        let start = self.scanner.offset();
        self.scanner.read_u32()?;
        let end = self.scanner.offset();
        listener.element_found(ElementId::Number, self.view(start, end))?;
        self.scanner.read_while(is_lws);

        Ok(())
    }

    /// `;name=value` parameters of the element `owner`.
    fn params(&mut self, listener: &mut dyn ElementListener, owner: ElementId) -> Result<()> {
        loop {
            self.scanner.read_while(is_lws);
            if !self.scanner.advance_if_eq(b';') {
                return Ok(());
            }
            self.scanner.read_while(is_lws);

            let name_start = self.scanner.offset();
            let name = self.scanner.read_while(|b| TOKEN_TAB[b as usize]);
            if name.is_empty() {
                return Err(self.error("invalid parameter", name_start));
            }
            let name = self.view(name_start, name_start + name.len());

            self.scanner.read_while(is_lws);
            let value = if self.scanner.advance_if_eq(b'=') {
                self.scanner.read_while(is_lws);
                let value_start = self.scanner.offset();
                if self.scanner.peek_byte() == Some(b'"') {
                    self.scanner.next_byte();
                    self.scanner.read_until(b'"');
                    self.scanner.must_read(b'"')?;
                } else {
                    self.scanner.read_while(|b| PARAM_VALUE_TAB[b as usize]);
                }
                Some(self.view(value_start, self.scanner.offset()))
            } else {
                None
            };
            listener.parameter_found(owner, name, value)?;
        }
    }

    // -----------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------

    /// Consumes a CRLF or a bare LF.
    fn eol(&mut self) -> Result<bool> {
        if self.scanner.advance_if_eq(b'\r') {
            self.scanner.must_read(b'\n')?;
            Ok(true)
        } else {
            Ok(self.scanner.advance_if_eq(b'\n'))
        }
    }

    fn line_end(&mut self) -> Result<()> {
        if self.eol()? {
            Ok(())
        } else {
            Err(self.error("malformed start line", self.scanner.offset()))
        }
    }

    #[inline]
    fn view(&self, start: usize, end: usize) -> WireStr {
        WireStr::view(self.src, self.base + start, end - start)
    }

    fn error(&self, message: &str, start: usize) -> Error {
        let len = self.scanner.offset().saturating_sub(start).max(1);
        ParseError::new(message, self.base + start, len).into()
    }

    /// Moves the offset of an error raised on a sub-range of this parser input.
    fn shift(&self, err: Error, start: usize) -> Error {
        match err {
            Error::Parse(mut err) => {
                err.offset += self.base + start;
                Error::Parse(err)
            }
            err => err,
        }
    }
}

fn incomplete(what: &str, src: &WireStr) -> Error {
    ParseError::new(format!("incomplete {what}"), 0, src.len()).into()
}

/// Splits a list header value on the commas outside quotes and angle brackets.
fn split_list(value: &WireStr) -> Vec<WireStr> {
    let mut elements = Vec::with_capacity(1);
    let mut quoted = false;
    let mut escaped = false;
    let mut depth = 0usize;
    let mut start = 0;

    for (i, &b) in value.iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if quoted => escaped = true,
            b'"' => quoted = !quoted,
            b'<' if !quoted => depth += 1,
            b'>' if !quoted => depth = depth.saturating_sub(1),
            b',' if !quoted && depth == 0 => {
                elements.push(value.slice(start..i).trim());
                start = i + 1;
            }
            _ => (),
        }
    }
    elements.push(value.slice(start..).trim());
    elements.retain(|e| !e.is_empty());

    elements
}

/// The value of the `body` header of a Request-URI.
fn uri_body_header(uri: &WireStr) -> Option<WireStr> {
    let query = uri.iter().position(|&b| b == b'?')?;
    let mut start = query + 1;

    while start <= uri.len() {
        let end = uri[start..]
            .iter()
            .position(|&b| b == b'&')
            .map_or(uri.len(), |i| start + i);
        let pair = uri.slice(start..end);
        if let Some(eq) = pair.iter().position(|&b| b == b'=') {
            if pair.slice(..eq).eq_ignore_case("body") {
                return Some(pair.slice(eq + 1..));
            }
        }
        start = end + 1;
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ListenerError;

    const REGISTER: &[u8] = b"REGISTER sip:registrar.biloxi.com SIP/2.0\r\n\
Via: SIP/2.0/UDP bobspc.biloxi.com:5060;branch=z9hG4bKnashds7, SIP/2.0/TCP [::1]:5070;received=10.0.0.1\r\n\
Max-Forwards: 70\r\n\
t: Bob <sip:bob@biloxi.com>\r\n\
f: \"Bob, the builder\" <sip:bob@biloxi.com>;tag=456248\r\n\
i: 843817637684230@998sdasdh09\r\n\
CSeq: 1826 REGISTER\r\n\
m: <sip:bob@192.0.2.4>;expires=7200\r\n\
X-Folded: first\r\n second\r\n\
l: 0\r\n\r\n";

    #[derive(Default)]
    struct Recorder {
        uri: UriBuilder,
        via: ViaBuilder,
        parsed_vias: Vec<Via>,
        events: Vec<String>,
    }

    impl MessageListener for Recorder {
        fn request_uri_begin(&mut self, method: &Method) -> ElementHandler<'_> {
            self.events.push(format!("uri_begin {method}"));
            ElementHandler::Parse(&mut self.uri)
        }

        fn request_uri_found(&mut self, _method: Method, uri: WireStr) -> ListenerResult {
            self.events.push(format!("uri {uri}"));
            Ok(())
        }

        fn body_found_in_request_uri(&mut self, body: WireStr) -> ListenerResult {
            self.events.push(format!("uri_body {body}"));
            Ok(())
        }

        fn status_line_found(&mut self, code: StatusCode, reason: WireStr) -> ListenerResult {
            self.events.push(format!("status {code} {reason}"));
            Ok(())
        }

        fn protocol_found(&mut self, protocol: WireStr) -> ListenerResult {
            self.events.push(format!("protocol {protocol}"));
            Ok(())
        }

        fn element_begin(&mut self, name: &HeaderName) -> ElementHandler<'_> {
            match name {
                HeaderName::Via => ElementHandler::Parse(&mut self.via),
                _ => ElementHandler::Defer,
            }
        }

        fn element_found(&mut self, name: HeaderName, value: WireStr, valid: bool) -> ListenerResult {
            if name == HeaderName::Via && valid {
                if let Some(via) = self.via.build() {
                    self.parsed_vias.push(via);
                }
            }
            self.events.push(format!("{name}: {value} ({valid})"));
            Ok(())
        }

        fn body_found(&mut self, body: WireStr) -> ListenerResult {
            self.events.push(format!("body {body}"));
            Ok(())
        }
    }

    #[test]
    fn test_listener_events() {
        let buf = Bytes::from_static(REGISTER);
        let mut recorder = Recorder::default();
        let consumed = Parser::parse_message(&mut recorder, &buf, 0, buf.len()).unwrap();

        assert_eq!(consumed, buf.len());
        assert_eq!(recorder.events[0], "uri_begin REGISTER");
        assert_eq!(recorder.events[1], "uri sip:registrar.biloxi.com");
        assert_eq!(recorder.events[2], "protocol SIP/2.0");
        assert_eq!(recorder.parsed_vias.len(), 2);
        assert_eq!(recorder.parsed_vias[0].branch().unwrap(), "z9hG4bKnashds7");
        assert_eq!(recorder.parsed_vias[1].sent_by.to_string(), "[::1]:5070");
        assert!(recorder.events.contains(&"X-Folded: first\r\n second (true)".to_string()));
    }

    #[test]
    fn test_parse_with_offset() {
        let mut data = b"garbage".to_vec();
        data.extend_from_slice(REGISTER);
        let buf = Bytes::from(data);
        let mut builder = MessageBuilder::default();

        let consumed = Parser::parse_message(&mut builder, &buf, 7, buf.len() - 7).unwrap();
        let message = builder.finish().unwrap();

        assert_eq!(consumed, REGISTER.len());
        assert_eq!(message.call_id().unwrap(), "843817637684230@998sdasdh09");
        assert_eq!(message.headers().get_all(&HeaderName::Via).count(), 2);
    }

    #[test]
    fn test_compact_and_quoted_headers() {
        let message = Parser::parse(&Bytes::from_static(REGISTER)).unwrap();
        let from = message.headers().from_hdr().unwrap();

        assert_eq!(from.display.as_ref().unwrap(), "Bob, the builder");
        assert_eq!(from.tag().unwrap(), "456248");
        assert_eq!(message.headers().content_length(), Some(0));
        assert_eq!(message.headers().cseq().unwrap().seq, 1826);
        assert!(message.body().is_none());
    }

    #[test]
    fn test_response() {
        let buf = Bytes::from_static(
            b"SIP/2.0 180 Ringing\r\nVia: SIP/2.0/UDP a.com;branch=z9hG4bK1\r\nContent-Length: 0\r\n\r\n",
        );
        let message = Parser::parse(&buf).unwrap();
        let response = message.as_response().unwrap();

        assert_eq!(response.code(), StatusCode::RINGING);
        assert_eq!(response.reason(), "Ringing");
    }

    #[test]
    fn test_missing_content_length() {
        let buf = Bytes::from_static(b"OPTIONS sip:a.com SIP/2.0\r\nCall-ID: 1\r\n\r\n");
        let err = Parser::parse(&buf).unwrap_err();

        assert_matches!(err, Error::Parse(ParseError { ref message, .. }) if message == "Content-Length not found");
    }

    #[test]
    fn test_invalid_protocol_version() {
        let buf = Bytes::from_static(b"OPTIONS sip:a.com SIP/3.0\r\nContent-Length: 0\r\n\r\n");
        let err = Parser::parse(&buf).unwrap_err();

        assert_matches!(err, Error::Parse(ParseError { offset: 18, len: 7, .. }));
    }

    #[test]
    fn test_short_body() {
        let buf = Bytes::from_static(b"MESSAGE sip:a.com SIP/2.0\r\nContent-Length: 10\r\n\r\nhello");

        assert_matches!(Parser::parse(&buf), Err(Error::Parse(_)));
    }

    #[test]
    fn test_malformed_header_is_reported_invalid() {
        let buf = Bytes::from_static(
            b"OPTIONS sip:a.com SIP/2.0\r\nVia: garbage\r\nVia: SIP/2.0/UDP b.com\r\nContent-Length: 0\r\n\r\n",
        );
        let mut recorder = Recorder::default();
        Parser::parse_message(&mut recorder, &buf, 0, buf.len()).unwrap();

        assert!(recorder.events.contains(&"Via: garbage (false)".to_string()));
        assert!(recorder.events.contains(&"Via: SIP/2.0/UDP b.com (true)".to_string()));
        assert_eq!(recorder.parsed_vias.len(), 1);
    }

    #[test]
    fn test_body_in_request_uri() {
        let buf = Bytes::from_static(
            b"MESSAGE sip:bob@b.com?subject=x&body=hello SIP/2.0\r\nContent-Length: 0\r\n\r\n",
        );
        let mut recorder = Recorder::default();
        Parser::parse_message(&mut recorder, &buf, 0, buf.len()).unwrap();

        assert!(recorder.events.contains(&"uri_body hello".to_string()));
        let uri = recorder.uri.build().unwrap();
        assert_eq!(uri.headers.value("subject").unwrap(), "x");
    }

    #[test]
    fn test_listener_error_keeps_cause() {
        struct Failing;

        impl MessageListener for Failing {
            fn request_uri_begin(&mut self, _: &Method) -> ElementHandler<'_> {
                ElementHandler::Defer
            }
            fn request_uri_found(&mut self, _: Method, _: WireStr) -> ListenerResult {
                Err(ListenerError::new("rejected"))
            }
            fn status_line_found(&mut self, _: StatusCode, _: WireStr) -> ListenerResult {
                Ok(())
            }
            fn element_found(&mut self, _: HeaderName, _: WireStr, _: bool) -> ListenerResult {
                Ok(())
            }
            fn body_found(&mut self, _: WireStr) -> ListenerResult {
                Ok(())
            }
        }

        let buf = Bytes::from_static(REGISTER);
        let err = Parser::parse_message(&mut Failing, &buf, 0, buf.len()).unwrap_err();

        assert_matches!(err, Error::ParserListener(ref e) if e.0.to_string() == "rejected");
    }

    #[test]
    fn test_name_addr_forms() {
        let plain = Parser::parse_name_addr(&"sip:alice@atlanta.com;tag=88sja8x".into()).unwrap();
        assert_eq!(plain.tag().unwrap(), "88sja8x");
        assert!(plain.uri.params.is_empty());

        let bracketed = Parser::parse_name_addr(&"<sip:alice@atlanta.com;lr>;tag=1".into()).unwrap();
        assert!(bracketed.uri.is_lr());
        assert_eq!(bracketed.tag().unwrap(), "1");
    }

    #[test]
    fn test_port_out_of_range() {
        assert_matches!(Parser::parse_uri(&"sip:a.com:70000".into()), Err(Error::Parse(_)));
    }
}
