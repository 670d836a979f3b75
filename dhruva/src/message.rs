//! SIP message types
//!
//! The module provide the [`SipMessage`] enum that can be an
//! [`SipMessage::Request`] or [`SipMessage::Response`] and represents a SIP
//! message.

use std::fmt::Write as _;

use bytes::{BufMut, Bytes, BytesMut};
use enum_as_inner::EnumAsInner;
use rand::Rng;
use util::WireStr;

mod code;
pub mod headers;
mod method;
mod uri;

pub use code::*;
pub use headers::{Header, HeaderName, Headers, MandatoryHeaders, TypedValue};
pub use method::*;
pub use uri::*;

use crate::error::{Error, Result};

/// The SIP version this crate speaks.
pub const SIPV2: &str = "SIP/2.0";

/// A SIP message as defined in [RFC 3261].
///
/// It can be either a request from a client to a server,
/// or a response from a server to a client.
///
/// [RFC 3261]: https://datatracker.ietf.org/doc/html/rfc3261
#[derive(Debug, Clone, PartialEq, Eq, EnumAsInner)]
pub enum SipMessage {
    /// An SIP Request.
    Request(Request),
    /// An SIP Response.
    Response(Response),
}

impl SipMessage {
    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(req) => &req.headers,
            SipMessage::Response(res) => &res.headers,
        }
    }

    pub fn headers_mut(&mut self) -> &mut Headers {
        match self {
            SipMessage::Request(req) => &mut req.headers,
            SipMessage::Response(res) => &mut res.headers,
        }
    }

    pub fn body(&self) -> Option<&Bytes> {
        match self {
            SipMessage::Request(req) => req.body.as_ref(),
            SipMessage::Response(res) => res.body.as_ref(),
        }
    }

    /// The Call-ID, if present.
    pub fn call_id(&self) -> Option<&WireStr> {
        self.headers().call_id()
    }

    /// The method of the request, or the `CSeq` method of the response.
    pub fn method(&self) -> Option<Method> {
        match self {
            SipMessage::Request(req) => Some(req.method().clone()),
            SipMessage::Response(res) => res.headers.cseq().map(|c| c.method.clone()),
        }
    }

    /// Serializes the message into its wire form.
    ///
    /// `Content-Length` always reflects the actual body.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(512);
        match self {
            SipMessage::Request(req) => {
                write!(buf, "{} {} {SIPV2}\r\n", req.req_line.method, req.req_line.uri)?
            }
            SipMessage::Response(res) => write!(
                buf,
                "{SIPV2} {} {}\r\n",
                res.status_line.code, res.status_line.reason
            )?,
        }

        let body_len = self.body().map_or(0, Bytes::len);
        let mut wrote_length = false;
        for header in self.headers() {
            if header.name() == &HeaderName::ContentLength {
                if !wrote_length {
                    write!(buf, "Content-Length: {body_len}\r\n")?;
                    wrote_length = true;
                }
                continue;
            }
            write!(buf, "{header}\r\n")?;
        }
        if !wrote_length {
            write!(buf, "Content-Length: {body_len}\r\n")?;
        }
        buf.put_slice(b"\r\n");
        if let Some(body) = self.body() {
            buf.put_slice(body);
        }

        Ok(buf.freeze())
    }
}

impl From<Request> for SipMessage {
    fn from(value: Request) -> Self {
        SipMessage::Request(value)
    }
}

impl From<Response> for SipMessage {
    fn from(value: Response) -> Self {
        SipMessage::Response(value)
    }
}

/// Represents a SIP Request-Line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub uri: Uri,
}

/// A parsed SIP Request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub req_line: RequestLine,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

impl Request {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            req_line: RequestLine { method, uri },
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn method(&self) -> &Method {
        &self.req_line.method
    }

    pub fn uri(&self) -> &Uri {
        &self.req_line.uri
    }
}

/// Represents a SIP Status-Line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub code: StatusCode,
    pub reason: WireStr,
}

/// A parsed SIP Response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status_line: StatusLine,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

impl Response {
    pub fn new(code: StatusCode, reason: WireStr) -> Self {
        Self {
            status_line: StatusLine { code, reason },
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn code(&self) -> StatusCode {
        self.status_line.code
    }

    pub fn reason(&self) -> &WireStr {
        &self.status_line.reason
    }

    /// Builds a response to `request`.
    ///
    /// `Via`, `From`, `To`, `Call-ID` and `CSeq` are copied from the request
    /// and a `To` tag is added to every response but `100 Trying`.
    pub fn from_request(request: &Request, code: StatusCode, reason: Option<&str>) -> Result<Self> {
        let reason = match reason {
            Some(reason) => WireStr::from(reason.to_string()),
            None => WireStr::from_static(code.reason()),
        };
        let mut response = Response::new(code, reason);
        let headers = &request.headers;

        for via in headers.get_all(&HeaderName::Via) {
            response.headers.push(via.clone());
        }
        let from = headers
            .get(&HeaderName::From)
            .ok_or(Error::MissingRequiredHeader("From"))?;
        response.headers.push(from.clone());

        let to = headers.to_hdr().ok_or(Error::MissingRequiredHeader("To"))?;
        if code != StatusCode::TRYING && to.tag().is_none() {
            let mut to = to.clone();
            to.params.set("tag", Some(generate_tag()));
            response.headers.push(Header::name_addr(HeaderName::To, to));
        } else {
            response.headers.push(Header::name_addr(HeaderName::To, to.clone()));
        }

        for (name, required) in [(HeaderName::CallId, "Call-ID"), (HeaderName::CSeq, "CSeq")] {
            let header = headers
                .get(&name)
                .ok_or(Error::MissingRequiredHeader(required))?;
            response.headers.push(header.clone());
        }
        response.headers.push(Header::number(HeaderName::ContentLength, 0));

        Ok(response)
    }
}

fn generate_tag() -> WireStr {
    let tag: u64 = rand::rng().random();
    WireStr::from(format!("{tag:x}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    const INVITE: &[u8] = b"INVITE sip:bob@biloxi.com SIP/2.0\r\n\
Via: SIP/2.0/UDP pc33.atlanta.com;branch=z9hG4bK776asdhds\r\n\
Max-Forwards: 70\r\n\
To: Bob <sip:bob@biloxi.com>\r\n\
From: Alice <sip:alice@atlanta.com>;tag=1928301774\r\n\
Call-ID: a84b4c76e66710@pc33.atlanta.com\r\n\
CSeq: 314159 INVITE\r\n\
Content-Length: 4\r\n\r\n\
test";

    #[test]
    fn test_serialize_then_parse_is_structurally_equal() {
        let first = Parser::parse(&Bytes::from_static(INVITE)).unwrap();
        let wire = first.to_bytes().unwrap();
        let second = Parser::parse(&wire).unwrap();

        assert_eq!(first, second);
        assert_eq!(&wire[..], INVITE);
    }

    #[test]
    fn test_response_from_request_adds_to_tag() {
        let message = Parser::parse(&Bytes::from_static(INVITE)).unwrap();
        let request = message.as_request().unwrap();

        let trying = Response::from_request(request, StatusCode::TRYING, None).unwrap();
        assert!(trying.headers.to_hdr().unwrap().tag().is_none());

        let busy = Response::from_request(request, StatusCode::new(486).unwrap(), None).unwrap();
        assert!(busy.headers.to_hdr().unwrap().tag().is_some());
        assert_eq!(busy.reason(), "Busy Here");
        assert_eq!(busy.headers.call_id().unwrap(), "a84b4c76e66710@pc33.atlanta.com");
        assert_eq!(busy.headers.content_length(), Some(0));
    }

    #[test]
    fn test_content_length_tracks_body() {
        let mut message = Parser::parse(&Bytes::from_static(INVITE)).unwrap();
        if let SipMessage::Request(req) = &mut message {
            req.body = Some(Bytes::from_static(b"longer body"));
        }
        let reparsed = Parser::parse(&message.to_bytes().unwrap()).unwrap();

        assert_eq!(reparsed.headers().content_length(), Some(11));
        assert_eq!(reparsed.body().unwrap(), "longer body");
    }
}
