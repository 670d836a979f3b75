//! SIP headers.
//!
//! Headers keep their raw value as a [`WireStr`] view of the received buffer.
//! The core headers are parsed into typed values on first access only.

use std::fmt;
use std::sync::OnceLock;

use util::WireStr;

use crate::error::{Error, Result};
use crate::parser::Parser;

use super::{CSeq, NameAddr, Via};

/// The name of a SIP header.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HeaderName {
    Via,
    From,
    To,
    CallId,
    CSeq,
    Contact,
    ContentLength,
    ContentType,
    MaxForwards,
    Route,
    RecordRoute,
    Supported,
    Subject,
    /// Any other header, with the name as found on the wire.
    Other(WireStr),
}

impl HeaderName {
    /// Maps a wire name, full or compact form, case-insensitively.
    pub fn from_wire(name: WireStr) -> Self {
        const KNOWN: [(&str, Option<&str>, HeaderName); 13] = [
            ("Via", Some("v"), HeaderName::Via),
            ("From", Some("f"), HeaderName::From),
            ("To", Some("t"), HeaderName::To),
            ("Call-ID", Some("i"), HeaderName::CallId),
            ("CSeq", None, HeaderName::CSeq),
            ("Contact", Some("m"), HeaderName::Contact),
            ("Content-Length", Some("l"), HeaderName::ContentLength),
            ("Content-Type", Some("c"), HeaderName::ContentType),
            ("Max-Forwards", None, HeaderName::MaxForwards),
            ("Route", None, HeaderName::Route),
            ("Record-Route", None, HeaderName::RecordRoute),
            ("Supported", Some("k"), HeaderName::Supported),
            ("Subject", Some("s"), HeaderName::Subject),
        ];

        KNOWN
            .into_iter()
            .find(|(full, short, _)| {
                name.eq_ignore_case(full) || short.is_some_and(|s| name.eq_ignore_case(s))
            })
            .map(|(_, _, known)| known)
            .unwrap_or(HeaderName::Other(name))
    }

    pub fn as_str(&self) -> &str {
        match self {
            HeaderName::Via => "Via",
            HeaderName::From => "From",
            HeaderName::To => "To",
            HeaderName::CallId => "Call-ID",
            HeaderName::CSeq => "CSeq",
            HeaderName::Contact => "Contact",
            HeaderName::ContentLength => "Content-Length",
            HeaderName::ContentType => "Content-Type",
            HeaderName::MaxForwards => "Max-Forwards",
            HeaderName::Route => "Route",
            HeaderName::RecordRoute => "Record-Route",
            HeaderName::Supported => "Supported",
            HeaderName::Subject => "Subject",
            HeaderName::Other(name) => name.as_str().unwrap_or("X-Invalid"),
        }
    }

    /// Headers whose comma separated values are split into one [`Header`] each.
    pub fn is_list(&self) -> bool {
        matches!(
            self,
            HeaderName::Via
                | HeaderName::Contact
                | HeaderName::Route
                | HeaderName::RecordRoute
                | HeaderName::Supported
        )
    }
}

impl fmt::Display for HeaderName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The typed value of a core header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypedValue {
    Via(Via),
    NameAddr(NameAddr),
    CSeq(CSeq),
    Number(u32),
}

/// A single SIP header.
#[derive(Clone)]
pub struct Header {
    name: HeaderName,
    value: WireStr,
    typed: OnceLock<Option<TypedValue>>,
}

impl Header {
    /// Creates a header from its raw value, parsed lazily.
    pub fn new(name: HeaderName, value: WireStr) -> Self {
        Self {
            name,
            value,
            typed: OnceLock::new(),
        }
    }

    /// Creates a header from a typed value.
    pub fn typed(name: HeaderName, typed: TypedValue) -> Self {
        let value = match &typed {
            TypedValue::Via(via) => via.to_string(),
            TypedValue::NameAddr(addr) => addr.to_string(),
            TypedValue::CSeq(cseq) => cseq.to_string(),
            TypedValue::Number(n) => n.to_string(),
        };
        Self {
            name,
            value: value.into(),
            typed: OnceLock::from(Some(typed)),
        }
    }

    pub fn via(via: Via) -> Self {
        Self::typed(HeaderName::Via, TypedValue::Via(via))
    }

    pub fn name_addr(name: HeaderName, addr: NameAddr) -> Self {
        Self::typed(name, TypedValue::NameAddr(addr))
    }

    pub fn number(name: HeaderName, n: u32) -> Self {
        Self::typed(name, TypedValue::Number(n))
    }

    pub fn name(&self) -> &HeaderName {
        &self.name
    }

    pub fn value(&self) -> &WireStr {
        &self.value
    }

    /// Returns the typed value, parsing it on first call.
    ///
    /// `None` for headers without a typed form or with a malformed value.
    pub fn typed_value(&self) -> Option<&TypedValue> {
        self.typed
            .get_or_init(|| {
                let parsed = match self.name {
                    HeaderName::Via => Parser::parse_via(&self.value).map(TypedValue::Via),
                    HeaderName::From
                    | HeaderName::To
                    | HeaderName::Contact
                    | HeaderName::Route
                    | HeaderName::RecordRoute => {
                        Parser::parse_name_addr(&self.value).map(TypedValue::NameAddr)
                    }
                    HeaderName::CSeq => Parser::parse_cseq(&self.value).map(TypedValue::CSeq),
                    HeaderName::ContentLength | HeaderName::MaxForwards => {
                        Parser::parse_number(&self.value).map(TypedValue::Number)
                    }
                    _ => return None,
                };
                match parsed {
                    Ok(typed) => Some(typed),
                    Err(err) => {
                        log::debug!("Malformed {} header '{}': {}", self.name, self.value, err);
                        None
                    }
                }
            })
            .as_ref()
    }

    pub fn as_via(&self) -> Option<&Via> {
        match self.typed_value()? {
            TypedValue::Via(via) => Some(via),
            _ => None,
        }
    }

    pub fn as_name_addr(&self) -> Option<&NameAddr> {
        match self.typed_value()? {
            TypedValue::NameAddr(addr) => Some(addr),
            _ => None,
        }
    }

    pub fn as_cseq(&self) -> Option<&CSeq> {
        match self.typed_value()? {
            TypedValue::CSeq(cseq) => Some(cseq),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<u32> {
        match self.typed_value()? {
            TypedValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl PartialEq for Header {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.value == other.value
    }
}

impl Eq for Header {}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {:?}", self.name, self.value)
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// The ordered headers of a SIP message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Headers(Vec<Header>);

impl Headers {
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, header: Header) {
        self.0.push(header);
    }

    /// Inserts `header` before every other header of the same name.
    pub fn push_front(&mut self, header: Header) {
        let index = self
            .0
            .iter()
            .position(|h| h.name == header.name)
            .unwrap_or(self.0.len());
        self.0.insert(index, header);
    }

    /// Replaces every header named like `header` with it.
    pub fn set(&mut self, header: Header) {
        match self.0.iter().position(|h| h.name == header.name) {
            Some(index) => {
                self.0.retain(|h| h.name != header.name);
                self.0.insert(index.min(self.0.len()), header);
            }
            None => self.0.push(header),
        }
    }

    pub fn get(&self, name: &HeaderName) -> Option<&Header> {
        self.0.iter().find(|h| &h.name == name)
    }

    pub fn get_all<'a>(&'a self, name: &'a HeaderName) -> impl Iterator<Item = &'a Header> + 'a {
        self.0.iter().filter(move |h| &h.name == name)
    }

    /// Removes and returns the first header named `name`.
    pub fn remove_first(&mut self, name: &HeaderName) -> Option<Header> {
        let index = self.0.iter().position(|h| &h.name == name)?;
        Some(self.0.remove(index))
    }

    pub fn remove_all(&mut self, name: &HeaderName) {
        self.0.retain(|h| &h.name != name);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Header> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn top_via(&self) -> Option<&Via> {
        self.get(&HeaderName::Via)?.as_via()
    }

    pub fn call_id(&self) -> Option<&WireStr> {
        self.get(&HeaderName::CallId).map(Header::value)
    }

    pub fn cseq(&self) -> Option<&CSeq> {
        self.get(&HeaderName::CSeq)?.as_cseq()
    }

    pub fn from_hdr(&self) -> Option<&NameAddr> {
        self.get(&HeaderName::From)?.as_name_addr()
    }

    pub fn to_hdr(&self) -> Option<&NameAddr> {
        self.get(&HeaderName::To)?.as_name_addr()
    }

    pub fn content_length(&self) -> Option<u32> {
        self.get(&HeaderName::ContentLength)?.as_number()
    }

    pub fn max_forwards(&self) -> Option<u32> {
        self.get(&HeaderName::MaxForwards)?.as_number()
    }
}

impl From<Vec<Header>> for Headers {
    fn from(headers: Vec<Header>) -> Self {
        Self(headers)
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = &'a Header;
    type IntoIter = std::slice::Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// The headers every request and response must carry.
#[derive(Debug, Clone)]
pub struct MandatoryHeaders {
    pub via: Via,
    pub from: NameAddr,
    pub to: NameAddr,
    pub call_id: WireStr,
    pub cseq: CSeq,
}

impl MandatoryHeaders {
    pub fn from_headers(headers: &Headers) -> Result<Self> {
        let via = headers.top_via().ok_or(Error::MissingRequiredHeader("Via"))?;
        let from = headers.from_hdr().ok_or(Error::MissingRequiredHeader("From"))?;
        let to = headers.to_hdr().ok_or(Error::MissingRequiredHeader("To"))?;
        let call_id = headers
            .call_id()
            .ok_or(Error::MissingRequiredHeader("Call-ID"))?;
        let cseq = headers.cseq().ok_or(Error::MissingRequiredHeader("CSeq"))?;

        Ok(Self {
            via: via.clone(),
            from: from.clone(),
            to: to.clone(),
            call_id: call_id.clone(),
            cseq: cseq.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_names() {
        assert_eq!(HeaderName::from_wire("v".into()), HeaderName::Via);
        assert_eq!(HeaderName::from_wire("L".into()), HeaderName::ContentLength);
        assert_eq!(HeaderName::from_wire("call-id".into()), HeaderName::CallId);
        assert_eq!(HeaderName::from_wire("k".into()), HeaderName::Supported);
        assert_matches!(HeaderName::from_wire("X-Custom".into()), HeaderName::Other(_));
    }

    #[test]
    fn test_lazy_typed_access() {
        let header = Header::new(HeaderName::CSeq, "4711 INVITE".into());
        let cseq = header.as_cseq().unwrap();

        assert_eq!(cseq.seq, 4711);
        assert!(cseq.method.is_invite());
        assert!(header.as_via().is_none());
    }

    #[test]
    fn test_malformed_value_has_no_typed_form() {
        let header = Header::new(HeaderName::MaxForwards, "seventy".into());

        assert_eq!(header.as_number(), None);
        assert_eq!(header.value(), "seventy");
    }

    #[test]
    fn test_missing_mandatory_header() {
        let headers = Headers::from(vec![
            Header::new(HeaderName::Via, "SIP/2.0/UDP 10.0.0.1;branch=z9hG4bK1".into()),
            Header::new(HeaderName::From, "<sip:a@b>;tag=1".into()),
            Header::new(HeaderName::To, "<sip:c@d>".into()),
            Header::new(HeaderName::CSeq, "1 OPTIONS".into()),
        ]);

        assert_matches!(
            MandatoryHeaders::from_headers(&headers),
            Err(Error::MissingRequiredHeader("Call-ID"))
        );
    }

    #[test]
    fn test_push_front_keeps_header_group() {
        let mut headers = Headers::from(vec![
            Header::new(HeaderName::CallId, "abc".into()),
            Header::new(HeaderName::Via, "SIP/2.0/UDP a".into()),
        ]);
        headers.push_front(Header::new(HeaderName::Via, "SIP/2.0/UDP b".into()));

        let vias: Vec<_> = headers.get_all(&HeaderName::Via).map(|h| h.value().to_string()).collect();
        assert_eq!(vias, ["SIP/2.0/UDP b", "SIP/2.0/UDP a"]);
    }
}
