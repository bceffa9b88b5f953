//! XML wire form of `<body/>` elements.
//!
//! BOSH wraps every HTTP request and response in a single `<body/>` element
//! in the `http://jabber.org/protocol/httpbind` namespace.  The payload is
//! arbitrary XML and is carried through verbatim; only the body element's
//! own attributes are interpreted.

use std::fmt::Write as _;

use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};

use crate::body::Body;
use crate::error::{BoshError, Result};

/// The BOSH content namespace.
pub const HTTPBIND_NS: &str = "http://jabber.org/protocol/httpbind";

/// Serialize a body to its wire form.
pub fn body_to_xml(body: &Body) -> String {
    let mut out = String::with_capacity(64 + body.payload().len());
    out.push_str("<body");
    for (name, value) in body.attributes() {
        let _ = write!(out, " {}=\"{}\"", name, escape(value.as_str()));
    }
    let _ = write!(out, " xmlns=\"{HTTPBIND_NS}\"");
    if body.payload().is_empty() {
        out.push_str("/>");
    } else {
        out.push('>');
        out.push_str(body.payload());
        out.push_str("</body>");
    }
    out
}

/// Parse a wire-form `<body/>` element.
///
/// The top-level element must be `body`; its attributes become the body's
/// attribute map (the `xmlns` declarations are not attributes in the BOSH
/// sense and are dropped) and everything between the start and end tags is
/// captured verbatim as the payload.
pub fn body_from_xml(xml: &str) -> Result<Body> {
    let mut reader = Reader::from_str(xml);

    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Decl(_) | Event::Comment(_) | Event::PI(_) => continue,
            Event::Text(text) if text.as_ref().iter().all(u8::is_ascii_whitespace) => continue,
            Event::Start(start) => {
                let mut builder = collect_attrs(&start)?;
                let payload = reader
                    .read_text(start.name())
                    .map_err(malformed)?
                    .into_owned();
                builder = builder.payload(payload);
                return Ok(builder.build());
            }
            Event::Empty(start) => {
                return Ok(collect_attrs(&start)?.build());
            }
            Event::Eof => {
                return Err(BoshError::Protocol("empty document".into()));
            }
            other => {
                return Err(BoshError::Protocol(format!(
                    "unexpected content before body element: {other:?}"
                )));
            }
        }
    }
}

fn collect_attrs(start: &BytesStart<'_>) -> Result<crate::body::BodyBuilder> {
    if start.local_name().as_ref() != b"body" {
        return Err(BoshError::Protocol(format!(
            "expected body element, found {:?}",
            String::from_utf8_lossy(start.name().as_ref())
        )));
    }

    let mut builder = Body::builder();
    for attribute in start.attributes() {
        let attribute = attribute.map_err(malformed)?;
        let name = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
        if name == "xmlns" || name.starts_with("xmlns:") {
            continue;
        }
        let value = attribute.unescape_value().map_err(malformed)?.into_owned();
        builder = builder.attribute(&name, value);
    }
    Ok(builder)
}

fn malformed(err: impl std::fmt::Display) -> BoshError {
    BoshError::Protocol(format!("malformed body: {err}"))
}
