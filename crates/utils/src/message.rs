//! Message representation used by the rewriting pipeline.
//!
//! [`MailMessage`] keeps the header section as a list of raw fields and
//! the body as an opaque byte slice of the original content. Only header
//! fields that are explicitly replaced change on serialization, every other
//! byte is written back exactly as received.

use crate::{split_header_section, HeaderField};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailMessage {
    /// Ordered header fields (duplicates such as `Received` preserved).
    headers: Vec<HeaderField>,

    /// Blank line separating headers from body, as received.
    separator: Vec<u8>,

    /// Body bytes, never modified.
    body: Vec<u8>,
}

impl MailMessage {
    /// Parses raw message bytes, reading only the header section.
    pub fn parse(raw: &[u8]) -> Self {
        let section = split_header_section(raw);
        let separator = section
            .separator
            .map(|range| raw[range].to_vec())
            .unwrap_or_default();
        Self {
            headers: section.fields,
            separator,
            body: raw[section.body_offset..].to_vec(),
        }
    }

    /// Returns the first header value matching `name` (case-insensitive).
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|field| field.is(name))
            .map(HeaderField::value)
    }

    /// Returns a reference to the ordered header list.
    pub fn headers(&self) -> &[HeaderField] {
        &self.headers
    }

    /// Returns the message body after the header section.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Replaces the value of header `name` entirely.
    ///
    /// The first occurrence is rewritten in place and any later occurrence
    /// is dropped, so the message ends up with exactly one such field. When
    /// the header is absent it is appended to the header section.
    pub fn replace_header(&mut self, name: &str, value: &str) {
        match self.headers.iter().position(|field| field.is(name)) {
            Some(index) => {
                let line_ending = match self.headers[index].line_ending() {
                    b"" => b"\r\n".as_slice(),
                    ending => ending,
                };
                self.headers[index] = HeaderField::new(name, value, line_ending);
                let mut position = 0;
                self.headers.retain(|field| {
                    let keep = position <= index || !field.is(name);
                    position += 1;
                    keep
                });
            }
            None => {
                let line_ending = match self.headers.last_mut() {
                    Some(last) if last.line_ending().is_empty() => {
                        // Unterminated last field, close it before appending
                        last.raw.extend_from_slice(b"\r\n");
                        b"\r\n".as_slice()
                    }
                    Some(last) => last.line_ending(),
                    None => b"\r\n".as_slice(),
                };
                self.headers.push(HeaderField::new(name, value, line_ending));
            }
        }
    }

    /// Serializes the message: header fields, original separator and the
    /// untouched body bytes.
    ///
    /// When the original had no blank separator line but does have a body,
    /// one is inserted so the body is not read as a header continuation.
    pub fn to_bytes(&self) -> Vec<u8> {
        let headers_len: usize = self.headers.iter().map(|field| field.raw.len()).sum();
        let mut raw = Vec::with_capacity(headers_len + 2 + self.body.len());

        for field in &self.headers {
            raw.extend_from_slice(&field.raw);
        }

        if !self.separator.is_empty() {
            raw.extend_from_slice(&self.separator);
        } else if !self.headers.is_empty() && !self.body.is_empty() {
            raw.extend_from_slice(b"\r\n");
        }

        raw.extend_from_slice(&self.body);
        raw
    }
}
