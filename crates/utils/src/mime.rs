use std::ops::Range;

/// A single header field as it appears on the wire.
///
/// `raw` holds the exact original bytes of the field, continuation lines
/// and line terminators included, so that untouched fields are written
/// back byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub raw: Vec<u8>,
}

impl HeaderField {
    /// Builds a new field terminated by `line_ending`.
    pub fn new(name: &str, value: &str, line_ending: &[u8]) -> Self {
        let mut raw = Vec::with_capacity(name.len() + value.len() + 2 + line_ending.len());
        raw.extend_from_slice(name.as_bytes());
        raw.extend_from_slice(b": ");
        raw.extend_from_slice(value.as_bytes());
        raw.extend_from_slice(line_ending);
        Self {
            name: name.to_string(),
            raw,
        }
    }

    /// Returns the unfolded, trimmed value of the field.
    pub fn value(&self) -> String {
        let text = String::from_utf8_lossy(&self.raw);
        let value = text
            .split_once(':')
            .map(|(_, value)| value)
            .unwrap_or_default();
        value
            .split(['\r', '\n'])
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Returns the terminator of the field's last line (CRLF, LF or none).
    pub fn line_ending(&self) -> &'static [u8] {
        if self.raw.ends_with(b"\r\n") {
            b"\r\n"
        } else if self.raw.ends_with(b"\n") {
            b"\n"
        } else {
            b""
        }
    }

    /// Whether the field name matches `name`, ignoring ASCII case.
    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

/// Result of splitting raw message bytes into headers and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderSection {
    /// Header fields in their original order.
    pub fields: Vec<HeaderField>,
    /// Byte range of the blank separator line, if there was one.
    pub separator: Option<Range<usize>>,
    /// Offset of the first body byte.
    pub body_offset: usize,
}

/// Splits raw message bytes into its header fields and the body offset.
///
/// Only the header section is inspected, the body is never decoded. The
/// section ends at the first blank line, or at the first line that is
/// neither a `name: value` field nor a continuation of the previous one
/// (that line then starts the body, and there is no separator).
///
/// # Examples
///
/// ```rust
/// let raw = b"From: alice@example.com\r\nSubject: Hi\r\n there\r\n\r\nHello!";
/// let section = subrelay_utils::split_header_section(raw);
/// assert_eq!(section.fields.len(), 2);
/// assert_eq!(section.fields[0].name, "From");
/// assert_eq!(section.fields[1].value(), "Hi there");
/// assert_eq!(&raw[section.body_offset..], b"Hello!");
/// ```
///
/// A message without headers is all body:
///
/// ```rust
/// let section = subrelay_utils::split_header_section(b"just text\r\n");
/// assert!(section.fields.is_empty());
/// assert_eq!(section.body_offset, 0);
/// ```
pub fn split_header_section(raw: &[u8]) -> HeaderSection {
    let mut fields: Vec<HeaderField> = Vec::new();
    let mut separator = None;
    let mut pos = 0;

    while pos < raw.len() {
        let end = raw[pos..]
            .iter()
            .position(|&b| b == b'\n')
            .map(|i| pos + i + 1)
            .unwrap_or(raw.len());
        let line = &raw[pos..end];

        if line == b"\r\n" || line == b"\n" {
            separator = Some(pos..end);
            pos = end;
            break;
        }

        if line[0] == b' ' || line[0] == b'\t' {
            match fields.last_mut() {
                Some(field) => {
                    field.raw.extend_from_slice(line);
                    pos = end;
                    continue;
                }
                None => break,
            }
        }

        match field_name(line) {
            Some(name) => fields.push(HeaderField {
                name,
                raw: line.to_vec(),
            }),
            None => break,
        }
        pos = end;
    }

    HeaderSection {
        fields,
        separator,
        body_offset: pos,
    }
}

/// Returns the field name when `line` starts with `name:`, where the name
/// is made of printable US-ASCII characters other than the colon.
fn field_name(line: &[u8]) -> Option<String> {
    let colon = line.iter().position(|&b| b == b':')?;
    let name = &line[..colon];
    if name.is_empty() || !name.iter().all(|&b| (33..=126).contains(&b)) {
        return None;
    }
    Some(String::from_utf8_lossy(name).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_crlf_message() {
        let raw = b"From: a@b.com\r\nTo: c@d.com\r\n\r\nBody\r\n";
        let section = split_header_section(raw);
        assert_eq!(section.fields.len(), 2);
        assert_eq!(section.fields[0].raw, b"From: a@b.com\r\n");
        assert_eq!(section.separator, Some(28..30));
        assert_eq!(&raw[section.body_offset..], b"Body\r\n");
    }

    #[test]
    fn test_split_lf_message() {
        let raw = b"Subject: Hi\n\nBody";
        let section = split_header_section(raw);
        assert_eq!(section.fields.len(), 1);
        assert_eq!(section.fields[0].line_ending(), b"\n");
        assert_eq!(&raw[section.body_offset..], b"Body");
    }

    #[test]
    fn test_split_headers_only() {
        let raw = b"Subject: Hi\r\nX-Test: 1";
        let section = split_header_section(raw);
        assert_eq!(section.fields.len(), 2);
        assert_eq!(section.fields[1].line_ending(), b"");
        assert_eq!(section.separator, None);
        assert_eq!(section.body_offset, raw.len());
    }

    #[test]
    fn test_split_stops_at_non_header_line() {
        let raw = b"Subject: Hi\r\nnot a header\r\nmore";
        let section = split_header_section(raw);
        assert_eq!(section.fields.len(), 1);
        assert_eq!(section.separator, None);
        assert_eq!(&raw[section.body_offset..], b"not a header\r\nmore");
    }

    #[test]
    fn test_name_with_space_is_not_a_header() {
        let section = split_header_section(b"Subject : Hi\r\n\r\n");
        assert!(section.fields.is_empty());
        assert_eq!(section.body_offset, 0);
    }

    #[test]
    fn test_leading_continuation_is_body() {
        let section = split_header_section(b" folded\r\nSubject: Hi\r\n");
        assert!(section.fields.is_empty());
        assert_eq!(section.body_offset, 0);
    }

    #[test]
    fn test_folded_value() {
        let section = split_header_section(b"To: a@b.com,\r\n\tc@d.com\r\n\r\n");
        assert_eq!(section.fields.len(), 1);
        assert_eq!(section.fields[0].value(), "a@b.com, c@d.com");
    }

    #[test]
    fn test_non_utf8_body_untouched() {
        let raw = b"Subject: Hi\r\n\r\n\xff\xfe\x00binary";
        let section = split_header_section(raw);
        assert_eq!(&raw[section.body_offset..], b"\xff\xfe\x00binary");
    }

    #[test]
    fn test_header_field_new() {
        let field = HeaderField::new("From", "Relay <relay@example.net>", b"\r\n");
        assert_eq!(field.raw, b"From: Relay <relay@example.net>\r\n");
        assert_eq!(field.value(), "Relay <relay@example.net>");
        assert!(field.is("from"));
    }
}
