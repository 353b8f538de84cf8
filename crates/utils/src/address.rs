//! Address parsing and the sub-addressing rewrite.
//!
//! Every recipient of a proxied message is folded into the sender's own
//! mailbox as `sender+local=domain@sender-domain`, which lets a forwarding
//! service (such as an alias provider) route the reply back to the real
//! recipient while only ever seeing the sender's identity.

use std::{collections::HashSet, fmt::Display, str::FromStr};

/// Errors produced while parsing an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The input was empty or only whitespace.
    Empty,
    /// The address part has no `@` separator.
    MissingAt,
    /// Nothing before the `@`.
    EmptyLocalPart,
    /// Nothing after the `@`.
    EmptyDomain,
    /// An opening `<` without the closing `>` at the end of the input.
    UnclosedAngleBracket,
    /// A display name glued to the `<` without whitespace in between.
    MissingNameSeparator,
    /// A character that is not allowed inside the address part.
    UnexpectedCharacter(char),
}

impl Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::Empty => write!(f, "Empty address"),
            ParseError::MissingAt => write!(f, "Missing '@' in address"),
            ParseError::EmptyLocalPart => write!(f, "Empty local part"),
            ParseError::EmptyDomain => write!(f, "Empty domain"),
            ParseError::UnclosedAngleBracket => write!(f, "Unclosed angle bracket"),
            ParseError::MissingNameSeparator => {
                write!(f, "Display name must be followed by whitespace")
            }
            ParseError::UnexpectedCharacter(c) => write!(f, "Unexpected character {c:?}"),
        }
    }
}

impl std::error::Error for ParseError {}

/// A parsed email address, optionally carrying a display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailAddress {
    pub display_name: Option<String>,
    pub local_part: String,
    pub domain: String,
}

impl EmailAddress {
    /// Parses `[display-name WSP] <local@domain>` or a bare `local@domain`.
    ///
    /// The display name is kept verbatim (quotes included) after trimming,
    /// an empty name is treated as absent.
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let text = raw.trim();
        if text.is_empty() {
            return Err(ParseError::Empty);
        }

        let (display_name, addr_spec) = match text.find('<') {
            Some(open) => {
                let inner = text[open + 1..]
                    .strip_suffix('>')
                    .ok_or(ParseError::UnclosedAngleBracket)?;
                let name = &text[..open];
                if !name.is_empty() && !name.ends_with(char::is_whitespace) {
                    return Err(ParseError::MissingNameSeparator);
                }
                let name = name.trim();
                let display_name = (!name.is_empty()).then(|| name.to_string());
                (display_name, inner)
            }
            None => (None, text),
        };

        let (local_part, domain) = addr_spec.split_once('@').ok_or(ParseError::MissingAt)?;
        if local_part.is_empty() {
            return Err(ParseError::EmptyLocalPart);
        }
        if domain.is_empty() {
            return Err(ParseError::EmptyDomain);
        }
        if let Some(c) = local_part
            .chars()
            .chain(domain.chars())
            .find(|c| c.is_whitespace() || matches!(c, '<' | '>' | '@'))
        {
            return Err(ParseError::UnexpectedCharacter(c));
        }

        Ok(Self {
            display_name,
            local_part: local_part.to_string(),
            domain: domain.to_string(),
        })
    }

    /// Returns the bare `local@domain` form, without display name.
    pub fn address(&self) -> String {
        format!("{}@{}", self.local_part, self.domain)
    }
}

impl FromStr for EmailAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{name} <{}@{}>", self.local_part, self.domain),
            None => write!(f, "{}@{}", self.local_part, self.domain),
        }
    }
}

/// A recipient after the sub-addressing transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewrittenRecipient {
    pub display_name: Option<String>,
    pub address: String,
}

impl Display for RewrittenRecipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "{name} <{}>", self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

/// A recipient that could not be rewritten, together with its raw text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientError {
    pub raw: String,
    pub error: ParseError,
}

impl Display for RecipientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Recipient {:?} is not a valid address: {}", self.raw, self.error)
    }
}

impl std::error::Error for RecipientError {}

/// Encodes `recipient_raw` into the sender's mailbox as
/// `{sender.local}+{recipient.local}={recipient.domain}@{sender.domain}`.
///
/// # Examples
///
/// ```rust
/// use subrelay_utils::{rewrite_recipient, EmailAddress};
///
/// let sender = EmailAddress::parse("alice@example.com").unwrap();
/// let rewritten = rewrite_recipient(&sender, "Bob Smith <bob@other.org>").unwrap();
/// assert_eq!(rewritten.to_string(), "Bob Smith <alice+bob=other.org@example.com>");
/// ```
pub fn rewrite_recipient(
    sender: &EmailAddress,
    recipient_raw: &str,
) -> Result<RewrittenRecipient, ParseError> {
    let recipient = EmailAddress::parse(recipient_raw)?;
    Ok(RewrittenRecipient {
        address: format!(
            "{}+{}={}@{}",
            sender.local_part, recipient.local_part, recipient.domain, sender.domain
        ),
        display_name: recipient.display_name,
    })
}

/// Rewrites every recipient in order, one result per input.
pub fn rewrite_recipients<I, S>(
    sender: &EmailAddress,
    recipients: I,
) -> Vec<Result<RewrittenRecipient, RecipientError>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    recipients
        .into_iter()
        .map(|raw| {
            let raw = raw.as_ref();
            rewrite_recipient(sender, raw).map_err(|error| RecipientError {
                raw: raw.to_string(),
                error,
            })
        })
        .collect()
}

/// The static set of sender addresses allowed to use the proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    senders: HashSet<String>,
}

impl AllowList {
    pub fn new<I, S>(senders: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            senders: senders.into_iter().map(Into::into).collect(),
        }
    }

    /// Builds the list from a comma-separated string, trimming entries and
    /// dropping empty ones.
    pub fn from_csv(value: &str) -> Self {
        Self::new(
            value
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty()),
        )
    }

    /// Checks the address part of `sender` (display name ignored) for an
    /// exact match.
    pub fn permits(&self, sender: &EmailAddress) -> bool {
        self.senders.contains(&sender.address())
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}
