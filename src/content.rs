//! Decoded payload classification
//!
//! Classification is a pure function of the decoded text. The first matching
//! prefix wins; anything unrecognised is plain text.

use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Kind of content carried by a QR payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Url,
    Text,
    Wifi,
    Contact,
    Event,
    Sms,
    Tel,
    Email,
    Geo,
    /// Tag read back from storage that this version does not know about
    #[serde(other)]
    Unknown,
}

/// Prefix table, checked in order
const PREFIXES: &[(&str, ContentType)] = &[
    ("http:", ContentType::Url),
    ("https:", ContentType::Url),
    ("WIFI:", ContentType::Wifi),
    ("BEGIN:VCARD", ContentType::Contact),
    ("BEGIN:VEVENT", ContentType::Event),
    ("sms:", ContentType::Sms),
    ("tel:", ContentType::Tel),
    ("mailto:", ContentType::Email),
    ("geo:", ContentType::Geo),
];

impl ContentType {
    /// Classify a decoded payload
    pub fn classify(data: &str) -> Self {
        PREFIXES
            .iter()
            .find(|(prefix, _)| data.starts_with(prefix))
            .map(|(_, kind)| *kind)
            .unwrap_or(ContentType::Text)
    }

    /// Lowercase tag used in storage and output
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Url => "url",
            ContentType::Text => "text",
            ContentType::Wifi => "wifi",
            ContentType::Contact => "contact",
            ContentType::Event => "event",
            ContentType::Sms => "sms",
            ContentType::Tel => "tel",
            ContentType::Email => "email",
            ContentType::Geo => "geo",
            ContentType::Unknown => "unknown",
        }
    }

    /// Whether the payload can be handed to a browser
    pub fn is_link(&self) -> bool {
        matches!(self, ContentType::Url)
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a payload as an absolute URL suitable for opening
pub fn parse_url(data: &str) -> Result<Url, url::ParseError> {
    Url::parse(data.trim())
}

/// Render an epoch-millisecond timestamp for display, e.g. `Mar 4, 2025, 09:30`
pub fn format_timestamp(timestamp_ms: i64) -> String {
    match Local.timestamp_millis_opt(timestamp_ms).single() {
        Some(time) => time.format("%b %-d, %Y, %H:%M").to_string(),
        None => timestamp_ms.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("https://example.com", ContentType::Url)]
    #[case("http://example.com/path?q=1", ContentType::Url)]
    #[case("tel:12345", ContentType::Tel)]
    #[case("mailto:a@b.com", ContentType::Email)]
    #[case("geo:12.3,45.6", ContentType::Geo)]
    #[case("BEGIN:VCARD\nVERSION:3.0\nFN:Jane\nEND:VCARD", ContentType::Contact)]
    #[case("BEGIN:VEVENT\nSUMMARY:Launch\nEND:VEVENT", ContentType::Event)]
    #[case("WIFI:S:home;T:WPA;P:secret;;", ContentType::Wifi)]
    #[case("sms:+15551234:hi", ContentType::Sms)]
    #[case("hello world", ContentType::Text)]
    #[case("", ContentType::Text)]
    fn test_classify(#[case] input: &str, #[case] expected: ContentType) {
        assert_eq!(ContentType::classify(input), expected);
    }

    #[test]
    fn test_classify_is_case_sensitive() {
        assert_eq!(ContentType::classify("HTTPS://EXAMPLE.COM"), ContentType::Text);
        assert_eq!(ContentType::classify("wifi:S:home;;"), ContentType::Text);
    }

    #[test]
    fn test_unknown_tag_deserializes_to_unknown() {
        let kind: ContentType = serde_json::from_str("\"certificate\"").unwrap();
        assert_eq!(kind, ContentType::Unknown);

        let kind: ContentType = serde_json::from_str("\"email\"").unwrap();
        assert_eq!(kind, ContentType::Email);
    }

    #[test]
    fn test_display_matches_serde_tag() {
        for kind in [ContentType::Url, ContentType::Contact, ContentType::Unknown] {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
    }

    #[test]
    fn test_parse_url() {
        assert!(parse_url("https://example.com/cert/42").is_ok());
        assert!(parse_url("  https://example.com ").is_ok());
        assert!(parse_url("not a url").is_err());
        assert!(parse_url("http://").is_err());
    }

    #[test]
    fn test_format_timestamp() {
        let formatted = format_timestamp(1_700_000_000_000);
        assert!(formatted.contains("2023"));
        assert!(formatted.contains(':'));
    }
}
