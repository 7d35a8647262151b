//! Control-socket endpoint discovery from the live watch page.
//!
//! The platform embeds its page bootstrap data as a JSON blob in an HTML
//! attribute; the control-socket URL lives inside that blob. Extraction is
//! behind the [`EndpointExtractor`] trait so the session controller never
//! depends on a concrete parsing strategy; embedders in other environments
//! can plug in a DOM-based extractor.

use std::fmt;

use serde_json::Value;

/// Extracts the control-socket URL from a live watch-page document.
pub trait EndpointExtractor: Send + Sync {
    /// Extract the control-socket URL from `html`.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError`] if the document does not carry the
    /// expected embedded data. Fatal to `connect()`.
    fn extract_socket_url(&self, html: &str) -> Result<String, NegotiationError>;
}

/// The watch-page document did not yield a control-socket URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationError(pub String);

impl fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "endpoint negotiation failed: {}", self.0)
    }
}

impl std::error::Error for NegotiationError {}

/// Default extractor: reads the `data-props` attribute of the
/// `embedded-data` element and follows `site.relive.webSocketUrl`.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmbeddedDataExtractor;

impl EndpointExtractor for EmbeddedDataExtractor {
    fn extract_socket_url(&self, html: &str) -> Result<String, NegotiationError> {
        let props_json = embedded_props(html)
            .ok_or_else(|| NegotiationError("no embedded-data props in document".into()))?;

        let props: Value = serde_json::from_str(&props_json)
            .map_err(|e| NegotiationError(format!("embedded props are not valid JSON: {e}")))?;

        match props["site"]["relive"]["webSocketUrl"].as_str() {
            Some(url) if !url.is_empty() => Ok(url.to_string()),
            _ => Err(NegotiationError(
                "embedded props carry no webSocketUrl".into(),
            )),
        }
    }
}

/// Locate the `data-props` attribute value on the `embedded-data` element
/// and return it with HTML entities unescaped.
fn embedded_props(html: &str) -> Option<String> {
    let marker = html.find("id=\"embedded-data\"")?;
    // The attribute may precede or follow the id within the same tag.
    let tag_start = html[..marker].rfind('<')?;
    let rest = &html[tag_start..];

    // '>' is legal inside a quoted attribute value, so the tag only ends at
    // a '>' seen outside quotes.
    let mut in_quote = false;
    let mut tag_end = None;
    for (i, c) in rest.char_indices() {
        match c {
            '"' => in_quote = !in_quote,
            '>' if !in_quote => {
                tag_end = Some(i);
                break;
            }
            _ => {}
        }
    }
    let tag = &rest[..tag_end?];

    let attr = tag.find("data-props=\"")? + "data-props=\"".len();
    let value_end = attr + tag[attr..].find('"')?;
    Some(unescape_entities(&tag[attr..value_end]))
}

/// Unescape the HTML entities an attribute-embedded JSON blob can contain.
fn unescape_entities(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn watch_page(props: &str) -> String {
        let escaped = props
            .replace('&', "&amp;")
            .replace('"', "&quot;");
        format!(
            "<!DOCTYPE html><html><body>\
             <div id=\"container\"></div>\
             <script id=\"embedded-data\" data-props=\"{escaped}\"></script>\
             </body></html>"
        )
    }

    #[test]
    fn test_extracts_socket_url() {
        let html = watch_page(
            r#"{"site":{"relive":{"webSocketUrl":"wss://ws.example/watch/lv1?k=a&b=c"}}}"#,
        );
        let url = EmbeddedDataExtractor.extract_socket_url(&html).unwrap();
        assert_eq!(url, "wss://ws.example/watch/lv1?k=a&b=c");
    }

    #[test]
    fn test_attribute_before_id() {
        let html = r#"<div data-props="{&quot;site&quot;:{&quot;relive&quot;:{&quot;webSocketUrl&quot;:&quot;wss://ws.example/a&quot;}}}" id="embedded-data"></div>"#;
        let url = EmbeddedDataExtractor.extract_socket_url(html).unwrap();
        assert_eq!(url, "wss://ws.example/a");
    }

    #[test]
    fn test_angle_bracket_inside_attribute_value() {
        // Unescaped '>' in the props JSON must not truncate the tag.
        let html = watch_page(
            r#"{"note":"5 > 3","site":{"relive":{"webSocketUrl":"wss://ws.example/b"}}}"#,
        );
        let url = EmbeddedDataExtractor.extract_socket_url(&html).unwrap();
        assert_eq!(url, "wss://ws.example/b");
    }

    #[test]
    fn test_missing_element_is_fatal() {
        let err = EmbeddedDataExtractor
            .extract_socket_url("<html><body>nothing here</body></html>")
            .unwrap_err();
        assert!(err.0.contains("no embedded-data"));
    }

    #[test]
    fn test_missing_url_is_fatal() {
        let html = watch_page(r#"{"site":{"relive":{}}}"#);
        assert!(EmbeddedDataExtractor.extract_socket_url(&html).is_err());
    }

    #[test]
    fn test_invalid_json_is_fatal() {
        let html = r#"<div id="embedded-data" data-props="not json"></div>"#;
        let err = EmbeddedDataExtractor.extract_socket_url(html).unwrap_err();
        assert!(err.0.contains("not valid JSON"));
    }
}
