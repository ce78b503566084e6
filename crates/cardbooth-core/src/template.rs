//! `{{TOKEN}}` placeholder substitution for card markup.
//!
//! Substitution is a single left-to-right pass: substituted values are
//! never rescanned, every required token must occur exactly once, optional
//! tokens at most once, and unknown tokens are rejected.

use std::collections::HashMap;
use thiserror::Error;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TemplateError {
    #[error("required placeholder {{{{{0}}}}} is missing")]
    Missing(String),
    #[error("placeholder {{{{{0}}}}} appears {1} times")]
    Duplicate(String, usize),
    #[error("unknown placeholder {{{{{0}}}}}")]
    Unknown(String),
    #[error("unterminated placeholder at byte {0}")]
    Unterminated(usize),
}

/// Values for a template, keyed by token name (without braces).
#[derive(Debug, Default, Clone)]
pub struct Substitutions {
    values: HashMap<String, (String, bool)>,
}

impl Substitutions {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that must appear exactly once.
    pub fn required(mut self, token: &str, value: impl Into<String>) -> Self {
        self.values.insert(token.to_string(), (value.into(), true));
        self
    }

    /// A token that may appear at most once.
    pub fn optional(mut self, token: &str, value: impl Into<String>) -> Self {
        self.values.insert(token.to_string(), (value.into(), false));
        self
    }

    /// Fill `template`, returning the substituted text.
    pub fn apply(&self, template: &str) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(template.len());
        let mut counts: HashMap<&str, usize> = HashMap::new();
        let mut rest = template;
        let mut offset = 0;

        while let Some(start) = rest.find(OPEN) {
            out.push_str(&rest[..start]);
            let after = &rest[start + OPEN.len()..];
            let end = after
                .find(CLOSE)
                .ok_or(TemplateError::Unterminated(offset + start))?;
            let token = after[..end].trim();

            let (key, (value, _)) = self
                .values
                .get_key_value(token)
                .ok_or_else(|| TemplateError::Unknown(token.to_string()))?;
            out.push_str(value);
            *counts.entry(key.as_str()).or_default() += 1;

            let consumed = start + OPEN.len() + end + CLOSE.len();
            offset += consumed;
            rest = &rest[consumed..];
        }
        out.push_str(rest);

        let mut tokens: Vec<(&String, &(String, bool))> = self.values.iter().collect();
        tokens.sort_by(|a, b| a.0.cmp(b.0));
        for (token, (_, required)) in tokens {
            match counts.get(token.as_str()).copied().unwrap_or(0) {
                0 if *required => return Err(TemplateError::Missing(token.clone())),
                0 | 1 => {}
                n => return Err(TemplateError::Duplicate(token.clone(), n)),
            }
        }
        Ok(out)
    }
}

/// Escape text for inclusion in XML/SVG/HTML markup.
pub fn escape_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fills_each_token() {
        let subs = Substitutions::new().required("NAME", "ALEX").required("OVR", "77");
        let out = subs.apply("<t>{{NAME}}</t><o>{{ OVR }}</o>").unwrap();
        assert_eq!(out, "<t>ALEX</t><o>77</o>");
    }

    #[test]
    fn test_values_are_not_rescanned() {
        let subs = Substitutions::new().required("NAME", "{{OVR}}").required("OVR", "1");
        assert_eq!(subs.apply("{{NAME}} {{OVR}}").unwrap(), "{{OVR}} 1");
    }

    #[test]
    fn test_missing_required() {
        let subs = Substitutions::new().required("NAME", "A").required("OVR", "1");
        let missing = TemplateError::Missing("OVR".into());
        assert_eq!(subs.apply("{{NAME}}"), Err(missing));
    }

    #[test]
    fn test_duplicate_rejected() {
        let subs = Substitutions::new().required("NAME", "A");
        assert_eq!(
            subs.apply("{{NAME}}{{NAME}}"),
            Err(TemplateError::Duplicate("NAME".into(), 2))
        );
    }

    #[test]
    fn test_unknown_rejected() {
        let subs = Substitutions::new().required("NAME", "A");
        assert_eq!(
            subs.apply("{{NAME}} {{CLUB}}"),
            Err(TemplateError::Unknown("CLUB".into()))
        );
    }

    #[test]
    fn test_optional_may_be_absent() {
        let subs = Substitutions::new().required("NAME", "A").optional("PAC_LABEL", "PAC");
        assert_eq!(subs.apply("{{NAME}}").unwrap(), "A");
    }

    #[test]
    fn test_unterminated() {
        let subs = Substitutions::new().required("NAME", "A");
        assert_eq!(subs.apply("ab {{NAME"), Err(TemplateError::Unterminated(3)));
    }

    #[test]
    fn test_error_message_shows_braces() {
        assert_eq!(
            TemplateError::Missing("OVR".into()).to_string(),
            "required placeholder {{OVR}} is missing"
        );
    }

    #[test]
    fn test_escape_markup() {
        let escaped = escape_markup("R&D <\"x\">");
        assert_eq!(escaped, "R&amp;D &lt;&quot;x&quot;&gt;");
    }
}
