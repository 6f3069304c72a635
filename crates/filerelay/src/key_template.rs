//! Destination key prefixes with timestamp placeholders.
//!
//! A prefix such as `logs/!{timestamp:YYYY}/!{timestamp:MM}` is filled from
//! the rotation timestamp encoded in the file name (`app.2024-03-01_10-00.gz`),
//! not from the time of upload. Supported placeholders:
//!
//! | Long form            | Short form | Field  |
//! |----------------------|------------|--------|
//! | `!{timestamp:YYYY}`  | `!{Y}`     | year   |
//! | `!{timestamp:MM}`    | `!{M}`     | month  |
//! | `!{timestamp:dd}`    | `!{D}`     | day    |
//! | `!{timestamp:HH}`    | `!{H}`     | hour   |
//! | `!{timestamp:mm}`    | `!{m}`     | minute |
//!
//! Substitution is all-or-nothing: when the file name does not carry every
//! field the template uses, the prefix is used literally.

use crate::error::{RelayError, Result};
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Year,
    Month,
    Day,
    Hour,
    Minute,
}

impl Field {
    fn parse(token: &str) -> Option<Self> {
        match token {
            "timestamp:YYYY" | "Y" => Some(Field::Year),
            "timestamp:MM" | "M" => Some(Field::Month),
            "timestamp:dd" | "D" => Some(Field::Day),
            "timestamp:HH" | "H" => Some(Field::Hour),
            "timestamp:mm" | "m" => Some(Field::Minute),
            _ => None,
        }
    }

    /// Capture group in [`TIMESTAMP_PATTERN`].
    fn group(self) -> usize {
        match self {
            Field::Year => 1,
            Field::Month => 2,
            Field::Day => 3,
            Field::Hour => 4,
            Field::Minute => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder(Field),
}

/// File-name rotation stamp: `YYYY-MM[-dd[_HH-mm]]`
const TIMESTAMP_PATTERN: &str = r"(\d{4})-(\d{2})(?:-(\d{2})(?:_(\d{2})-(\d{2}))?)?";

/// Parsed key prefix template.
#[derive(Debug, Clone)]
pub struct KeyTemplate {
    raw: String,
    segments: Vec<Segment>,
    timestamp_re: Regex,
}

impl KeyTemplate {
    /// Parse a prefix. Unknown or unterminated placeholders are rejected.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut segments = Vec::new();
        let mut rest = raw;

        while let Some(start) = rest.find("!{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| {
                RelayError::Template(format!("unterminated placeholder in '{}'", raw))
            })?;
            let token = &after[..end];
            let field = Field::parse(token).ok_or_else(|| {
                RelayError::Template(format!("unknown placeholder '!{{{}}}' in '{}'", token, raw))
            })?;
            segments.push(Segment::Placeholder(field));
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        let timestamp_re =
            Regex::new(TIMESTAMP_PATTERN).map_err(|e| RelayError::Template(e.to_string()))?;

        Ok(Self {
            raw: raw.to_string(),
            segments,
            timestamp_re,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn has_placeholders(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Placeholder(_)))
    }

    /// Fill the template from the last timestamp found in `file_name`.
    pub fn render(&self, file_name: &str) -> String {
        if !self.has_placeholders() {
            return self.raw.clone();
        }

        let Some(captures) = self.timestamp_re.captures_iter(file_name).last() else {
            return self.raw.clone();
        };

        let mut rendered = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => rendered.push_str(text),
                Segment::Placeholder(field) => match captures.get(field.group()) {
                    Some(value) => rendered.push_str(value.as_str()),
                    None => return self.raw.clone(),
                },
            }
        }
        rendered
    }
}

/// Destination key: optional rendered prefix joined to the relative path.
pub fn destination_key(template: Option<&KeyTemplate>, relative_path: &str, file_name: &str) -> String {
    let relative_path = relative_path.trim_start_matches('/');
    match template {
        Some(template) => {
            let prefix = template.render(file_name);
            let prefix = prefix.trim_end_matches('/');
            if prefix.is_empty() {
                relative_path.to_string()
            } else {
                format!("{}/{}", prefix, relative_path)
            }
        }
        None => relative_path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_placeholders_from_month_stamp() {
        let template = KeyTemplate::parse("!{Y}/!{M}").unwrap();
        assert_eq!(template.render("report.2024-03.csv"), "2024/03");
    }

    #[test]
    fn test_long_placeholders_from_rotation_stamp() {
        let template =
            KeyTemplate::parse("opc/!{timestamp:YYYY}/!{timestamp:MM}/!{timestamp:dd}/!{timestamp:HH}")
                .unwrap();
        assert_eq!(
            template.render("opcua.2023-11-07_14-30.gz"),
            "opc/2023/11/07/14"
        );
    }

    #[test]
    fn test_missing_field_falls_back_to_literal() {
        let template = KeyTemplate::parse("!{Y}/!{D}").unwrap();
        // Month-only stamp carries no day
        assert_eq!(template.render("report.2024-03.csv"), "!{Y}/!{D}");
        // No stamp at all
        assert_eq!(template.render("report.csv"), "!{Y}/!{D}");
    }

    #[test]
    fn test_last_timestamp_wins() {
        let template = KeyTemplate::parse("!{Y}-!{M}-!{D}").unwrap();
        assert_eq!(
            template.render("copy-of-2020-01-01.2024-03-05_00-00.gz"),
            "2024-03-05"
        );
    }

    #[test]
    fn test_literal_prefix_is_kept() {
        let template = KeyTemplate::parse("edge/site-1").unwrap();
        assert!(!template.has_placeholders());
        assert_eq!(template.render("app.2024-03-01_10-00.gz"), "edge/site-1");
    }

    #[test]
    fn test_unknown_placeholder_rejected() {
        let err = KeyTemplate::parse("!{timestamp:SS}").unwrap_err();
        assert!(matches!(err, RelayError::Template(_)));
        let err = KeyTemplate::parse("logs/!{Y").unwrap_err();
        assert!(matches!(err, RelayError::Template(_)));
    }

    #[test]
    fn test_destination_key_joins_with_single_slash() {
        let template = KeyTemplate::parse("!{Y}/!{M}/").unwrap();
        assert_eq!(
            destination_key(Some(&template), "line1/report.2024-03.csv", "report.2024-03.csv"),
            "2024/03/line1/report.2024-03.csv"
        );
        assert_eq!(destination_key(None, "a/b.txt", "b.txt"), "a/b.txt");
    }
}
