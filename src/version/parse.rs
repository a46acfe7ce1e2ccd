// src/version/parse.rs

//! Version string parsing and rendering
//!
//! A version string is a `/`-separated list of labels and revisions. A
//! doubled slash (`//label`) introduces a shadow of the branch before it.
//! Labels and revisions may be abbreviated against the previous label and
//! revision.

use super::{Hop, Label, ParseError, Revision, VersionError};

/// Parse an absolute version or branch string into hops
pub(crate) fn parse_hops(text: &str, frozen: bool) -> Result<Vec<Hop>, ParseError> {
    let Some(body) = text.strip_prefix('/') else {
        return Err(ParseError::new(
            text,
            format!("version string must begin with /: {}", text),
        ));
    };

    let parts: Vec<&str> = body.split('/').collect();
    let mut hops: Vec<Hop> = Vec::new();
    let mut last_label: Option<Label> = None;
    let mut last_revision: Option<Revision> = None;
    let mut expect_label = true;
    let mut shadow_next = false;
    let mut shadow_depth = 0usize;

    for (index, part) in parts.iter().enumerate() {
        if expect_label {
            if part.is_empty() {
                return Err(ParseError::new(text, format!("empty label in {}", text)));
            }
            let label = Label::parse_with_template(part, last_label.as_ref())
                .map_err(|e| ParseError::new(text, e.to_string()))?;

            if shadow_next {
                shadow_depth += 1;
                hops.push(Hop::Shadow {
                    label: label.clone(),
                    revision: None,
                });
            } else {
                shadow_depth = 0;
                hops.push(Hop::Branch {
                    label: label.clone(),
                    revision: None,
                });
            }
            last_label = Some(label);
            expect_label = false;
            shadow_next = false;
        } else if part.is_empty() {
            if index + 1 == parts.len() {
                return Err(ParseError::new(
                    text,
                    format!("version string may not end with /: {}", text),
                ));
            }
            shadow_next = true;
            expect_label = true;
        } else {
            let revision = Revision::parse(part, last_revision.as_ref(), frozen)
                .map_err(|e| ParseError::new(text, e.to_string()))?;

            let too_deep = revision.source_count().shadow_count() > shadow_depth
                || revision
                    .build_count()
                    .is_some_and(|b| b.shadow_count() > shadow_depth);
            if too_deep {
                return Err(ParseError::new(
                    text,
                    format!("too many shadow serial numbers in '{}'", part),
                ));
            }

            if let Some(hop) = hops.last_mut() {
                hop.set_revision(Some(revision.clone()));
            }
            last_revision = Some(revision);
            expect_label = true;
        }
    }

    Ok(hops)
}

enum Element<'a> {
    Label(&'a Label),
    ShadowLabel(&'a Label),
    Revision(&'a Revision),
}

fn elements(hops: &[Hop]) -> Vec<Element<'_>> {
    let mut out = Vec::with_capacity(hops.len() * 2);
    for hop in hops {
        match hop {
            Hop::Branch { label, .. } => out.push(Element::Label(label)),
            Hop::Shadow { label, .. } => out.push(Element::ShadowLabel(label)),
        }
        if let Some(revision) = hop.revision() {
            out.push(Element::Revision(revision));
        }
    }
    out
}

fn same_element(a: &Element<'_>, b: &Element<'_>) -> bool {
    match (a, b) {
        (Element::Label(x), Element::Label(y)) => x == y,
        (Element::ShadowLabel(x), Element::ShadowLabel(y)) => x == y,
        (Element::Revision(x), Element::Revision(y)) => x == y,
        _ => false,
    }
}

fn join(elements: &[Element<'_>], frozen: bool, absolute: bool) -> String {
    let mut parts: Vec<String> = Vec::new();
    if absolute {
        parts.push(String::new());
    }

    let mut last_label: Option<&Label> = None;
    let mut last_revision: Option<&Revision> = None;

    for element in elements {
        match element {
            Element::Label(label) => {
                parts.push(label.as_string(last_label));
                last_label = Some(label);
            }
            Element::ShadowLabel(label) => {
                parts.push(String::new());
                parts.push(label.as_string(last_label));
                last_label = Some(label);
            }
            Element::Revision(revision) => {
                parts.push(if frozen {
                    revision.freeze(last_revision)
                } else {
                    revision.as_string(last_revision)
                });
                last_revision = Some(revision);
            }
        }
    }

    parts.join("/")
}

/// Render hops as an absolute string
pub(crate) fn render(hops: &[Hop], frozen: bool) -> String {
    join(&elements(hops), frozen, true)
}

/// Render hops, dropping `context` when it is a strict prefix followed by
/// a revision
pub(crate) fn render_relative(hops: &[Hop], context: &[Hop]) -> String {
    let ours = elements(hops);
    let prefix = elements(context);

    let strip = !prefix.is_empty()
        && prefix.len() < ours.len()
        && matches!(ours[prefix.len()], Element::Revision(_))
        && prefix
            .iter()
            .zip(&ours)
            .all(|(a, b)| same_element(a, b));

    if strip {
        join(&ours[prefix.len()..], false, false)
    } else {
        join(&ours, false, true)
    }
}

/// Splice timestamps into a display string without parsing it
///
/// Every revision in `text` receives the next entry of `timestamps`.
pub fn str_to_frozen(text: &str, timestamps: &[&str]) -> Result<String, VersionError> {
    let mut parts: Vec<String> = text.split('/').map(str::to_string).collect();
    let mut next_is_revision = false;
    let mut used = 0usize;

    for part in parts.iter_mut() {
        if part.is_empty() {
            next_is_revision = false;
            continue;
        }
        if next_is_revision {
            let stamp = timestamps.get(used).ok_or(VersionError::TimestampMismatch {
                expected: used + 1,
                found: timestamps.len(),
            })?;
            *part = format!("{}:{}", stamp, part);
            used += 1;
            next_is_revision = false;
        } else {
            next_is_revision = true;
        }
    }

    if used != timestamps.len() {
        return Err(VersionError::TimestampMismatch {
            expected: used,
            found: timestamps.len(),
        });
    }

    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trunk_and_shadow() {
        let hops = parse_hops("/foo@spc:linux//shadow/1.2-1", false).unwrap();
        assert_eq!(hops.len(), 2);
        assert!(!hops[0].is_shadow());
        assert!(hops[0].revision().is_none());
        assert!(hops[1].is_shadow());
        assert_eq!(hops[1].label().to_string(), "foo@spc:shadow");
        assert_eq!(render(&hops, false), "/foo@spc:linux//shadow/1.2-1");
    }

    #[test]
    fn test_parse_rejects_malformed_strings() {
        for text in [
            "0.50.1",
            "/",
            "/foo@spc:linux/",
            "/foo@spc:linux///shadow",
            "/foo@spc:linux/1.2-1//shadow",
            "/foo@spc:linux/1.2",
        ] {
            assert!(parse_hops(text, false).is_err(), "{} should not parse", text);
        }
    }

    #[test]
    fn test_shadow_depth_limits() {
        let good = [
            "/foo@spc:linux//shadow/1-1-1/branch//shadow2/1.1",
            "/foo@spc:linux//shadow/1-1-1/branch//shadow2//shadow3/1.1.1",
        ];
        for text in good {
            assert!(parse_hops(text, false).is_ok(), "{} should parse", text);
        }

        let bad = [
            "/foo@spc:linux//shadow/1-1.2.3",
            "/foo@spc:linux//shadow/1-1-1.2.3",
            "/foo@spc:linux//shadow/1-1-1/branch/1.1",
            "/foo@spc:linux//shadow/1-1-1/branch//shadow2/1.1.1",
            "/foo@spc:linux//shadow/1-1-1/branch//shadow2//shadow3/1.1.1.1",
        ];
        for text in bad {
            assert!(parse_hops(text, false).is_err(), "{} should not parse", text);
        }
    }

    #[test]
    fn test_str_to_frozen() {
        let frozen = str_to_frozen("/a/1.1//b//c/1.2/d", &["123", "456"]).unwrap();
        assert_eq!(frozen, "/a/123:1.1//b//c/456:1.2/d");

        assert!(str_to_frozen("/a/1.1//b//c/1.2/d", &["123"]).is_err());
        assert!(str_to_frozen("/a/1.1", &["1", "2"]).is_err());
    }
}
