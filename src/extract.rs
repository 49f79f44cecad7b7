//! Plain-text extraction from eCFR full-text XML.
//!
//! [`extract_text`] is best-effort: a document that does not parse yields an
//! empty string so that one malformed upstream response never aborts an
//! ingestion run. Output is capped at [`MAX_CONTENT_CHARS`].

use quick_xml::events::Event;
use quick_xml::Reader;

/// Upper bound on stored content, one below the 1 MiB index limit.
pub const MAX_CONTENT_CHARS: usize = 1_048_575;

#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    #[error("XML syntax error: {0}")]
    Syntax(#[from] quick_xml::Error),
    #[error("document has no root element")]
    NoRoot,
    #[error("more than one root element")]
    MultipleRoots,
    #[error("unclosed element at end of document")]
    Unclosed,
    #[error("text outside the root element")]
    StrayText,
}

/// Extracts each element's text followed by its tail, visiting elements in
/// document (pre-)order, trimmed and joined with single spaces. Returns `""`
/// when the document is malformed.
pub fn extract_text(xml: &str) -> String {
    match collect_text(xml) {
        Ok(text) => truncate_chars(&text, MAX_CONTENT_CHARS).to_string(),
        Err(e) => {
            tracing::debug!(error = %e, "discarding malformed XML document");
            String::new()
        }
    }
}

/// Text fragments owned by one element: those before its first child, and
/// those after its end tag up to the next sibling or the parent's end.
#[derive(Default)]
struct ElementText {
    text: Vec<String>,
    tail: Vec<String>,
}

/// An open element and the most recent child it has seen.
struct Open {
    slot: usize,
    last_child: Option<usize>,
}

/// Strict variant of [`extract_text`] that reports why a document was
/// rejected. The result is not truncated.
pub fn collect_text(xml: &str) -> Result<String, XmlError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut elements: Vec<ElementText> = Vec::new();
    let mut stack: Vec<Open> = Vec::new();
    let mut seen_root = false;

    loop {
        let fragment = match reader.read_event()? {
            Event::Start(_) => {
                let slot = open_element(&mut elements, &mut stack, &mut seen_root)?;
                stack.push(Open {
                    slot,
                    last_child: None,
                });
                continue;
            }
            Event::Empty(_) => {
                open_element(&mut elements, &mut stack, &mut seen_root)?;
                continue;
            }
            Event::End(_) => {
                stack.pop().ok_or(XmlError::StrayText)?;
                continue;
            }
            Event::Text(t) => t.unescape()?.trim().to_string(),
            Event::CData(c) => {
                if stack.is_empty() {
                    return Err(XmlError::StrayText);
                }
                String::from_utf8_lossy(&c.into_inner()).trim().to_string()
            }
            Event::Eof => break,
            _ => continue,
        };

        if fragment.is_empty() {
            continue;
        }
        let open = stack.last().ok_or(XmlError::StrayText)?;
        match open.last_child {
            Some(child) => elements[child].tail.push(fragment),
            None => elements[open.slot].text.push(fragment),
        }
    }

    if !seen_root {
        return Err(XmlError::NoRoot);
    }
    if !stack.is_empty() {
        return Err(XmlError::Unclosed);
    }

    let parts: Vec<String> = elements
        .into_iter()
        .flat_map(|e| e.text.into_iter().chain(e.tail))
        .collect();
    Ok(parts.join(" "))
}

/// Allocates the next pre-order slot and records it as the parent's latest
/// child. Rejects a second root.
fn open_element(
    elements: &mut Vec<ElementText>,
    stack: &mut [Open],
    seen_root: &mut bool,
) -> Result<usize, XmlError> {
    let slot = elements.len();
    match stack.last_mut() {
        Some(parent) => parent.last_child = Some(slot),
        None if *seen_root => return Err(XmlError::MultipleRoots),
        None => *seen_root = true,
    }
    elements.push(ElementText::default());
    Ok(slot)
}

/// Returns at most `max` characters of `text`, cut on a char boundary.
pub fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
