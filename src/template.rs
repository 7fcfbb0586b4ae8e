//! Placeholder substitution for question templates.

use serde::{Deserialize, Serialize};

use crate::catalog::QuestionTemplate;
use crate::constants::SELECTION_SEPARATOR;
use crate::selection::SelectionSet;

/// The tokens replaced by the item and location selections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placeholders {
    pub items: String,
    pub locations: String,
}

impl Placeholders {
    /// `{items}` and `{locations}`.
    pub fn braced() -> Self {
        Self {
            items: "{items}".to_string(),
            locations: "{locations}".to_string(),
        }
    }

    /// Bare `x` and `y`, as used by question lists written for the first
    /// version of the chat page. Every `x` and `y` in the text is a token.
    pub fn legacy() -> Self {
        Self {
            items: "x".to_string(),
            locations: "y".to_string(),
        }
    }

    pub fn from_style(style: &str) -> Option<Self> {
        match style {
            "braced" => Some(Self::braced()),
            "legacy" => Some(Self::legacy()),
            _ => None,
        }
    }

    /// Whether `text` still contains either token.
    pub fn appear_in(&self, text: &str) -> bool {
        text.contains(&self.items) || text.contains(&self.locations)
    }
}

impl Default for Placeholders {
    fn default() -> Self {
        Self::braced()
    }
}

/// Render `template` with the current selections.
///
/// Every occurrence of each token is replaced in a single left-to-right pass;
/// substituted names are never scanned again, so a name containing a token
/// comes through verbatim. No template renders to the empty string.
pub fn render(
    template: Option<&QuestionTemplate>,
    items: &SelectionSet,
    locations: &SelectionSet,
    placeholders: &Placeholders,
) -> String {
    let Some(template) = template else {
        return String::new();
    };
    substitute(
        template.source_text(),
        &[
            (placeholders.items.as_str(), items.join(SELECTION_SEPARATOR)),
            (placeholders.locations.as_str(), locations.join(SELECTION_SEPARATOR)),
        ],
    )
}

fn substitute(text: &str, replacements: &[(&str, String)]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while !rest.is_empty() {
        // Longest token first so one token cannot shadow another it prefixes.
        let mut best: Option<&(&str, String)> = None;
        for replacement in replacements {
            let token = replacement.0;
            if !token.is_empty()
                && rest.starts_with(token)
                && best.map_or(true, |b| token.len() > b.0.len())
            {
                best = Some(replacement);
            }
        }
        if let Some((token, value)) = best {
            out.push_str(value);
            rest = &rest[token.len()..];
        } else {
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                out.push(c);
            }
            rest = chars.as_str();
        }
    }
    out
}
