//! The selection-driven message composer.
//!
//! All state lives in one [`ComposerState`] value that only changes through
//! the transition methods on [`Composer`]. The derived text is recomputed
//! synchronously after every mutating transition.

use serde::Serialize;
use tracing::{debug, info};

use crate::catalog::QuestionTemplate;
use crate::error::{ChatError, Result};
use crate::selection::SelectionSet;
use crate::template::{self, Placeholders};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    /// No template and no selections.
    Idle,
    /// A template is active but no names have been picked for it.
    TemplateChosen,
    /// A template is active and at least one selection set is non-empty.
    Composing,
    /// A send just succeeded; the composer is about to return to `Idle`.
    Sent,
}

/// Text shown in the editable field.
///
/// Manual edits are kept only until the next mutating transition, which
/// replaces them with freshly derived text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", content = "text", rename_all = "lowercase")]
pub enum ComposerText {
    Derived(String),
    Edited(String),
}

impl ComposerText {
    pub fn as_str(&self) -> &str {
        match self {
            ComposerText::Derived(text) | ComposerText::Edited(text) => text,
        }
    }

    pub fn is_edited(&self) -> bool {
        matches!(self, ComposerText::Edited(_))
    }
}

/// A selection set the active template asks for that is still empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Requirement {
    Items,
    Locations,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComposerState {
    pub phase: Phase,
    pub active_template: Option<QuestionTemplate>,
    pub items: SelectionSet,
    pub locations: SelectionSet,
    /// Text derived from template and selections, ignoring manual edits.
    pub rendered_text: String,
    pub text: ComposerText,
    /// A send is in flight.
    pub busy: bool,
}

/// Handed out by [`Composer::begin_send`]: the text claimed for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendTicket {
    pub content: String,
}

pub struct Composer {
    placeholders: Placeholders,
    template: Option<QuestionTemplate>,
    items: SelectionSet,
    locations: SelectionSet,
    rendered: String,
    text: ComposerText,
    busy: bool,
    phase: Phase,
}

impl Composer {
    pub fn new(placeholders: Placeholders) -> Self {
        Self {
            placeholders,
            template: None,
            items: SelectionSet::new(),
            locations: SelectionSet::new(),
            rendered: String::new(),
            text: ComposerText::Derived(String::new()),
            busy: false,
            phase: Phase::Idle,
        }
    }

    pub fn placeholders(&self) -> &Placeholders {
        &self.placeholders
    }

    /// Activate `template` (or none), clearing both selection sets.
    pub fn choose_template(&mut self, template: Option<QuestionTemplate>) {
        match &template {
            Some(t) => info!("Question template chosen: {}", t.id),
            None => info!("Question template cleared"),
        }
        self.template = template;
        self.items.clear();
        self.locations.clear();
        self.rerender();
    }

    /// Return to `Idle`: no template, no selections, empty text.
    pub fn reset(&mut self) {
        debug!("Composer reset");
        self.choose_template(None);
    }

    pub fn add_items<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.items.add(names);
        self.rerender();
    }

    pub fn add_locations<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.locations.add(names);
        self.rerender();
    }

    /// Union a raw item selector payload; malformed payloads count as empty.
    pub fn add_items_payload(&mut self, payload: &serde_json::Value) {
        self.items.add_payload(payload);
        self.rerender();
    }

    /// Union a raw location selector payload; malformed payloads count as empty.
    pub fn add_locations_payload(&mut self, payload: &serde_json::Value) {
        self.locations.add_payload(payload);
        self.rerender();
    }

    /// Overwrite the displayed text. Selections are not touched.
    pub fn edit_text(&mut self, text: impl Into<String>) {
        self.text = ComposerText::Edited(text.into());
    }

    /// Current text of the editable field.
    pub fn render(&self) -> &str {
        self.text.as_str()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn active_template(&self) -> Option<&QuestionTemplate> {
        self.template.as_ref()
    }

    /// Required selection sets of the active template that are still empty.
    pub fn pending_requirements(&self) -> Vec<Requirement> {
        let Some(template) = &self.template else {
            return Vec::new();
        };
        let mut pending = Vec::new();
        if template.requires_item && self.items.is_empty() {
            pending.push(Requirement::Items);
        }
        if template.requires_location && self.locations.is_empty() {
            pending.push(Requirement::Locations);
        }
        pending
    }

    pub fn state(&self) -> ComposerState {
        ComposerState {
            phase: self.phase,
            active_template: self.template.clone(),
            items: self.items.clone(),
            locations: self.locations.clone(),
            rendered_text: self.rendered.clone(),
            text: self.text.clone(),
            busy: self.busy,
        }
    }

    /// Validate and claim the current text for sending.
    ///
    /// Fails without touching state when a send is already in flight, there
    /// is no conversation, or the text is blank.
    pub fn begin_send(&mut self, has_conversation: bool) -> Result<SendTicket> {
        if self.busy {
            return Err(ChatError::Busy);
        }
        if !has_conversation {
            return Err(ChatError::NoConversation);
        }
        let content = self.text.as_str().to_string();
        if content.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        self.busy = true;
        Ok(SendTicket { content })
    }

    /// Release the busy flag and apply the outcome of a send.
    ///
    /// On success the composer returns to `Idle`, including any selections
    /// made while the send was in flight. On failure everything is kept so
    /// the user can retry.
    pub fn finish_send(&mut self, succeeded: bool) {
        self.busy = false;
        if !succeeded {
            return;
        }
        self.phase = Phase::Sent;
        self.reset();
    }

    fn rerender(&mut self) {
        self.rendered = template::render(
            self.template.as_ref(),
            &self.items,
            &self.locations,
            &self.placeholders,
        );
        self.text = ComposerText::Derived(self.rendered.clone());
        self.phase = match &self.template {
            None => Phase::Idle,
            Some(_) if self.items.is_empty() && self.locations.is_empty() => Phase::TemplateChosen,
            Some(_) => Phase::Composing,
        };
    }
}

impl Default for Composer {
    fn default() -> Self {
        Self::new(Placeholders::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn which_template() -> QuestionTemplate {
        QuestionTemplate {
            id: "which".to_string(),
            name: "Which items where".to_string(),
            description: Some("Which {items} are at {locations}?".to_string()),
            requires_location: true,
            requires_item: true,
        }
    }

    #[test]
    fn test_new_composer_is_idle() {
        let composer = Composer::default();
        assert_eq!(composer.phase(), Phase::Idle);
        assert_eq!(composer.render(), "");
        assert!(!composer.is_busy());
    }

    #[test]
    fn test_choose_template_renders_and_clears_selections() {
        let mut composer = Composer::default();
        composer.add_items(["Stale"]);
        composer.add_locations(["Old room"]);

        composer.choose_template(Some(which_template()));
        let state = composer.state();
        assert!(state.items.is_empty());
        assert!(state.locations.is_empty());
        assert_eq!(state.phase, Phase::TemplateChosen);
        assert_eq!(composer.render(), "Which  are at ?");
    }

    #[test]
    fn test_selections_rerender() {
        let mut composer = Composer::default();
        composer.choose_template(Some(which_template()));
        composer.add_items(["Lamp"]);
        composer.add_items(["Chair", "Lamp"]);
        composer.add_locations(["Kitchen"]);
        assert_eq!(composer.phase(), Phase::Composing);
        assert_eq!(composer.render(), "Which Lamp; Chair are at Kitchen?");
        assert!(composer.pending_requirements().is_empty());
    }

    #[test]
    fn test_selections_without_template_render_nothing() {
        let mut composer = Composer::default();
        composer.add_items(["Lamp"]);
        assert_eq!(composer.phase(), Phase::Idle);
        assert_eq!(composer.render(), "");
        assert_eq!(composer.state().items.len(), 1);
    }

    #[test]
    fn test_edit_is_discarded_by_next_selection() {
        let mut composer = Composer::default();
        composer.choose_template(Some(which_template()));
        composer.edit_text("my own question");
        assert_eq!(composer.render(), "my own question");
        assert!(composer.state().text.is_edited());
        assert_eq!(composer.state().rendered_text, "Which  are at ?");

        composer.add_locations(["Hall"]);
        assert_eq!(composer.render(), "Which  are at Hall?");
        assert!(!composer.state().text.is_edited());
    }

    #[test]
    fn test_pending_requirements() {
        let mut composer = Composer::default();
        assert!(composer.pending_requirements().is_empty());
        composer.choose_template(Some(which_template()));
        assert_eq!(
            composer.pending_requirements(),
            vec![Requirement::Items, Requirement::Locations]
        );
        composer.add_items_payload(&json!(["Lamp"]));
        assert_eq!(composer.pending_requirements(), vec![Requirement::Locations]);
    }

    #[test]
    fn test_invalid_payload_leaves_state_unchanged() {
        let mut composer = Composer::default();
        composer.choose_template(Some(which_template()));
        composer.add_items(["Lamp"]);
        let before = composer.state();
        composer.add_items_payload(&json!({"selected": "Chair"}));
        composer.add_locations_payload(&json!("Kitchen"));
        assert_eq!(composer.state(), before);
    }

    #[test]
    fn test_begin_send_rejects_blank_text() {
        let mut composer = Composer::default();
        let before = composer.state();
        assert_eq!(composer.begin_send(true), Err(ChatError::EmptyMessage));
        composer.edit_text("   ");
        assert_eq!(composer.begin_send(true), Err(ChatError::EmptyMessage));
        assert!(!composer.is_busy());
        assert_eq!(composer.state().phase, before.phase);
    }

    #[test]
    fn test_begin_send_requires_conversation() {
        let mut composer = Composer::default();
        composer.edit_text("hello");
        assert_eq!(composer.begin_send(false), Err(ChatError::NoConversation));
        assert!(!composer.is_busy());
    }

    #[test]
    fn test_second_send_rejected_while_busy() {
        let mut composer = Composer::default();
        composer.edit_text("hello");
        let ticket = composer.begin_send(true).unwrap();
        assert_eq!(ticket.content, "hello");
        assert_eq!(composer.begin_send(true), Err(ChatError::Busy));

        // selections are still accepted while busy
        composer.choose_template(Some(which_template()));
        composer.add_items(["Lamp"]);
        assert_eq!(composer.render(), "Which Lamp are at ?");
    }

    #[test]
    fn test_successful_send_resets_to_idle() {
        let mut composer = Composer::default();
        composer.choose_template(Some(which_template()));
        composer.add_items(["Lamp"]);
        composer.add_locations(["Hall"]);
        composer.begin_send(true).unwrap();
        composer.finish_send(true);

        let state = composer.state();
        assert_eq!(state.phase, Phase::Idle);
        assert!(state.active_template.is_none());
        assert!(state.items.is_empty() && state.locations.is_empty());
        assert_eq!(composer.render(), "");
        assert!(!state.busy);
    }

    #[test]
    fn test_failed_send_keeps_state() {
        let mut composer = Composer::default();
        composer.choose_template(Some(which_template()));
        composer.add_items(["Lamp"]);
        composer.begin_send(true).unwrap();
        let during = composer.state();
        composer.finish_send(false);

        let after = composer.state();
        assert!(!after.busy);
        assert_eq!(after.items, during.items);
        assert_eq!(after.active_template, during.active_template);
        assert_eq!(composer.render(), "Which Lamp are at ?");
    }

    #[test]
    fn test_success_resets_changes_made_during_send() {
        let mut composer = Composer::default();
        composer.choose_template(Some(which_template()));
        composer.add_items(["Lamp"]);
        composer.add_locations(["Hall"]);
        composer.begin_send(true).unwrap();

        composer.add_items(["Chair"]);
        composer.edit_text("typed while sending");
        assert!(composer.is_busy());
        composer.finish_send(true);

        let state = composer.state();
        assert_eq!(state.phase, Phase::Idle);
        assert!(state.active_template.is_none());
        assert!(state.items.is_empty() && state.locations.is_empty());
        assert_eq!(composer.render(), "");
        assert!(!state.busy);
    }

    #[test]
    fn test_state_serializes_camel_case() {
        let mut composer = Composer::default();
        composer.choose_template(Some(which_template()));
        let value = serde_json::to_value(composer.state()).unwrap();
        assert_eq!(value["phase"], "TemplateChosen");
        assert_eq!(value["activeTemplate"]["id"], "which");
        assert_eq!(value["renderedText"], "Which  are at ?");
        assert_eq!(value["text"]["source"], "derived");
    }
}
