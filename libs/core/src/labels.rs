//! Display-time labels for rendered messages.
//!
//! Agent identity is applied when a line is rendered, never written back to
//! the message: a `support` message reads as the assigned agent while one is
//! assigned and as the anonymous label after release.

use crate::types::{AgentIdentity, ChatEvent, Message, Sender};

pub const ANONYMOUS_SUPPORT_LABEL: &str = "Support";
pub const USER_LABEL: &str = "You";
pub const SYSTEM_LABEL: &str = "System";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IdentityView {
    agent: Option<AgentIdentity>,
}

impl IdentityView {
    pub fn agent(&self) -> Option<&AgentIdentity> {
        self.agent.as_ref()
    }

    pub fn set_agent(&mut self, agent: Option<AgentIdentity>) {
        self.agent = agent;
    }

    /// Applies identity events; returns `true` when the label set changed.
    pub fn apply(&mut self, event: &ChatEvent) -> bool {
        let next = match event {
            ChatEvent::IdentityUpdate(update) => Some(update.agent.clone()),
            ChatEvent::Release => None,
            ChatEvent::Message(_) => return false,
        };
        let changed = self.agent != next;
        self.agent = next;
        changed
    }

    pub fn label(&self, sender: Sender) -> &str {
        match sender {
            Sender::User => USER_LABEL,
            Sender::System => SYSTEM_LABEL,
            Sender::Support => self
                .agent
                .as_ref()
                .map(AgentIdentity::name)
                .unwrap_or(ANONYMOUS_SUPPORT_LABEL),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedLine {
    pub label: String,
    pub content: String,
    pub time_str: String,
}

/// Delivered messages plus the identity currently used to label them.
#[derive(Clone, Debug, Default)]
pub struct Transcript {
    messages: Vec<Message>,
    identity: IdentityView,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &ChatEvent) {
        match event {
            ChatEvent::Message(message) => self.messages.push(message.clone()),
            other => {
                self.identity.apply(other);
            }
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn identity(&self) -> &IdentityView {
        &self.identity
    }

    pub fn lines(&self) -> Vec<RenderedLine> {
        self.messages
            .iter()
            .map(|message| RenderedLine {
                label: self.identity.label(message.sender).to_string(),
                content: message.content.clone(),
                time_str: message.time_str(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IdentityUpdate;
    use time::OffsetDateTime;

    fn message(seq: u64, sender: Sender, content: &str) -> Message {
        Message {
            seq,
            sender,
            content: content.into(),
            timestamp: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn support_lines_follow_current_identity() {
        let mut transcript = Transcript::new();
        transcript.apply(&ChatEvent::Message(message(1, Sender::User, "help")));
        transcript.apply(&ChatEvent::Message(message(2, Sender::Support, "hi there")));

        let labels = |t: &Transcript| t.lines().into_iter().map(|l| l.label).collect::<Vec<_>>();
        assert_eq!(labels(&transcript), vec!["You", "Support"]);

        transcript.apply(&ChatEvent::IdentityUpdate(IdentityUpdate {
            agent: AgentIdentity::new("Agent Smith").unwrap(),
        }));
        assert_eq!(labels(&transcript), vec!["You", "Agent Smith"]);

        transcript.apply(&ChatEvent::Release);
        assert_eq!(labels(&transcript), vec!["You", "Support"]);
        assert_eq!(transcript.messages()[1].sender, Sender::Support);
    }

    #[test]
    fn apply_reports_changes_only() {
        let mut view = IdentityView::default();
        let update = ChatEvent::IdentityUpdate(IdentityUpdate {
            agent: AgentIdentity::new("Agent Smith").unwrap(),
        });
        assert!(view.apply(&update));
        assert!(!view.apply(&update));
        assert!(view.apply(&ChatEvent::Release));
        assert!(!view.apply(&ChatEvent::Release));
        assert_eq!(view.label(Sender::System), SYSTEM_LABEL);
    }
}
