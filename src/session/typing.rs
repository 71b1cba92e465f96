use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::session::LoopEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Start,
    Stop,
}

struct IdleTimer {
    ticket: u64,
    task: JoinHandle<()>,
}

/// Local typing state per conversation. Input starts the indicator; an idle
/// timer, restarted on every keystroke, stops it.
pub struct TypingIndicator {
    idle: Duration,
    active: HashMap<String, IdleTimer>,
    next_ticket: u64,
}

impl TypingIndicator {
    pub fn new(idle: Duration) -> Self {
        Self {
            idle,
            active: HashMap::new(),
            next_ticket: 0,
        }
    }

    pub fn is_typing(&self, conversation_id: &str) -> bool {
        self.active.contains_key(conversation_id)
    }

    /// Feed the current composer text. Returns `Start` when this input
    /// begins a typing period.
    pub fn on_input(
        &mut self,
        conversation_id: &str,
        text: &str,
        events: &mpsc::UnboundedSender<LoopEvent>,
    ) -> Option<TypingSignal> {
        let was_typing = self.is_typing(conversation_id);
        if text.is_empty() && !was_typing {
            return None;
        }

        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let tx = events.clone();
        let conv = conversation_id.to_string();
        let idle = self.idle;
        let task = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let _ = tx.send(LoopEvent::TypingIdle {
                conversation_id: conv,
                ticket,
            });
        });
        if let Some(old) = self.active.insert(conversation_id.to_string(), IdleTimer { ticket, task }) {
            old.task.abort();
        }

        (!was_typing).then_some(TypingSignal::Start)
    }

    /// Idle timer fired. Stale tickets (superseded by a later keystroke) are
    /// ignored.
    pub fn on_idle(&mut self, conversation_id: &str, ticket: u64) -> Option<TypingSignal> {
        match self.active.get(conversation_id) {
            Some(timer) if timer.ticket == ticket => {
                self.active.remove(conversation_id);
                Some(TypingSignal::Stop)
            }
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        for (_, timer) in self.active.drain() {
            timer.task.abort();
        }
    }
}

impl Drop for TypingIndicator {
    fn drop(&mut self) {
        self.clear();
    }
}
