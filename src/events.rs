use crate::category::ToolCategory;
use crate::job::TerminalState;
use serde::Serialize;
use tokio::sync::broadcast;

/// Which pipe a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Job lifecycle notifications pushed to whoever renders the jobs panel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
    Started {
        name: String,
        pid: u32,
        category: ToolCategory,
    },
    Output {
        name: String,
        stream: OutputStream,
        text: String,
    },
    Finished {
        name: String,
        state: TerminalState,
    },
}

/// Broadcast queue for [`JobEvent`]s.
///
/// Publishing never blocks and never fails: with no subscribers events are
/// dropped, and slow subscribers see `RecvError::Lagged` instead of stalling
/// the output pumps.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: JobEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(JobEvent::Started {
            name: "x".to_string(),
            pid: 1,
            category: ToolCategory::Misc,
        });
    }

    #[test]
    fn test_events_serialize_with_tag() {
        let event = JobEvent::Output {
            name: "strings".to_string(),
            stream: OutputStream::Stderr,
            text: "oops".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "output");
        assert_eq!(json["stream"], "stderr");
        assert_eq!(json["name"], "strings");
    }
}
