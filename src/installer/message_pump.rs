//! Queue of asynchronous installer events
//!
//! Worker threads push events; the host drains the queue on its own tick
//! and each event is handed to every registered [`MessageHandler`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// What happened to a chunk source's backing media
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSourceEventType {
    AccessLost,
    AccessRegained,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSourceEvent {
    pub event: ChunkSourceEventType,
    pub location: String,
}

/// Receives events delivered by [`MessagePump::pump`]
pub trait MessageHandler: Send + Sync {
    fn handle_chunk_source_event(&self, event: &ChunkSourceEvent);
}

#[derive(Default)]
pub struct MessagePump {
    queue: Mutex<VecDeque<ChunkSourceEvent>>,
}

impl MessagePump {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&self, event: ChunkSourceEvent) {
        self.queue.lock().unwrap().push_back(event);
    }

    /// Deliver queued events to `handlers`, returning how many were delivered
    pub fn pump(&self, handlers: &[Arc<dyn MessageHandler>]) -> usize {
        let events: Vec<ChunkSourceEvent> = self.queue.lock().unwrap().drain(..).collect();
        for event in &events {
            for handler in handlers {
                handler.handle_chunk_source_event(event);
            }
        }
        events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<ChunkSourceEvent>>);

    impl MessageHandler for Collect {
        fn handle_chunk_source_event(&self, event: &ChunkSourceEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_pump_delivers_in_order() {
        let pump = MessagePump::new();
        pump.send(ChunkSourceEvent {
            event: ChunkSourceEventType::AccessLost,
            location: "/media/disc".into(),
        });
        pump.send(ChunkSourceEvent {
            event: ChunkSourceEventType::AccessRegained,
            location: "/media/disc".into(),
        });

        let handler = Arc::new(Collect::default());
        let handlers: Vec<Arc<dyn MessageHandler>> = vec![handler.clone()];
        assert_eq!(pump.pump(&handlers), 2);
        assert!(pump.is_empty());

        let seen = handler.0.lock().unwrap();
        assert_eq!(seen[0].event, ChunkSourceEventType::AccessLost);
        assert_eq!(seen[1].event, ChunkSourceEventType::AccessRegained);
    }
}
