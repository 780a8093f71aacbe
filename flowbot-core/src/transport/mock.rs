//! In-memory mock transport.
//!
//! Records outgoing messages and lets tests fire inbound events without a
//! network. Public (not test-gated) so downstream crates can drive a bot
//! in their own tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{
    EventListener, EventPayload, SendOptions, Transport, TransportError, TransportFactory,
};

/// One recorded outgoing message.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub chat_id: String,
    pub text: String,
    pub options: SendOptions,
}

/// Transport double that records sends and replays events to listeners.
#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<SentMessage>>,
    listeners: Mutex<HashMap<String, Vec<EventListener>>>,
    stop_calls: AtomicUsize,
    fail_sends: AtomicBool,
}

impl MockTransport {
    /// Create a mock transport ready for listener registration.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every subsequent `send_message` fail.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    /// Deliver an event to every listener registered for its name, in order.
    pub async fn emit(&self, payload: EventPayload) {
        let listeners: Vec<EventListener> = {
            let map = self.listeners.lock().expect("listener lock poisoned");
            map.get(&payload.event).cloned().unwrap_or_default()
        };
        for listener in listeners {
            listener(payload.clone()).await;
        }
    }

    /// Snapshot of every message sent so far.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().expect("sent lock poisoned").clone()
    }

    /// Texts of every message sent so far, in order.
    pub fn sent_texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|m| m.text).collect()
    }

    /// How many times `stop_polling` was called.
    pub fn stop_count(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    /// Number of listeners registered for `event`.
    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .get(event)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_message(
        &self,
        chat_id: &str,
        text: &str,
        options: SendOptions,
    ) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::Send {
                chat_id: chat_id.to_string(),
                reason: "mock failure".to_string(),
            });
        }
        self.sent
            .lock()
            .expect("sent lock poisoned")
            .push(SentMessage {
                chat_id: chat_id.to_string(),
                text: text.to_string(),
                options,
            });
        Ok(())
    }

    fn on(&self, event: &str, listener: EventListener) {
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .entry(event.to_string())
            .or_default()
            .push(listener);
    }

    async fn stop_polling(&self) -> Result<(), TransportError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out [`MockTransport`]s and remembering them by token.
#[derive(Default)]
pub struct MockTransportFactory {
    created: Mutex<Vec<(String, Arc<MockTransport>)>>,
}

impl MockTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The most recent transport created for `token`.
    pub fn transport_for(&self, token: &str) -> Option<Arc<MockTransport>> {
        self.created
            .lock()
            .expect("created lock poisoned")
            .iter()
            .rev()
            .find(|(t, _)| t == token)
            .map(|(_, transport)| Arc::clone(transport))
    }

    /// Every transport created so far, in creation order.
    pub fn all(&self) -> Vec<Arc<MockTransport>> {
        self.created
            .lock()
            .expect("created lock poisoned")
            .iter()
            .map(|(_, t)| Arc::clone(t))
            .collect()
    }
}

impl TransportFactory for MockTransportFactory {
    fn create(&self, token: &str) -> Arc<dyn Transport> {
        let transport = MockTransport::new();
        self.created
            .lock()
            .expect("created lock poisoned")
            .push((token.to_string(), Arc::clone(&transport)));
        transport
    }
}
