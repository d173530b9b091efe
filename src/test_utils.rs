//! Test utilities.
//!
//! A recording `ClusterHandler` plus helpers for building cluster messages,
//! for exercising adapters against the in-memory broker.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::bus::{BusError, Result};
use crate::cluster::{ClusterHandler, ClusterMessage, ClusterResponse, MessageType, ServerId};

/// Cluster handler that records everything delivered to it.
#[derive(Default)]
pub struct RecordingHandler {
    messages: Mutex<Vec<ClusterMessage>>,
    responses: Mutex<Vec<ClusterResponse>>,
    init_calls: AtomicUsize,
    close_calls: AtomicUsize,
    fail_on_init: AtomicBool,
    notify: Notify,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_on_init(&self, fail: bool) {
        self.fail_on_init.store(fail, Ordering::SeqCst);
    }

    pub fn messages(&self) -> Vec<ClusterMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn responses(&self) -> Vec<ClusterResponse> {
        self.responses.lock().unwrap().clone()
    }

    pub fn init_calls(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` messages arrived. Returns false on timeout.
    pub async fn wait_for_messages(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.messages.lock().unwrap().len() >= count)
            .await
    }

    /// Wait until at least `count` responses arrived. Returns false on timeout.
    pub async fn wait_for_responses(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.responses.lock().unwrap().len() >= count)
            .await
    }

    async fn wait_until(&self, timeout: Duration, done: impl Fn() -> bool) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                if done() {
                    return;
                }
                notified.await;
            }
        })
        .await
        .is_ok()
    }
}

#[async_trait]
impl ClusterHandler for RecordingHandler {
    async fn init(&self) -> Result<()> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on_init.load(Ordering::SeqCst) {
            return Err(BusError::Provisioning("Mock init failure".to_string()));
        }
        Ok(())
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_message(&self, message: ClusterMessage) {
        self.messages.lock().unwrap().push(message);
        self.notify.notify_waiters();
    }

    async fn on_response(&self, response: ClusterResponse) {
        self.responses.lock().unwrap().push(response);
        self.notify.notify_waiters();
    }
}

/// Build a cluster message originating from `uid`.
pub fn make_message(
    uid: &ServerId,
    nsp: &str,
    kind: MessageType,
    data: serde_json::Value,
) -> ClusterMessage {
    ClusterMessage {
        uid: uid.clone(),
        nsp: nsp.to_string(),
        kind,
        data: Some(data),
    }
}

/// Build a cluster response.
pub fn make_response(kind: MessageType, data: serde_json::Value) -> ClusterResponse {
    ClusterResponse {
        kind,
        data: Some(data),
    }
}
