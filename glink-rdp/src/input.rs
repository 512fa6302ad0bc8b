//! Event input: the hand-off point between a session and a dataflow consumer.

use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{RdpError, Result};

/// A value stamped with its event time.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<T> {
    pub payload: T,
    pub timestamp: SystemTime,
}

type Watermark<T> = Arc<dyn Fn(&T) -> SystemTime + Send + Sync>;

/// Sending half of an event queue tied to a session's lifetime.
pub struct InputStream<T> {
    tx: mpsc::Sender<Event<T>>,
    watermark: Option<Watermark<T>>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> InputStream<T> {
    pub(crate) fn channel(
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<Event<T>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stream = Self {
            tx,
            watermark: None,
            cancel,
        };
        (stream, rx)
    }

    /// Derive event time from the payload instead of the wall clock.
    pub fn with_watermark<F>(mut self, watermark: F) -> Self
    where
        F: Fn(&T) -> SystemTime + Send + Sync + 'static,
    {
        self.watermark = Some(Arc::new(watermark));
        self
    }

    /// Stamp and queue one value. Waits while the queue is full.
    pub async fn push(&self, payload: T) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RdpError::InputClosed);
        }
        let timestamp = match &self.watermark {
            Some(watermark) => watermark(&payload),
            None => SystemTime::now(),
        };
        let event = Event { payload, timestamp };
        tokio::select! {
            _ = self.cancel.cancelled() => Err(RdpError::InputClosed),
            sent = self.tx.send(event) => sent.map_err(|_| RdpError::InputClosed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.tx.is_closed()
    }
}

impl<T> Clone for InputStream<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            watermark: self.watermark.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<T> fmt::Debug for InputStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InputStream")
            .field("watermark", &self.watermark.is_some())
            .field("closed", &self.cancel.is_cancelled())
            .finish()
    }
}
