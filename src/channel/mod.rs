//! Streaming channel manager.
//!
//! Owns at most one live push-channel, addressed by the correlation id of the
//! stage that opened it. Each open channel gets a pump task that connects
//! through the injected [`ChannelTransport`], parses inbound messages and
//! forwards [`ChannelSignal`]s over an mpsc queue to the orchestrator's
//! dispatcher. Opening a channel always tears down the previous one first.
//!
//! The channel is advisory: connect failures and drops surface as
//! `Disconnected` signals, never as stage failures.

pub mod ws;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::errors::{PipelineError, PipelineResult};
use crate::ids::Clock;
use crate::stage::Stage;
use crate::stream::{StreamedEvent, parse_event};

pub use ws::{WsTransport, channel_url, ws_base_from_http};

/// Raw text frames from an open channel. `MalformedEvent` items are dropped
/// by the pump; any other error ends the channel.
pub type MessageStream = BoxStream<'static, PipelineResult<String>>;

#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn connect(&self, url: &str) -> PipelineResult<MessageStream>;
}

/// What a pump task reports back to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelSignal {
    Connected {
        correlation_id: String,
    },
    Event {
        correlation_id: String,
        event: StreamedEvent,
    },
    Disconnected {
        correlation_id: String,
        error: Option<String>,
    },
}

impl ChannelSignal {
    pub fn correlation_id(&self) -> &str {
        match self {
            Self::Connected { correlation_id }
            | Self::Event { correlation_id, .. }
            | Self::Disconnected { correlation_id, .. } => correlation_id,
        }
    }
}

struct ActiveChannel {
    correlation_id: String,
    url: String,
    task: JoinHandle<()>,
}

pub struct ChannelManager {
    transport: Arc<dyn ChannelTransport>,
    clock: Arc<dyn Clock>,
    signals: mpsc::UnboundedSender<ChannelSignal>,
    ws_base: String,
    connect_timeout: Duration,
    active: Mutex<Option<ActiveChannel>>,
}

impl ChannelManager {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        clock: Arc<dyn Clock>,
        signals: mpsc::UnboundedSender<ChannelSignal>,
        ws_base: impl Into<String>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            clock,
            signals,
            ws_base: ws_base.into(),
            connect_timeout,
            active: Mutex::new(None),
        }
    }

    /// Address of the channel for `correlation_id`.
    pub fn url_for(&self, correlation_id: &str) -> String {
        channel_url(&self.ws_base, correlation_id)
    }

    /// Close any open channel and start connecting a new one. Returns the
    /// channel address immediately; connection outcome arrives as a signal.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(&self, stage: Stage, correlation_id: &str) -> String {
        self.close();

        let url = self.url_for(correlation_id);
        info!(%stage, %correlation_id, %url, "Opening progress channel");

        let task = tokio::spawn(pump(
            Arc::clone(&self.transport),
            Arc::clone(&self.clock),
            self.signals.clone(),
            url.clone(),
            stage,
            correlation_id.to_string(),
            self.connect_timeout,
        ));

        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        *active = Some(ActiveChannel {
            correlation_id: correlation_id.to_string(),
            url: url.clone(),
            task,
        });
        url
    }

    /// Tear down the open channel, if any. Idempotent.
    pub fn close(&self) -> bool {
        let previous = self
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match previous {
            Some(channel) => {
                debug!(
                    correlation_id = %channel.correlation_id,
                    url = %channel.url,
                    "Closing progress channel"
                );
                channel.task.abort();
                true
            }
            None => false,
        }
    }

    /// Whether a channel is held and its pump is still running. A channel
    /// the worker closed counts as not open.
    pub fn is_open(&self) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|c| !c.task.is_finished())
    }

    pub fn active_correlation_id(&self) -> Option<String> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|c| c.correlation_id.clone())
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.close();
    }
}

async fn pump(
    transport: Arc<dyn ChannelTransport>,
    clock: Arc<dyn Clock>,
    signals: mpsc::UnboundedSender<ChannelSignal>,
    url: String,
    stage: Stage,
    correlation_id: String,
    connect_timeout: Duration,
) {
    let connected = tokio::time::timeout(connect_timeout, transport.connect(&url)).await;
    let mut stream = match connected {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(%stage, %correlation_id, %url, error = %e, "Progress channel failed to connect");
            let _ = signals.send(ChannelSignal::Disconnected {
                correlation_id,
                error: Some(e.to_string()),
            });
            return;
        }
        Err(_) => {
            warn!(%stage, %correlation_id, %url, "Progress channel connect timed out");
            let _ = signals.send(ChannelSignal::Disconnected {
                correlation_id,
                error: Some(
                    PipelineError::Channel(format!(
                        "connect to {} timed out after {:?}",
                        url, connect_timeout
                    ))
                    .to_string(),
                ),
            });
            return;
        }
    };

    if signals
        .send(ChannelSignal::Connected {
            correlation_id: correlation_id.clone(),
        })
        .is_err()
    {
        return;
    }
    debug!(%stage, %correlation_id, "Progress channel connected");

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(text) => {
                debug!(%stage, %correlation_id, frame = %text, "Progress channel frame");
                match parse_event(&text, clock.now()) {
                    Ok(event) => {
                        let signal = ChannelSignal::Event {
                            correlation_id: correlation_id.clone(),
                            event: event.with_stage(stage),
                        };
                        if signals.send(signal).is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!(%stage, %correlation_id, error = %e, "Dropping streamed event"),
                }
            }
            Err(e @ PipelineError::MalformedEvent(_)) => {
                warn!(%stage, %correlation_id, error = %e, "Dropping streamed event");
            }
            Err(e) => {
                warn!(%stage, %correlation_id, error = %e, "Progress channel dropped");
                let _ = signals.send(ChannelSignal::Disconnected {
                    correlation_id,
                    error: Some(e.to_string()),
                });
                return;
            }
        }
    }

    debug!(%stage, %correlation_id, "Progress channel closed by worker");
    let _ = signals.send(ChannelSignal::Disconnected {
        correlation_id,
        error: None,
    });
}
