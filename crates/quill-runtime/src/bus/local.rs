use std::sync::Arc;

use futures::future::BoxFuture;

use quill_core::error::Result;
use quill_core::{Event, EventBus, SendReceipt};

use crate::jobs::Dispatcher;

/// In-process bus: events go straight to the dispatcher.
#[derive(Clone)]
pub struct LocalEventBus {
    dispatcher: Arc<Dispatcher>,
}

impl LocalEventBus {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

impl EventBus for LocalEventBus {
    fn send(&self, events: Vec<Event>) -> BoxFuture<'_, Result<SendReceipt>> {
        Box::pin(async move {
            let events = super::prepare(events)?;
            let ids = events.iter().map(|e| e.event_id().to_string()).collect();
            self.dispatcher.dispatch(events).await?;
            Ok(SendReceipt { ids })
        })
    }
}
