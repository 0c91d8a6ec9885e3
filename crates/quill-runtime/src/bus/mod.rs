//! Event bus implementations.

mod http;
mod local;

pub use http::HttpEventBus;
pub use local::LocalEventBus;

use quill_core::error::Result;
use quill_core::Event;

/// Stamp and validate a batch before it leaves the process.
///
/// One invalid event rejects the whole batch, so a partial send never happens.
fn prepare(events: Vec<Event>) -> Result<Vec<Event>> {
    events
        .into_iter()
        .map(|event| {
            let event = event.stamped();
            event.validate()?;
            Ok(event)
        })
        .collect()
}
