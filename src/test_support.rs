//! Log capture for unit tests.

use std::{
    fmt,
    sync::{Arc, Mutex},
};
use tracing::{
    Event, Subscriber,
    field::{Field, Visit},
};
use tracing_subscriber::{layer::Context, prelude::*, Layer};

/// Records the `action` field of every event seen while installed.
#[derive(Clone, Default)]
pub(crate) struct ActionRecorder {
    actions: Arc<Mutex<Vec<String>>>,
}

impl ActionRecorder {
    /// Install as the default subscriber of the current thread.
    pub(crate) fn install(&self) -> tracing::subscriber::DefaultGuard {
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    pub(crate) fn actions(&self) -> Vec<String> {
        self.actions.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, action: &str) -> usize {
        self.actions().iter().filter(|seen| *seen == action).count()
    }
}

impl<S: Subscriber> Layer<S> for ActionRecorder {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = ActionVisitor(None);
        event.record(&mut visitor);
        if let Some(action) = visitor.0 {
            self.actions.lock().unwrap().push(action);
        }
    }
}

struct ActionVisitor(Option<String>);

impl Visit for ActionVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "action" {
            self.0 = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "action" && self.0.is_none() {
            self.0 = Some(format!("{:?}", value).trim_matches('"').to_string());
        }
    }
}
