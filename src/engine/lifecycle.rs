//! Teardown handles returned by sub-engine `initialize()` calls.

use std::fmt;

/// One-shot cleanup action. Running it consumes the handle; dropping it
/// without running does nothing.
pub struct Teardown {
    label: &'static str,
    action: Option<Box<dyn FnOnce() + Send>>,
}

impl Teardown {
    pub fn new(label: &'static str, action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            label,
            action: Some(Box::new(action)),
        }
    }

    /// A teardown with nothing to clean up
    pub fn noop(label: &'static str) -> Self {
        Self {
            label,
            action: None,
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn run(mut self) {
        if let Some(action) = self.action.take() {
            tracing::debug!("Running teardown: {}", self.label);
            action();
        }
    }
}

impl fmt::Debug for Teardown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Teardown")
            .field("label", &self.label)
            .field("pending", &self.action.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_teardown_runs_once() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        let teardown = Teardown::new("flag", move || ran_clone.store(true, Ordering::SeqCst));

        assert_eq!(teardown.label(), "flag");
        teardown.run();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_dropped_teardown_does_nothing() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = ran.clone();
        drop(Teardown::new("flag", move || ran_clone.store(true, Ordering::SeqCst)));
        assert!(!ran.load(Ordering::SeqCst));
        Teardown::noop("noop").run();
    }
}
