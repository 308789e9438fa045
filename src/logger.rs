use log::info;

/// A sink for test-driver log lines.
///
/// A handle carries two of these: one for serial console lines and one for
/// machine state transitions. Implementations may open genuine nested
/// regions (indented sections in a structured report); the default logs the
/// heading once and returns a guard with no exit action.
pub trait TestLogger: Send + Sync {
    /// Emit one log line.
    fn log(&self, message: &str);

    /// Open a scoped region headed by `message`.
    ///
    /// The region closes when the returned guard drops, on every exit path.
    fn nested(&self, message: &str) -> NestedRegion {
        self.log(message);
        NestedRegion::plain()
    }
}

/// Guard for a scoped logging region.
///
/// The exit action, if any, runs when the guard is dropped.
pub struct NestedRegion {
    on_exit: Option<Box<dyn FnOnce() + Send>>,
}

impl NestedRegion {
    /// A region with no exit action.
    pub fn plain() -> Self {
        Self { on_exit: None }
    }

    /// A region that runs `on_exit` when dropped.
    pub fn with_exit(on_exit: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_exit: Some(Box::new(on_exit)),
        }
    }
}

impl Drop for NestedRegion {
    fn drop(&mut self) {
        if let Some(on_exit) = self.on_exit.take() {
            on_exit();
        }
    }
}

/// Forwards every line to the `log` crate at info level.
pub struct LogFacade;

impl TestLogger for LogFacade {
    fn log(&self, message: &str) {
        info!("{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Mutex};

    /// Captures lines for assertions.
    #[derive(Default)]
    pub(crate) struct Recorder {
        lines: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        pub(crate) fn lines(&self) -> Vec<String> {
            self.lines.lock().unwrap().clone()
        }
    }

    impl TestLogger for Recorder {
        fn log(&self, message: &str) {
            self.lines.lock().unwrap().push(message.to_string());
        }

        fn nested(&self, message: &str) -> NestedRegion {
            self.log(&format!("enter: {message}"));
            let lines = Arc::clone(&self.lines);
            let message = message.to_string();
            NestedRegion::with_exit(move || {
                lines.lock().unwrap().push(format!("exit: {message}"));
            })
        }
    }

    #[test]
    fn test_default_nested_logs_heading_once() {
        // Recorder overrides nested; go through a sink that keeps the
        // default implementation.
        struct Plain(Recorder);
        impl TestLogger for Plain {
            fn log(&self, message: &str) {
                self.0.log(message);
            }
        }

        let plain = Plain(Recorder::default());
        {
            let _region = plain.nested("boot");
        }
        assert_eq!(plain.0.lines(), vec!["boot"]);
    }

    #[test]
    fn test_exit_action_runs_on_drop() {
        let recorder = Recorder::default();
        {
            let _region = recorder.nested("boot");
            recorder.log("inside");
        }
        assert_eq!(recorder.lines(), vec!["enter: boot", "inside", "exit: boot"]);
    }
}
