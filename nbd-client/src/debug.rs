//! Per-handle debug output.

use std::fmt;

/// Receives `(context, message)` pairs, where the context names the handle
/// operation that produced the message.
pub type DebugCallback = Box<dyn FnMut(&str, &str) + Send>;

/// Debug messages go to the registered callback when there is one and to
/// `tracing` otherwise. Nothing is emitted while disabled.
#[derive(Default)]
pub(crate) struct DebugSink {
    enabled: bool,
    callback: Option<DebugCallback>,
}

impl DebugSink {
    pub(crate) fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub(crate) fn set_callback(&mut self, callback: Option<DebugCallback>) {
        self.callback = callback;
    }

    pub(crate) fn emit(&mut self, context: &str, args: fmt::Arguments<'_>) {
        if !self.enabled {
            return;
        }
        match self.callback.as_mut() {
            Some(callback) => callback(context, &args.to_string()),
            None => tracing::debug!(target: "nbd_client::debug", context, "{args}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    #[test]
    fn disabled_by_default() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut sink = DebugSink::default();
        let captured = Arc::clone(&seen);
        sink.set_callback(Some(Box::new(move |ctx: &str, msg: &str| {
            captured.lock().push(format!("{ctx}: {msg}"));
        })));

        sink.emit("connect", format_args!("hello"));
        assert!(seen.lock().is_empty());

        sink.set_enabled(true);
        sink.emit("connect", format_args!("greeting {}", 16));
        assert_eq!(&*seen.lock(), &["connect: greeting 16".to_string()]);
    }

    #[test]
    fn enabled_without_callback_uses_tracing() {
        let mut sink = DebugSink::default();
        sink.set_enabled(true);
        assert!(sink.is_enabled());
        sink.emit("poll", format_args!("no subscriber installed"));
    }
}
