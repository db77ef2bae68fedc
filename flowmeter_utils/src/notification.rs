use parking_lot::Mutex;

/// One-shot notification shared between the coordinator and worker
/// threads. Workers poll it once per block; the coordinator sets it
/// exactly once at teardown.
#[derive(Default)]
pub struct Notification {
    done: Mutex<bool>,
}

impl Notification {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        *self.done.lock() = true;
    }

    pub fn has_been_notified(&self) -> bool {
        *self.done.lock()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_notify_once() {
        let n = Notification::new();
        assert!(!n.has_been_notified());
        n.notify();
        assert!(n.has_been_notified());
        // Notifying again is harmless.
        n.notify();
        assert!(n.has_been_notified());
    }

    #[test]
    fn test_seen_across_threads() {
        let n = Arc::new(Notification::new());
        let n2 = n.clone();
        let handle = std::thread::spawn(move || {
            while !n2.has_been_notified() {
                std::thread::yield_now();
            }
        });
        n.notify();
        handle.join().unwrap();
    }
}
