//! Reactive-binding hook.
//!
//! Every mutation of a record's or aggregate's observable state funnels
//! through an injectable observer so an external binding layer can detect
//! writes. The core assumes nothing beyond "notify on write".

/// The observable state section a write landed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    /// The editable attribute map.
    Active,
    /// The last-synced attribute snapshot.
    Reference,
    /// The validation error map.
    Errors,
    /// In-flight and failure flags, membership, pagination.
    State,
}

/// Observer notified after every write to observable state.
pub trait WriteObserver: Send + Sync {
    /// Called once per completed write.
    fn on_write(&self, target: WriteTarget);
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{WriteObserver, WriteTarget};
    use parking_lot::Mutex;

    /// Records every notification, for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingObserver {
        pub(crate) writes: Mutex<Vec<WriteTarget>>,
    }

    impl WriteObserver for RecordingObserver {
        fn on_write(&self, target: WriteTarget) {
            self.writes.lock().push(target);
        }
    }
}
