use std::io;
use std::sync::{Mutex, PoisonError};

use talkbook_types::SavedPosition;

/// Where a book's listening position is persisted between sessions.
pub trait PositionStore: Send + Sync {
    /// Position saved by a previous session, if any.
    fn load(&self) -> Option<SavedPosition>;

    fn save(&self, position: &SavedPosition) -> io::Result<()>;
}

/// Process-local store, for embedding and tests.
#[derive(Debug, Default)]
pub struct MemoryPositionStore {
    saved: Mutex<Option<SavedPosition>>,
}

impl MemoryPositionStore {
    pub fn new(initial: Option<SavedPosition>) -> Self {
        Self {
            saved: Mutex::new(initial),
        }
    }

    pub fn get(&self) -> Option<SavedPosition> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PositionStore for MemoryPositionStore {
    fn load(&self) -> Option<SavedPosition> {
        self.get()
    }

    fn save(&self, position: &SavedPosition) -> io::Result<()> {
        *self.saved.lock().unwrap_or_else(PoisonError::into_inner) = Some(position.clone());
        Ok(())
    }
}
