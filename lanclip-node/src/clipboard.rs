use std::sync::{Mutex, PoisonError};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClipboardError {
    #[error("clipboard unavailable: {0}")]
    Unavailable(String),
    #[error("clipboard access failed: {0}")]
    Access(String),
}

/// Local clipboard, plain text only. Calls may block; the node runs them on
/// the blocking pool.
pub trait ClipboardAccess: Send + Sync {
    fn read(&self) -> Result<String, ClipboardError>;
    fn write(&self, text: &str) -> Result<(), ClipboardError>;
}

/// The OS clipboard through `arboard`.
///
/// One `arboard::Clipboard` is opened on first use and kept for the life of
/// the node: on X11 and Wayland the owning instance serves pasted text, so
/// dropping it after a write would discard the text again.
#[derive(Default)]
pub struct SystemClipboard {
    handle: Retained<arboard::Clipboard>,
}

impl SystemClipboard {
    pub fn new() -> Self {
        Self::default()
    }
}

fn open_system_clipboard() -> Result<arboard::Clipboard, ClipboardError> {
    arboard::Clipboard::new().map_err(|err| ClipboardError::Unavailable(err.to_string()))
}

impl ClipboardAccess for SystemClipboard {
    fn read(&self) -> Result<String, ClipboardError> {
        self.handle
            .with(open_system_clipboard, |clipboard| match clipboard.get_text() {
                Ok(text) => Ok(text),
                // Empty clipboard or non-text content.
                Err(arboard::Error::ContentNotAvailable) => Ok(String::new()),
                Err(err) => Err(ClipboardError::Access(err.to_string())),
            })
    }

    fn write(&self, text: &str) -> Result<(), ClipboardError> {
        self.handle.with(open_system_clipboard, |clipboard| {
            clipboard
                .set_text(text.to_owned())
                .map_err(|err| ClipboardError::Access(err.to_string()))
        })
    }
}

/// A lazily opened handle that is reused until a call through it fails.
struct Retained<T> {
    slot: Mutex<Option<T>>,
}

impl<T> Default for Retained<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<T> Retained<T> {
    fn with<R>(
        &self,
        open: impl FnOnce() -> Result<T, ClipboardError>,
        call: impl FnOnce(&mut T) -> Result<R, ClipboardError>,
    ) -> Result<R, ClipboardError> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let mut handle = match slot.take() {
            Some(handle) => handle,
            None => open()?,
        };
        let result = call(&mut handle);
        // A failed call may mean the display connection went away; reopen next time.
        if result.is_ok() {
            *slot = Some(handle);
        }
        result
    }
}

/// In-process clipboard for headless hosts and tests.
#[derive(Debug, Default)]
pub struct MemoryClipboard {
    text: Mutex<String>,
    writes: Mutex<Vec<String>>,
}

impl MemoryClipboard {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: Mutex::new(text.into()),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Simulates a local copy by the user.
    pub fn set(&self, text: impl Into<String>) {
        *self.text.lock().unwrap_or_else(PoisonError::into_inner) = text.into();
    }

    pub fn current(&self) -> String {
        self.text
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Every value written through [`ClipboardAccess::write`], oldest first.
    pub fn writes(&self) -> Vec<String> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ClipboardAccess for MemoryClipboard {
    fn read(&self) -> Result<String, ClipboardError> {
        Ok(self.current())
    }

    fn write(&self, text: &str) -> Result<(), ClipboardError> {
        self.set(text);
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(text.to_owned());
        Ok(())
    }
}
