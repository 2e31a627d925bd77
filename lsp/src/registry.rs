//! Registry of open windows.
//!
//! Each window owns its sessions. Closing a window ends them; the window is
//! dropped from the registry once every session has stopped.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::launcher::ServerLauncher;
use crate::manager::{Collaborators, WindowManager};
use crate::types::LspConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WindowId(u64);

impl fmt::Display for WindowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "window-{}", self.0)
    }
}

#[derive(Default)]
pub struct WindowRegistry {
    windows: BTreeMap<WindowId, WindowManager>,
    next_id: u64,
}

impl WindowRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_window(
        &mut self,
        config: LspConfig,
        launcher: Arc<dyn ServerLauncher>,
        collaborators: Collaborators,
    ) -> WindowId {
        self.next_id += 1;
        let id = WindowId(self.next_id);
        self.windows
            .insert(id, WindowManager::new(config, launcher, collaborators));
        tracing::debug!(window = %id, "Window created");
        id
    }

    #[must_use]
    pub fn get(&self, id: WindowId) -> Option<&WindowManager> {
        self.windows.get(&id)
    }

    pub fn get_mut(&mut self, id: WindowId) -> Option<&mut WindowManager> {
        self.windows.get_mut(&id)
    }

    /// Start tearing down a window. Returns `false` for unknown ids.
    pub fn close_window(&mut self, id: WindowId) -> bool {
        let Some(window) = self.windows.get_mut(&id) else {
            return false;
        };
        window.close_window();
        if window.is_finished() {
            self.windows.remove(&id);
            tracing::debug!(window = %id, "Window removed");
        }
        true
    }

    /// Poll every window, then drop closed windows whose sessions have all
    /// stopped. Returns the number of events handled.
    pub fn poll_events(&mut self, budget_per_window: usize) -> usize {
        let mut handled = 0;
        for window in self.windows.values_mut() {
            handled += window.poll_events(budget_per_window);
        }
        self.windows.retain(|id, window| {
            let keep = !window.is_finished();
            if !keep {
                tracing::debug!(window = %id, "Window removed");
            }
            keep
        });
        handled
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = WindowId> + '_ {
        self.windows.keys().copied()
    }

    /// Close every window and wait for all sessions to stop.
    pub async fn shutdown(&mut self) {
        for window in self.windows.values_mut() {
            window.shutdown().await;
        }
        self.windows.clear();
    }
}
