//! External collaborator seams
//!
//! The engine's out-of-scope collaborators, reduced to the interfaces
//! it needs: a task runner for `system` event hooks, a macro store for
//! `macro:run` / `macro:load`, and a watch-directory loader for
//! `watchdir:load`. Implementations live in the host application;
//! errors cross the seam as `anyhow::Error`.

/// Executes host-side shell hooks for event triggers
pub trait TaskRunner: Send + Sync {
    /// Run a shell command; fire-and-forget from the engine's view.
    fn run(&self, command: &str) -> anyhow::Result<()>;
}

/// A stored macro
#[derive(Debug, Clone, PartialEq)]
pub struct Macro {
    /// Stable macro id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// G-code content.
    pub content: String,
}

/// Resolves macro ids to their content
pub trait MacroStore: Send + Sync {
    /// Look up a macro by id.
    fn get(&self, id: &str) -> Option<Macro>;
}

/// Loads G-code files from the watched directory
pub trait WatchDirLoader: Send + Sync {
    /// Read the file at a watch-directory relative path.
    fn load(&self, path: &str) -> anyhow::Result<String>;
}
