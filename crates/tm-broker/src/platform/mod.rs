//! Operating system seam
//!
//! Everything the broker needs from the OS goes through the [`Platform`]
//! trait: session enumeration, containment groups, and spawning host
//! processes with their three pipes. The native implementation is picked
//! at compile time; tests substitute an in-memory one.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use tm_core::{LaunchError, PlatformError};

use crate::transport::{BoxedReader, BoxedWriter};

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::UnixPlatform as NativePlatform;
#[cfg(windows)]
pub use windows::WindowsPlatform as NativePlatform;

/// Everything needed to start one host process
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    /// Host executable
    pub image: PathBuf,
    /// Command line arguments after the image
    pub args: Vec<String>,
    /// Working directory of the new process
    pub working_dir: Option<PathBuf>,
    /// Session the process should run in
    pub target_session: u32,
    /// Target session differs from the broker's, so run as that session's user
    pub cross_session: bool,
    /// Raise the user token's integrity label
    pub higher_integrity: bool,
    /// Launch as a protected process at the broker's own level
    pub protected: bool,
    /// Create outside the broker's containment group, suspended until
    /// the owner has assigned it to a per-session group and resumed it
    pub breakaway: bool,
}

/// A freshly spawned process and the broker's ends of its pipes
pub struct SpawnedChild {
    pub process: Box<dyn ChildProcess>,
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: BoxedReader,
}

/// A running host process
#[async_trait]
pub trait ChildProcess: Send {
    /// OS process id
    fn pid(&self) -> u32;

    /// Session the process actually runs in
    fn session(&self) -> u32;

    /// Let a process created suspended start running
    fn resume(&mut self) -> Result<(), PlatformError>;

    /// Wait for the process to exit, returning its exit code if it has one
    async fn wait(&mut self) -> std::io::Result<Option<i32>>;

    /// Begin forcibly terminating the process
    fn start_kill(&mut self) -> std::io::Result<()>;
}

/// OS mechanism tying a set of processes to a common lifetime
///
/// Dropping the group kills every process assigned to it.
pub trait ContainmentGroup: Send + Sync {
    /// Add a process to the group
    fn assign(&self, pid: u32) -> Result<(), PlatformError>;
}

/// OS facilities used by the broker
pub trait Platform: Send + Sync + 'static {
    /// Session the broker itself runs in
    fn current_session(&self) -> u32;

    /// Whether the broker runs as a system service
    fn is_service(&self) -> bool;

    /// Whether the broker runs as a protected process
    fn is_protected(&self) -> bool;

    /// Non-zero user sessions that are active or disconnected
    fn interactive_sessions(&self) -> Result<Vec<u32>, PlatformError>;

    /// Session currently attached to the physical console, if any
    fn active_console_session(&self) -> Option<u32>;

    /// Create a containment group for processes of `session`
    fn create_containment_group(&self, session: u32)
        -> Result<Box<dyn ContainmentGroup>, PlatformError>;

    /// Start a host process
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedChild, LaunchError>;
}

/// Containment groups created lazily and cached by session id
#[derive(Default)]
pub struct ContainmentGroups {
    groups: Mutex<HashMap<u32, Arc<dyn ContainmentGroup>>>,
}

impl ContainmentGroups {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Group for `session`, creating it on first use
    pub fn get_or_create(
        &self,
        platform: &dyn Platform,
        session: u32,
    ) -> Result<Arc<dyn ContainmentGroup>, PlatformError> {
        let mut groups = self.groups.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(group) = groups.get(&session) {
            return Ok(Arc::clone(group));
        }

        let group: Arc<dyn ContainmentGroup> = Arc::from(platform.create_containment_group(session)?);
        tracing::info!("Created containment group for session {}", session);
        groups.insert(session, Arc::clone(&group));
        Ok(group)
    }

}
