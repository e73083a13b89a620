//! Unix platform
//!
//! Sessions are logind sessions, read from the runtime state systemd
//! keeps under `/run/systemd`. Hosts become their own process-group
//! leaders and, on Linux, die with the broker through a parent-death
//! signal. A containment group kills the process groups of its members
//! when dropped.

use std::collections::HashMap;
use std::ffi::CStr;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::process::{Child, Command};

use tm_core::{BrokerSettings, LaunchError, PlatformError};

use super::{ChildProcess, ContainmentGroup, Platform, SpawnRequest, SpawnedChild};

const DEFAULT_RUNTIME_DIR: &str = "/run/systemd";
const AUDIT_SESSION_FILE: &str = "/proc/self/sessionid";

/// Native platform for unix hosts
#[derive(Debug, Clone)]
pub struct UnixPlatform {
    service_override: Option<bool>,
    runtime_dir: PathBuf,
}

impl UnixPlatform {
    /// Create the platform, honouring the settings' service-mode override
    pub fn new(settings: &BrokerSettings) -> Self {
        Self {
            service_override: settings.run_as_service,
            runtime_dir: PathBuf::from(DEFAULT_RUNTIME_DIR),
        }
    }

    /// Read session state from another directory laid out like `/run/systemd`
    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    fn sessions_dir(&self) -> PathBuf {
        self.runtime_dir.join("sessions")
    }

    fn session_user(&self, session: u32) -> Result<SessionUser, PlatformError> {
        let path = self.sessions_dir().join(session.to_string());
        let fields = read_keyfile(&path).map_err(|source| PlatformError::Os {
            call: "read logind session",
            source,
        })?;
        let uid = fields
            .get("UID")
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or(PlatformError::NoSessionUser(session))?;
        lookup_user(uid).ok_or(PlatformError::NoSessionUser(session))
    }
}

impl Platform for UnixPlatform {
    fn current_session(&self) -> u32 {
        match std::fs::read_to_string(AUDIT_SESSION_FILE) {
            Ok(text) => match text.trim().parse::<u32>() {
                Ok(u32::MAX) | Err(_) => 0,
                Ok(id) => id,
            },
            Err(_) => 0,
        }
    }

    fn is_service(&self) -> bool {
        self.service_override
            .unwrap_or_else(|| unsafe { libc::getppid() } == 1)
    }

    fn is_protected(&self) -> bool {
        false
    }

    fn interactive_sessions(&self) -> Result<Vec<u32>, PlatformError> {
        let dir = self.sessions_dir();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::debug!("No logind session directory at {:?}", dir);
                return Ok(Vec::new());
            }
            Err(source) => {
                return Err(PlatformError::Os {
                    call: "enumerate logind sessions",
                    source,
                })
            }
        };

        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            match read_keyfile(&entry.path()) {
                Ok(fields) if id != 0 && is_interactive(&fields) => sessions.push(id),
                Ok(_) => {}
                Err(e) => tracing::debug!("Skipping session {}: {}", id, e),
            }
        }
        sessions.sort_unstable();
        Ok(sessions)
    }

    fn active_console_session(&self) -> Option<u32> {
        let seat = read_keyfile(&self.runtime_dir.join("seats").join("seat0")).ok()?;
        seat.get("ACTIVE")?.parse().ok()
    }

    fn create_containment_group(
        &self,
        session: u32,
    ) -> Result<Box<dyn ContainmentGroup>, PlatformError> {
        Ok(Box::new(UnixContainmentGroup {
            session,
            members: Mutex::new(Vec::new()),
        }))
    }

    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedChild, LaunchError> {
        if !request.image.is_file() {
            return Err(LaunchError::ImageNotFound(request.image.clone()));
        }

        let mut cmd = Command::new(&request.image);
        cmd.args(&request.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }

        if request.cross_session {
            let user = self.session_user(request.target_session)?;
            tracing::debug!(
                "Launching {:?} as {} (uid {}) for session {}",
                request.image,
                user.name,
                user.uid,
                request.target_session
            );
            cmd.uid(user.uid)
                .gid(user.gid)
                .env("HOME", &user.home)
                .env("USER", &user.name)
                .env("LOGNAME", &user.name);
        }
        if request.higher_integrity {
            tracing::debug!("Integrity levels are not supported here, launching {:?} unchanged", request.image);
        }

        #[cfg(target_os = "linux")]
        unsafe {
            cmd.pre_exec(|| {
                if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong) != 0 {
                    return Err(io::Error::last_os_error());
                }
                if libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1 as libc::c_ulong, 0, 0, 0) != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "host exited during spawn"))?;

        let missing = |name: &str| io::Error::new(io::ErrorKind::BrokenPipe, format!("host {} not captured", name));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        Ok(SpawnedChild {
            process: Box::new(UnixChild {
                child,
                pid,
                session: request.target_session,
            }),
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        })
    }
}

struct UnixChild {
    child: Child,
    pid: u32,
    session: u32,
}

#[async_trait]
impl ChildProcess for UnixChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn session(&self) -> u32 {
        self.session
    }

    fn resume(&mut self) -> Result<(), PlatformError> {
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        self.child.wait().await.map(|status| status.code())
    }

    fn start_kill(&mut self) -> io::Result<()> {
        self.child.start_kill()
    }
}

/// Process groups of hosts launched for one session
struct UnixContainmentGroup {
    session: u32,
    members: Mutex<Vec<u32>>,
}

impl ContainmentGroup for UnixContainmentGroup {
    fn assign(&self, pid: u32) -> Result<(), PlatformError> {
        if pid == std::process::id() {
            tracing::trace!("Broker itself is not tracked by its containment group");
            return Ok(());
        }
        let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        if !members.contains(&pid) {
            members.push(pid);
        }
        Ok(())
    }
}

impl Drop for UnixContainmentGroup {
    fn drop(&mut self) {
        let members = self.members.get_mut().unwrap_or_else(|e| e.into_inner());
        for pid in members.drain(..) {
            let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
            if rc != 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ESRCH) {
                    tracing::warn!("Failed to kill process group {} of session {}: {}", pid, self.session, err);
                }
            }
        }
    }
}

struct SessionUser {
    uid: u32,
    gid: u32,
    name: String,
    home: PathBuf,
}

fn lookup_user(uid: u32) -> Option<SessionUser> {
    let mut buf = vec![0 as libc::c_char; 16 * 1024];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    let rc = unsafe { libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result) };
    if rc != 0 || result.is_null() {
        return None;
    }

    let name = unsafe { CStr::from_ptr(pwd.pw_name) }.to_string_lossy().into_owned();
    let home = unsafe { CStr::from_ptr(pwd.pw_dir) }.to_string_lossy().into_owned();
    Some(SessionUser {
        uid,
        gid: pwd.pw_gid,
        name,
        home: PathBuf::from(home),
    })
}

fn is_interactive(fields: &HashMap<String, String>) -> bool {
    let class = fields.get("CLASS").map(String::as_str);
    let state = fields.get("STATE").map(String::as_str);
    class == Some("user") && matches!(state, Some("active") | Some("online"))
}

fn read_keyfile(path: &Path) -> io::Result<HashMap<String, String>> {
    Ok(parse_keyfile(&std::fs::read_to_string(path)?))
}

/// Parse the `KEY=value` format logind uses for its state files
fn parse_keyfile(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}
