//! Windows platform
//!
//! Hosts talk to the broker over three named pipes: the broker keeps the
//! overlapped server ends, the host inherits synchronous client ends and
//! nothing else. Hosts get a hardened mitigation policy, optionally run
//! protected, and are launched into other sessions with a duplicate of
//! that session's user token. Containment groups are job objects that
//! kill their members when closed.

use std::ffi::{c_void, OsStr};
use std::io;
use std::mem::{size_of, zeroed};
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::ptr::{null, null_mut};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::windows::named_pipe::{NamedPipeServer, ServerOptions};
use uuid::Uuid;
use windows_sys::Win32::Foundation::{
    CloseHandle, FALSE, GENERIC_READ, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE, TRUE, WAIT_FAILED,
};
use windows_sys::Win32::Security::{
    AllocateAndInitializeSid, DuplicateTokenEx, FreeSid, GetLengthSid, GetSidSubAuthority,
    GetTokenInformation, SecurityIdentification, SetTokenInformation, TokenIntegrityLevel,
    TokenPrimary, SECURITY_ATTRIBUTES, SID_AND_ATTRIBUTES, SID_IDENTIFIER_AUTHORITY,
    TOKEN_MANDATORY_LABEL,
};
use windows_sys::Win32::Storage::FileSystem::{CreateFileW, FILE_ATTRIBUTE_NORMAL, OPEN_EXISTING};
use windows_sys::Win32::System::Environment::{CreateEnvironmentBlock, DestroyEnvironmentBlock};
use windows_sys::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
    SetInformationJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JOB_OBJECT_LIMIT_BREAKAWAY_OK,
    JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
};
use windows_sys::Win32::System::RemoteDesktop::{
    ProcessIdToSessionId, WTSActive, WTSDisconnected, WTSEnumerateSessionsW, WTSFreeMemory,
    WTSGetActiveConsoleSessionId, WTSQueryUserToken, WTS_CURRENT_SERVER_HANDLE, WTS_SESSION_INFOW,
};
use windows_sys::Win32::System::Threading::{
    CreateProcessAsUserW, CreateProcessW, DeleteProcThreadAttributeList, GetCurrentProcess,
    GetCurrentProcessId, GetExitCodeProcess, GetProcessInformation,
    InitializeProcThreadAttributeList, OpenProcess, ProcessProtectionLevelInfo, ResumeThread,
    TerminateProcess, UpdateProcThreadAttribute, WaitForSingleObject, CREATE_BREAKAWAY_FROM_JOB,
    CREATE_DEFAULT_ERROR_MODE, CREATE_NO_WINDOW, CREATE_PROTECTED_PROCESS, CREATE_SUSPENDED,
    CREATE_UNICODE_ENVIRONMENT, EXTENDED_STARTUPINFO_PRESENT, INFINITE,
    LPPROC_THREAD_ATTRIBUTE_LIST, NORMAL_PRIORITY_CLASS, PROCESS_INFORMATION,
    PROCESS_PROTECTION_LEVEL_INFORMATION, PROCESS_SET_QUOTA, PROCESS_TERMINATE,
    PROC_THREAD_ATTRIBUTE_HANDLE_LIST, PROC_THREAD_ATTRIBUTE_MITIGATION_POLICY,
    PROC_THREAD_ATTRIBUTE_PROTECTION_LEVEL, STARTF_USESTDHANDLES, STARTUPINFOEXW,
};

use tm_core::{BrokerSettings, LaunchError, PlatformError};

use super::{ChildProcess, ContainmentGroup, Platform, SpawnRequest, SpawnedChild};

const MAXIMUM_ALLOWED: u32 = 0x0200_0000;
const SE_GROUP_INTEGRITY: u32 = 0x0000_0020;
const SECURITY_MANDATORY_LABEL_AUTHORITY: [u8; 6] = [0, 0, 0, 0, 0, 16];
const PROTECTION_LEVEL_SAME: u32 = 0xFFFF_FFFF;
const PROTECTION_LEVEL_NONE: u32 = 0xFFFF_FFFE;
const NO_SESSION: u32 = 0xFFFF_FFFF;

/// Integrity label increment applied for `higher_integrity` hosts
const INTEGRITY_STEP: u32 = 0x100;

/// Mitigation policy applied to every host
const MITIGATION_POLICY: [u64; 2] = [
    0x01 // DEP
        | 0x04 // SEHOP
        | 1 << 8 // force relocate images
        | 1 << 12 // heap terminate
        | 1 << 16 // bottom-up ASLR
        | 1 << 20 // high entropy ASLR
        | 1 << 24 // strict handle checks
        | 1 << 32 // extension point disable
        | 1 << 40 // control flow guard
        | 1 << 48 // font disable
        | 1 << 52 // no remote images
        | 1 << 56 // no low label images
        | 1 << 60, // prefer system32 images
    1 << 4, // loader integrity continuity
];

/// Owned kernel handle
struct Handle(HANDLE);

// Kernel handles may be used and closed from any thread.
unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Handle {
    fn checked(raw: HANDLE, call: &'static str) -> Result<Self, PlatformError> {
        if raw.is_null() || raw == INVALID_HANDLE_VALUE {
            Err(PlatformError::last_os_error(call))
        } else {
            Ok(Self(raw))
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        unsafe {
            CloseHandle(self.0);
        }
    }
}

/// Native platform for Windows hosts
#[derive(Debug, Clone)]
pub struct WindowsPlatform {
    service_override: Option<bool>,
    session: u32,
    protected: bool,
}

impl WindowsPlatform {
    /// Create the platform, honouring the settings' service-mode override
    pub fn new(settings: &BrokerSettings) -> Self {
        Self {
            service_override: settings.run_as_service,
            session: session_of(unsafe { GetCurrentProcessId() }).unwrap_or(0),
            protected: detect_protected(),
        }
    }
}

impl Platform for WindowsPlatform {
    fn current_session(&self) -> u32 {
        self.session
    }

    fn is_service(&self) -> bool {
        self.service_override.unwrap_or(self.session == 0)
    }

    fn is_protected(&self) -> bool {
        self.protected
    }

    fn interactive_sessions(&self) -> Result<Vec<u32>, PlatformError> {
        let mut info: *mut WTS_SESSION_INFOW = null_mut();
        let mut count = 0u32;
        let ok = unsafe { WTSEnumerateSessionsW(WTS_CURRENT_SERVER_HANDLE, 0, 1, &mut info, &mut count) };
        if ok == 0 {
            return Err(PlatformError::last_os_error("WTSEnumerateSessionsW"));
        }

        let sessions = unsafe { std::slice::from_raw_parts(info, count as usize) }
            .iter()
            .filter(|s| s.SessionId != 0 && (s.State == WTSActive || s.State == WTSDisconnected))
            .map(|s| s.SessionId)
            .collect();
        unsafe { WTSFreeMemory(info.cast()) };
        Ok(sessions)
    }

    fn active_console_session(&self) -> Option<u32> {
        match unsafe { WTSGetActiveConsoleSessionId() } {
            NO_SESSION => None,
            session => Some(session),
        }
    }

    fn create_containment_group(
        &self,
        session: u32,
    ) -> Result<Box<dyn ContainmentGroup>, PlatformError> {
        let job = Handle::checked(unsafe { CreateJobObjectW(null(), null()) }, "CreateJobObjectW")?;

        let mut limits: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { zeroed() };
        limits.BasicLimitInformation.LimitFlags =
            JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE | JOB_OBJECT_LIMIT_BREAKAWAY_OK;
        let ok = unsafe {
            SetInformationJobObject(
                job.0,
                JobObjectExtendedLimitInformation,
                &limits as *const _ as *const c_void,
                size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            )
        };
        if ok == 0 {
            return Err(PlatformError::last_os_error("SetInformationJobObject"));
        }

        Ok(Box::new(JobObject { session, job }))
    }

    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedChild, LaunchError> {
        if !request.image.is_file() {
            return Err(LaunchError::ImageNotFound(request.image.clone()));
        }

        let (stdin_server, stdin_child) = pipe_pair(true)?;
        let (stdout_server, stdout_child) = pipe_pair(false)?;
        let (stderr_server, stderr_child) = pipe_pair(false)?;

        // Everything referenced by the attribute list must outlive process creation
        let inherit: [HANDLE; 3] = [stdin_child.0, stdout_child.0, stderr_child.0];
        let policy = MITIGATION_POLICY;
        let protection = PROTECTION_LEVEL_SAME;

        let mut attributes = AttributeList::new(if request.protected { 3 } else { 2 })?;
        attributes.set(
            PROC_THREAD_ATTRIBUTE_HANDLE_LIST as usize,
            inherit.as_ptr().cast(),
            size_of::<[HANDLE; 3]>(),
        )?;
        attributes.set(
            PROC_THREAD_ATTRIBUTE_MITIGATION_POLICY as usize,
            policy.as_ptr().cast(),
            size_of::<[u64; 2]>(),
        )?;
        if request.protected {
            attributes.set(
                PROC_THREAD_ATTRIBUTE_PROTECTION_LEVEL as usize,
                (&protection as *const u32).cast(),
                size_of::<u32>(),
            )?;
        }

        let mut flags = NORMAL_PRIORITY_CLASS
            | CREATE_DEFAULT_ERROR_MODE
            | EXTENDED_STARTUPINFO_PRESENT
            | CREATE_NO_WINDOW;
        if request.protected {
            flags |= CREATE_PROTECTED_PROCESS;
        }
        if request.breakaway {
            flags |= CREATE_BREAKAWAY_FROM_JOB | CREATE_SUSPENDED;
        }

        let mut startup: STARTUPINFOEXW = unsafe { zeroed() };
        startup.StartupInfo.cb = size_of::<STARTUPINFOEXW>() as u32;
        startup.StartupInfo.dwFlags = STARTF_USESTDHANDLES;
        startup.StartupInfo.hStdInput = stdin_child.0;
        startup.StartupInfo.hStdOutput = stdout_child.0;
        startup.StartupInfo.hStdError = stderr_child.0;
        startup.lpAttributeList = attributes.as_ptr();

        let mut command_line = command_line(&request.image, &request.args);
        let working_dir = request.working_dir.as_deref().map(|d| wide(d.as_os_str()));
        let working_dir_ptr = working_dir.as_ref().map_or(null(), |d| d.as_ptr());
        let mut info: PROCESS_INFORMATION = unsafe { zeroed() };

        let ok = if request.cross_session {
            let token = session_token(request.target_session, request.higher_integrity)?;
            let environment = EnvironmentBlock::new(&token)?;
            unsafe {
                CreateProcessAsUserW(
                    token.0,
                    null(),
                    command_line.as_mut_ptr(),
                    null(),
                    null(),
                    TRUE,
                    flags | CREATE_UNICODE_ENVIRONMENT,
                    environment.0,
                    working_dir_ptr,
                    &startup.StartupInfo,
                    &mut info,
                )
            }
        } else {
            unsafe {
                CreateProcessW(
                    null(),
                    command_line.as_mut_ptr(),
                    null(),
                    null(),
                    TRUE,
                    flags,
                    null(),
                    working_dir_ptr,
                    &startup.StartupInfo,
                    &mut info,
                )
            }
        };
        if ok == 0 {
            return Err(PlatformError::last_os_error("CreateProcess").into());
        }

        let process = Handle(info.hProcess);
        let thread = Handle(info.hThread);
        let pid = info.dwProcessId;
        let session = session_of(pid).unwrap_or(request.target_session);
        tracing::debug!("Created pid {} in session {} with flags {:#x}", pid, session, flags);

        Ok(SpawnedChild {
            process: Box::new(WindowsChild {
                process: Arc::new(process),
                thread: Some(thread),
                pid,
                session,
            }),
            stdin: Box::new(stdin_server),
            stdout: Box::new(stdout_server),
            stderr: Box::new(stderr_server),
        })
    }
}

struct WindowsChild {
    process: Arc<Handle>,
    /// Primary thread, kept until the process has been resumed
    thread: Option<Handle>,
    pid: u32,
    session: u32,
}

#[async_trait]
impl ChildProcess for WindowsChild {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn session(&self) -> u32 {
        self.session
    }

    fn resume(&mut self) -> Result<(), PlatformError> {
        if let Some(thread) = self.thread.take() {
            if unsafe { ResumeThread(thread.0) } == u32::MAX {
                return Err(PlatformError::last_os_error("ResumeThread"));
            }
        }
        Ok(())
    }

    async fn wait(&mut self) -> io::Result<Option<i32>> {
        let process = Arc::clone(&self.process);
        tokio::task::spawn_blocking(move || {
            if unsafe { WaitForSingleObject(process.0, INFINITE) } == WAIT_FAILED {
                return Err(io::Error::last_os_error());
            }
            let mut code = 0u32;
            if unsafe { GetExitCodeProcess(process.0, &mut code) } == 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(Some(code as i32))
        })
        .await
        .map_err(io::Error::other)?
    }

    fn start_kill(&mut self) -> io::Result<()> {
        if unsafe { TerminateProcess(self.process.0, 1) } == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Job object holding the hosts of one session
struct JobObject {
    session: u32,
    job: Handle,
}

impl ContainmentGroup for JobObject {
    fn assign(&self, pid: u32) -> Result<(), PlatformError> {
        let ok = if pid == unsafe { GetCurrentProcessId() } {
            unsafe { AssignProcessToJobObject(self.job.0, GetCurrentProcess()) }
        } else {
            let process = Handle::checked(
                unsafe { OpenProcess(PROCESS_SET_QUOTA | PROCESS_TERMINATE, FALSE, pid) },
                "OpenProcess",
            )?;
            unsafe { AssignProcessToJobObject(self.job.0, process.0) }
        };
        if ok == 0 {
            return Err(PlatformError::last_os_error("AssignProcessToJobObject"));
        }
        tracing::debug!("Assigned pid {} to the job of session {}", pid, self.session);
        Ok(())
    }
}

/// Attribute list handed to process creation
struct AttributeList {
    buf: Vec<u64>,
}

impl AttributeList {
    fn new(count: u32) -> Result<Self, PlatformError> {
        let mut size = 0usize;
        unsafe { InitializeProcThreadAttributeList(null_mut(), count, 0, &mut size) };
        if size == 0 {
            return Err(PlatformError::last_os_error("InitializeProcThreadAttributeList"));
        }

        let mut buf = vec![0u64; size.div_ceil(size_of::<u64>())];
        let ok = unsafe { InitializeProcThreadAttributeList(buf.as_mut_ptr().cast(), count, 0, &mut size) };
        if ok == 0 {
            return Err(PlatformError::last_os_error("InitializeProcThreadAttributeList"));
        }
        Ok(Self { buf })
    }

    fn as_ptr(&mut self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        self.buf.as_mut_ptr().cast()
    }

    fn set(&mut self, attribute: usize, value: *const c_void, size: usize) -> Result<(), PlatformError> {
        let ok = unsafe { UpdateProcThreadAttribute(self.as_ptr(), 0, attribute, value, size, null_mut(), null()) };
        if ok == 0 {
            return Err(PlatformError::last_os_error("UpdateProcThreadAttribute"));
        }
        Ok(())
    }
}

impl Drop for AttributeList {
    fn drop(&mut self) {
        unsafe { DeleteProcThreadAttributeList(self.as_ptr()) };
    }
}

/// Environment block of a user token
struct EnvironmentBlock(*mut c_void);

impl EnvironmentBlock {
    fn new(token: &Handle) -> Result<Self, PlatformError> {
        let mut block = null_mut();
        if unsafe { CreateEnvironmentBlock(&mut block, token.0, FALSE) } == 0 {
            return Err(PlatformError::last_os_error("CreateEnvironmentBlock"));
        }
        Ok(Self(block))
    }
}

impl Drop for EnvironmentBlock {
    fn drop(&mut self) {
        unsafe { DestroyEnvironmentBlock(self.0) };
    }
}

/// Broker-side server end plus an inheritable host-side client end
fn pipe_pair(to_child: bool) -> Result<(NamedPipeServer, Handle), LaunchError> {
    let name = format!(r"\\.\pipe\tm-broker-{}-{}", std::process::id(), Uuid::new_v4().simple());
    let server = ServerOptions::new()
        .first_pipe_instance(true)
        .reject_remote_clients(true)
        .access_inbound(!to_child)
        .access_outbound(to_child)
        .create(&name)?;

    let attributes = SECURITY_ATTRIBUTES {
        nLength: size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: null_mut(),
        bInheritHandle: TRUE,
    };
    let access = if to_child { GENERIC_READ } else { GENERIC_WRITE };
    let wide_name = wide(OsStr::new(&name));
    let client = Handle::checked(
        unsafe {
            CreateFileW(
                wide_name.as_ptr(),
                access,
                0,
                &attributes,
                OPEN_EXISTING,
                FILE_ATTRIBUTE_NORMAL,
                null_mut(),
            )
        },
        "CreateFileW",
    )?;

    Ok((server, client))
}

/// Duplicate the user token of `session` as a primary token
fn session_token(session: u32, higher_integrity: bool) -> Result<Handle, PlatformError> {
    let mut user = null_mut();
    if unsafe { WTSQueryUserToken(session, &mut user) } == 0 {
        tracing::debug!("WTSQueryUserToken({}) failed: {}", session, io::Error::last_os_error());
        return Err(PlatformError::NoSessionUser(session));
    }
    let user = Handle(user);

    let mut primary = null_mut();
    let ok = unsafe {
        DuplicateTokenEx(user.0, MAXIMUM_ALLOWED, null(), SecurityIdentification, TokenPrimary, &mut primary)
    };
    if ok == 0 {
        return Err(PlatformError::last_os_error("DuplicateTokenEx"));
    }
    let primary = Handle(primary);

    if higher_integrity {
        raise_integrity(&primary)?;
    }
    Ok(primary)
}

/// Raise the token's mandatory label slightly above its current level
fn raise_integrity(token: &Handle) -> Result<(), PlatformError> {
    let mut len = 0u32;
    unsafe { GetTokenInformation(token.0, TokenIntegrityLevel, null_mut(), 0, &mut len) };
    if len == 0 {
        return Err(PlatformError::last_os_error("GetTokenInformation"));
    }

    let mut buf = vec![0u64; (len as usize).div_ceil(size_of::<u64>())];
    let ok = unsafe { GetTokenInformation(token.0, TokenIntegrityLevel, buf.as_mut_ptr().cast(), len, &mut len) };
    if ok == 0 {
        return Err(PlatformError::last_os_error("GetTokenInformation"));
    }
    let current = unsafe {
        let label = &*(buf.as_ptr() as *const TOKEN_MANDATORY_LABEL);
        *GetSidSubAuthority(label.Label.Sid, 0)
    };

    let authority = SID_IDENTIFIER_AUTHORITY {
        Value: SECURITY_MANDATORY_LABEL_AUTHORITY,
    };
    let mut sid = null_mut();
    let ok = unsafe {
        AllocateAndInitializeSid(&authority, 1, current + INTEGRITY_STEP, 0, 0, 0, 0, 0, 0, 0, &mut sid)
    };
    if ok == 0 {
        return Err(PlatformError::last_os_error("AllocateAndInitializeSid"));
    }

    let label = TOKEN_MANDATORY_LABEL {
        Label: SID_AND_ATTRIBUTES {
            Sid: sid,
            Attributes: SE_GROUP_INTEGRITY,
        },
    };
    let ok = unsafe {
        let size = size_of::<TOKEN_MANDATORY_LABEL>() as u32 + GetLengthSid(sid);
        let ok = SetTokenInformation(token.0, TokenIntegrityLevel, (&label as *const TOKEN_MANDATORY_LABEL).cast(), size);
        FreeSid(sid);
        ok
    };
    if ok == 0 {
        return Err(PlatformError::last_os_error("SetTokenInformation"));
    }

    tracing::debug!("Raised token integrity from {:#x} to {:#x}", current, current + INTEGRITY_STEP);
    Ok(())
}

fn session_of(pid: u32) -> Option<u32> {
    let mut session = 0u32;
    (unsafe { ProcessIdToSessionId(pid, &mut session) } != 0).then_some(session)
}

fn detect_protected() -> bool {
    let mut info: PROCESS_PROTECTION_LEVEL_INFORMATION = unsafe { zeroed() };
    let ok = unsafe {
        GetProcessInformation(
            GetCurrentProcess(),
            ProcessProtectionLevelInfo,
            (&mut info as *mut PROCESS_PROTECTION_LEVEL_INFORMATION).cast(),
            size_of::<PROCESS_PROTECTION_LEVEL_INFORMATION>() as u32,
        )
    };
    ok != 0 && info.ProtectionLevel != PROTECTION_LEVEL_NONE
}

fn wide(text: &OsStr) -> Vec<u16> {
    text.encode_wide().chain(std::iter::once(0)).collect()
}

/// Quoted command line: image first, then each argument
fn command_line(image: &Path, args: &[String]) -> Vec<u16> {
    let mut line = format!("\"{}\"", image.display());
    for arg in args {
        line.push(' ');
        if arg.is_empty() || arg.contains(&[' ', '\t', '"'][..]) {
            line.push('"');
            line.push_str(&arg.replace('"', "\\\""));
            line.push('"');
        } else {
            line.push_str(arg);
        }
    }
    wide(OsStr::new(&line))
}
