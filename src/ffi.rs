// C binding surface
//
// A host process creates one `OverlayAgent` handle, which owns a tokio
// runtime and an `InstanceRegistry`, and drives instances through it. Every
// call returns a status code; on failure `overlay_last_error` returns the
// diagnostic for the calling thread. Strings handed out by this module must
// be released with the matching free function.

use std::cell::RefCell;
use std::ffi::{c_char, c_int, CStr, CString};
use std::path::PathBuf;
use std::ptr;
use std::time::Duration;

use crate::config::load_settings;
use crate::error::{AgentError, Result};
use crate::instance::{InstanceConfig, InstanceRegistry, NetworkInfo};
use crate::logging;

pub const OVERLAY_OK: c_int = 0;
pub const OVERLAY_ERR_INVALID: c_int = -1;
pub const OVERLAY_ERR_DUPLICATE: c_int = -2;
pub const OVERLAY_ERR_NOT_FOUND: c_int = -3;
pub const OVERLAY_ERR_STORAGE: c_int = -4;
pub const OVERLAY_ERR_OTHER: c_int = -5;

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = RefCell::new(None);
}

fn set_last_error(message: impl Into<String>) {
    let message = message.into().replace('\0', " ");
    let message = CString::new(message).unwrap_or_default();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(message));
}

fn fail(err: AgentError) -> c_int {
    tracing::debug!(error = %err, "FFI call failed");
    let code = err.status_code();
    set_last_error(err.to_string());
    code
}

/// Borrow a C string argument. Null yields `None`.
///
/// # Safety
/// `ptr` must be null or point to a NUL-terminated string that outlives `'a`.
unsafe fn opt_str<'a>(ptr: *const c_char, what: &str) -> Result<Option<&'a str>> {
    if ptr.is_null() {
        return Ok(None);
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map(|s| Some(s).filter(|s| !s.is_empty()))
        .map_err(|_| AgentError::InvalidConfig(format!("{} is not valid UTF-8", what)))
}

unsafe fn required_str<'a>(ptr: *const c_char, what: &str) -> Result<&'a str> {
    opt_str(ptr, what)?.ok_or_else(|| AgentError::InvalidConfig(format!("{} is required", what)))
}

fn into_c_string(s: &str) -> *mut c_char {
    CString::new(s.replace('\0', " "))
        .map(CString::into_raw)
        .unwrap_or(ptr::null_mut())
}

/// Opaque handle given to the host.
pub struct OverlayAgent {
    runtime: tokio::runtime::Runtime,
    registry: InstanceRegistry,
}

impl OverlayAgent {
    fn new() -> anyhow::Result<Self> {
        let config_path = std::env::var_os("OVERLAY_AGENT_CONFIG").map(PathBuf::from);
        let settings = load_settings(config_path.as_deref())?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("overlay-agent")
            .build()?;
        Ok(Self {
            runtime,
            registry: InstanceRegistry::with_defaults(settings),
        })
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }
}

/// Network identity of an instance's primary session.
#[repr(C)]
pub struct OverlayNetworkInfo {
    pub instance_name: *mut c_char,
    pub network_name: *mut c_char,
    pub virtual_ipv4: *mut c_char,
    pub hostname: *mut c_char,
    pub version: *mut c_char,
}

impl From<NetworkInfo> for OverlayNetworkInfo {
    fn from(info: NetworkInfo) -> Self {
        Self {
            instance_name: into_c_string(&info.instance_name),
            network_name: into_c_string(&info.network_name),
            virtual_ipv4: into_c_string(&info.virtual_ipv4),
            hostname: into_c_string(&info.hostname),
            version: into_c_string(&info.version),
        }
    }
}

/// Install the agent's log output on stderr at `level` (`error`, `warn`,
/// `info`, `debug`, `trace` or `off`; null means `info`). `RUST_LOG` takes
/// precedence when set. Calling it again, or after the host installed its
/// own tracing subscriber, has no effect.
///
/// # Safety
/// `level` must be null or a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn overlay_init_logging(level: *const c_char) -> c_int {
    let result = opt_str(level, "level")
        .and_then(|level| logging::init_with_level(level.unwrap_or("info")));
    match result {
        Ok(()) => OVERLAY_OK,
        Err(e) => fail(e),
    }
}

/// Create an agent handle. Returns null on failure (see `overlay_last_error`).
#[no_mangle]
pub extern "C" fn overlay_agent_new() -> *mut OverlayAgent {
    match OverlayAgent::new() {
        Ok(agent) => Box::into_raw(Box::new(agent)),
        Err(e) => {
            set_last_error(format!("{:#}", e));
            ptr::null_mut()
        }
    }
}

/// Stop every instance and free the handle.
///
/// # Safety
/// `agent` must be null or a handle from `overlay_agent_new` not yet freed.
#[no_mangle]
pub unsafe extern "C" fn overlay_agent_free(agent: *mut OverlayAgent) {
    if agent.is_null() {
        return;
    }
    let agent = Box::from_raw(agent);
    let OverlayAgent { runtime, registry } = *agent;
    runtime.block_on(registry.shutdown());
    runtime.shutdown_timeout(Duration::from_secs(1));
}

/// Start an instance named after its organisation id.
///
/// `organization_id` may be null when the URL path carries it; `machine_id`
/// may be null to use the persisted device identity.
///
/// # Safety
/// `agent` must be a live handle; string arguments must be null or
/// NUL-terminated.
#[no_mangle]
pub unsafe extern "C" fn overlay_start_instance(
    agent: *mut OverlayAgent,
    config_server_url: *const c_char,
    organization_id: *const c_char,
    machine_id: *const c_char,
) -> c_int {
    let Some(agent) = agent.as_ref() else {
        return fail(AgentError::InvalidConfig("agent handle is null".into()));
    };
    let result = (|| -> Result<()> {
        let url = required_str(config_server_url, "config_server_url")?;
        let mut config = InstanceConfig::new(url);
        config.organization_id = opt_str(organization_id, "organization_id")?.map(String::from);
        config.machine_id = opt_str(machine_id, "machine_id")?.map(String::from);

        let (_, instance_name) = config.resolve()?;
        let _guard = agent.runtime.enter();
        agent.registry.start(&instance_name, config)
    })();
    match result {
        Ok(()) => OVERLAY_OK,
        Err(e) => fail(e),
    }
}

/// Stop an instance and leave all its networks.
///
/// # Safety
/// See `overlay_start_instance`. Must not be called from a tokio worker.
#[no_mangle]
pub unsafe extern "C" fn overlay_stop_instance(
    agent: *mut OverlayAgent,
    instance_name: *const c_char,
) -> c_int {
    let Some(agent) = agent.as_ref() else {
        return fail(AgentError::InvalidConfig("agent handle is null".into()));
    };
    let name = match required_str(instance_name, "instance_name") {
        Ok(name) => name,
        Err(e) => return fail(e),
    };
    match agent.runtime.block_on(agent.registry.stop(name)) {
        Ok(()) => OVERLAY_OK,
        Err(e) => fail(e),
    }
}

/// Network info for an instance, or null if it has no live session yet.
/// Free the result with `overlay_free_network_info`.
///
/// # Safety
/// See `overlay_start_instance`.
#[no_mangle]
pub unsafe extern "C" fn overlay_get_network_info(
    agent: *mut OverlayAgent,
    instance_name: *const c_char,
) -> *mut OverlayNetworkInfo {
    let Some(agent) = agent.as_ref() else {
        fail(AgentError::InvalidConfig("agent handle is null".into()));
        return ptr::null_mut();
    };
    let name = match required_str(instance_name, "instance_name") {
        Ok(name) => name,
        Err(e) => {
            fail(e);
            return ptr::null_mut();
        }
    };
    match agent.registry.get_network_info(name) {
        Some(info) => Box::into_raw(Box::new(OverlayNetworkInfo::from(info))),
        None => ptr::null_mut(),
    }
}

/// # Safety
/// `info` must be null or come from `overlay_get_network_info`.
#[no_mangle]
pub unsafe extern "C" fn overlay_free_network_info(info: *mut OverlayNetworkInfo) {
    if info.is_null() {
        return;
    }
    let info = Box::from_raw(info);
    for s in [
        info.instance_name,
        info.network_name,
        info.virtual_ipv4,
        info.hostname,
        info.version,
    ] {
        overlay_free_string(s);
    }
}

/// Write up to `max` instance names into `out`. Returns the number written,
/// or a negative status code.
///
/// # Safety
/// `out` must point to at least `max` writable pointers.
#[no_mangle]
pub unsafe extern "C" fn overlay_list_instances(
    agent: *mut OverlayAgent,
    out: *mut *mut c_char,
    max: usize,
) -> c_int {
    let Some(agent) = agent.as_ref() else {
        return fail(AgentError::InvalidConfig("agent handle is null".into()));
    };
    if out.is_null() && max > 0 {
        return fail(AgentError::InvalidConfig("output buffer is null".into()));
    }
    let names = agent.registry.list();
    let count = names.len().min(max).min(c_int::MAX as usize);
    for (i, name) in names.iter().take(count).enumerate() {
        *out.add(i) = into_c_string(name);
    }
    count as c_int
}

/// # Safety
/// `s` must be null or a string handed out by this library.
#[no_mangle]
pub unsafe extern "C" fn overlay_free_string(s: *mut c_char) {
    if !s.is_null() {
        drop(CString::from_raw(s));
    }
}

/// Last error message for the calling thread, or null. Valid until the next
/// failing call on the same thread.
#[no_mangle]
pub extern "C" fn overlay_last_error() -> *const c_char {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .map(|s| s.as_ptr())
            .unwrap_or(ptr::null())
    })
}
