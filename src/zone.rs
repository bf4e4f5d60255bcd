//! The process-global fabric/domain/EQ context plus the connection
//! acceptance loop (`rpma_zone` in the source).

use std::ffi::CString;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{check_timeout, Config};
use crate::connection::{Connection, ConnectionHandle, EndpointId};
use crate::error::{check_fi, Error, ProtocolError, Result};
use crate::ffi;

const RX_TX_SIZE: usize = 256;
const DEFAULT_TIMEOUT_MS: i64 = 1000;

/// The three events the zone's connection-event callback observes.
pub enum ZoneEvent {
    /// A client initiated `wait_connections`; fired once, synthetically,
    /// before the event loop starts reading the EQ.
    Outgoing,
    /// A passive endpoint received `FI_CONNREQ`. The callback is expected
    /// to build a `Connection` and call `accept`/`reject` on it before
    /// returning.
    Incoming,
    /// A connection's endpoint received `FI_SHUTDOWN`.
    Disconnect(ConnectionHandle),
}

/// What a timeout callback asks the event loop to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutAction {
    Continue,
    Break,
}

pub trait OnConnectionEvent: FnMut(&Zone, ZoneEvent) -> Result<()> + Send {}
impl<F: FnMut(&Zone, ZoneEvent) -> Result<()> + Send> OnConnectionEvent for F {}

pub trait OnTimeout: FnMut(&Zone) -> TimeoutAction + Send {}
impl<F: FnMut(&Zone) -> TimeoutAction + Send> OnTimeout for F {}

struct Callbacks {
    on_event: Option<Box<dyn OnConnectionEvent>>,
    on_timeout: Option<Box<dyn OnTimeout>>,
}

pub(crate) struct ZoneShared {
    pub(crate) info: *mut ffi::fi_info,
    fabric: *mut ffi::fid_fabric,
    pub(crate) domain: *mut ffi::fid_domain,
    eq: *mut ffi::fid_eq,
    pub(crate) pep: Mutex<*mut ffi::fid_pep>,

    /// Stashed by the EQ loop between `FI_CONNREQ` and the user's
    /// `accept`/`reject` call; only ever touched from the zone thread.
    pub(crate) conn_req_info: Mutex<*mut ffi::fi_info>,

    registry: Mutex<std::collections::HashMap<EndpointId, ConnectionHandle>>,

    waiting: AtomicBool,
    active_connections: AtomicUsize,
    timeout_ms: AtomicI64,
    callbacks: Mutex<Callbacks>,

    pub(crate) msg_size: usize,
    pub(crate) send_queue_length: u64,
    pub(crate) recv_queue_length: u64,
    is_server: bool,
}

unsafe impl Send for ZoneShared {}
unsafe impl Sync for ZoneShared {}

/// Owns the fabric/domain/EQ and the registry of live connections.
#[derive(Clone)]
pub struct Zone(pub(crate) Arc<ZoneShared>);

fn provider_name() -> &'static str {
    if cfg!(feature = "sockets-provider") {
        "sockets"
    } else {
        "verbs"
    }
}

unsafe fn hints_new() -> Result<*mut ffi::fi_info> {
    let hints = ffi::fi_allocinfo();
    if hints.is_null() {
        return Err(Error::alloc());
    }

    (*(*hints).ep_attr).ty = ffi::FI_EP_MSG;
    (*(*hints).domain_attr).mr_mode = ffi::FI_MR_BASIC;
    (*(*hints).domain_attr).threading = ffi::FI_THREAD_SAFE;
    (*hints).caps = ffi::FI_MSG | ffi::FI_RMA;
    (*hints).mode = ffi::FI_CONTEXT | ffi::FI_LOCAL_MR | ffi::FI_RX_CQ_DATA;
    (*(*hints).tx_attr).msg_order = ffi::FI_ORDER_RAW | ffi::FI_ORDER_SAW;
    (*hints).addr_format = ffi::FI_SOCKADDR;
    (*(*hints).tx_attr).size = RX_TX_SIZE;
    (*(*hints).rx_attr).size = RX_TX_SIZE;

    let prov_name = CString::new(provider_name()).unwrap();
    (*(*hints).fabric_attr).prov_name = libc::strdup(prov_name.as_ptr());
    if (*(*hints).fabric_attr).prov_name.is_null() {
        ffi::fi_freeinfo(hints);
        return Err(Error::alloc());
    }

    Ok(hints)
}

unsafe fn info_new(cfg: &Config) -> Result<*mut ffi::fi_info> {
    let hints = hints_new()?;

    let mut flags = 0u64;
    if cfg.is_server() {
        flags |= ffi::FI_SOURCE;
    }

    let addr = cfg.addr().map(|s| CString::new(s).unwrap());
    let service = cfg.service().map(|s| CString::new(s).unwrap());

    let mut info: *mut ffi::fi_info = ptr::null_mut();
    let ret = ffi::fi_getinfo(
        ffi::FI_VERSION_1_4,
        addr.as_ref().map_or(ptr::null(), |c| c.as_ptr()),
        service.as_ref().map_or(ptr::null(), |c| c.as_ptr()),
        flags,
        hints,
        &mut info,
    );

    libc::free((*(*hints).fabric_attr).prov_name as *mut _);
    ffi::fi_freeinfo(hints);

    check_fi("fi_getinfo", ret)?;
    Ok(info)
}

impl Zone {
    /// Builds the libfabric hints, resolves `(addr, service)`, and opens
    /// the fabric, domain, and event queue, per §4.1.
    pub fn new(cfg: &Config) -> Result<Self> {
        unsafe {
            let info = info_new(cfg)?;

            let mut fabric: *mut ffi::fid_fabric = ptr::null_mut();
            let ret = ffi::fi_fabric((*info).fabric_attr, &mut fabric, ptr::null_mut());
            if let Err(e) = check_fi("fi_fabric", ret) {
                ffi::fi_freeinfo(info);
                return Err(e);
            }

            let mut domain: *mut ffi::fid_domain = ptr::null_mut();
            let ret = ffi::fi_domain(fabric, info, &mut domain, ptr::null_mut());
            if let Err(e) = check_fi("fi_domain", ret) {
                ffi::fi_close(fabric as ffi::fid_t);
                ffi::fi_freeinfo(info);
                return Err(e);
            }

            let eq_attr = ffi::fi_eq_attr {
                size: 0,
                flags: 0,
                wait_obj: ffi::FI_WAIT_UNSPEC,
                signaling_vector: 0,
                wait_set: ptr::null_mut(),
            };
            let mut eq: *mut ffi::fid_eq = ptr::null_mut();
            let ret = ffi::fi_eq_open(fabric, &eq_attr, &mut eq, ptr::null_mut());
            if let Err(e) = check_fi("fi_eq_open", ret) {
                ffi::fi_close(domain as ffi::fid_t);
                ffi::fi_close(fabric as ffi::fid_t);
                ffi::fi_freeinfo(info);
                return Err(e);
            }

            Ok(Zone(Arc::new(ZoneShared {
                info,
                fabric,
                domain,
                eq,
                pep: Mutex::new(ptr::null_mut()),
                conn_req_info: Mutex::new(ptr::null_mut()),
                registry: Mutex::new(std::collections::HashMap::new()),
                waiting: AtomicBool::new(false),
                active_connections: AtomicUsize::new(0),
                timeout_ms: AtomicI64::new(DEFAULT_TIMEOUT_MS),
                callbacks: Mutex::new(Callbacks {
                    on_event: None,
                    on_timeout: None,
                }),
                msg_size: cfg.msg_size(),
                send_queue_length: cfg.send_queue_length(),
                recv_queue_length: cfg.recv_queue_length(),
                is_server: cfg.is_server(),
            })))
        }
    }

    /// A zone with no fabric/domain/EQ opened, for dispatcher tests that
    /// need a `Connection` to enqueue but never touch the wire.
    #[cfg(test)]
    pub(crate) fn new_test_stub() -> Self {
        Zone(Arc::new(ZoneShared {
            info: ptr::null_mut(),
            fabric: ptr::null_mut(),
            domain: ptr::null_mut(),
            eq: ptr::null_mut(),
            pep: Mutex::new(ptr::null_mut()),
            conn_req_info: Mutex::new(ptr::null_mut()),
            registry: Mutex::new(std::collections::HashMap::new()),
            waiting: AtomicBool::new(false),
            active_connections: AtomicUsize::new(0),
            timeout_ms: AtomicI64::new(DEFAULT_TIMEOUT_MS),
            callbacks: Mutex::new(Callbacks {
                on_event: None,
                on_timeout: None,
            }),
            msg_size: 64,
            send_queue_length: 4,
            recv_queue_length: 4,
            is_server: false,
        }))
    }

    pub(crate) fn domain_ptr(&self) -> *mut ffi::fid_domain {
        self.0.domain
    }

    pub(crate) fn eq_ptr(&self) -> *mut ffi::fid_eq {
        self.0.eq
    }

    pub fn msg_size(&self) -> usize {
        self.0.msg_size
    }

    pub fn send_queue_length(&self) -> u64 {
        self.0.send_queue_length
    }

    pub fn recv_queue_length(&self) -> u64 {
        self.0.recv_queue_length
    }

    pub fn active_connections(&self) -> usize {
        self.0.active_connections.load(Ordering::Acquire)
    }

    pub fn register_on_connection_event(&self, func: impl OnConnectionEvent + 'static) {
        self.0.callbacks.lock().unwrap().on_event = Some(Box::new(func));
    }

    /// Registers a timeout handler. `timeout_ms < 0` fails with
    /// `Error::Protocol(ProtocolError::NegativeTimeout)` (`E_NEGATIVE_TIMEOUT`).
    pub fn register_on_timeout(&self, timeout_ms: i64, func: impl OnTimeout + 'static) -> Result<()> {
        let ms = check_timeout(timeout_ms)?;
        self.0.timeout_ms.store(ms as i64, Ordering::Release);
        self.0.callbacks.lock().unwrap().on_timeout = Some(Box::new(func));
        Ok(())
    }

    pub fn unregister_on_timeout(&self) {
        self.0.timeout_ms.store(DEFAULT_TIMEOUT_MS, Ordering::Release);
        self.0.callbacks.lock().unwrap().on_timeout = None;
    }

    fn listen(&self) -> Result<()> {
        let mut pep: *mut ffi::fid_pep = ptr::null_mut();
        unsafe {
            let ret = ffi::fi_passive_ep(self.0.fabric, self.0.info, &mut pep, ptr::null_mut());
            check_fi("fi_passive_ep", ret)?;

            let ret = ffi::fi_pep_bind(pep, self.0.eq as ffi::fid_t, 0);
            if let Err(e) = check_fi("fi_pep_bind", ret) {
                ffi::fi_close(pep as ffi::fid_t);
                return Err(e);
            }

            let ret = ffi::fi_listen(pep);
            if let Err(e) = check_fi("fi_listen", ret) {
                ffi::fi_close(pep as ffi::fid_t);
                return Err(e);
            }
        }
        *self.0.pep.lock().unwrap() = pep;
        log::debug!("zone: listening");
        Ok(())
    }

    /// Runs the EQ event loop (§4.1). Blocks the calling thread.
    pub fn wait_connections(&self) -> Result<()> {
        self.0.waiting.store(true, Ordering::Release);

        if self.0.is_server {
            let mut pep = self.0.pep.lock().unwrap();
            if pep.is_null() {
                drop(pep);
                self.listen()?;
            }
        } else {
            self.fire_event(ZoneEvent::Outgoing)?;
        }

        while self.0.waiting.load(Ordering::Acquire) {
            match self.eq_read()? {
                EqReadResult::Timeout => {
                    let action = {
                        let mut cbs = self.0.callbacks.lock().unwrap();
                        match cbs.on_timeout.as_mut() {
                            Some(f) => f(self),
                            None => TimeoutAction::Continue,
                        }
                    };
                    if action == TimeoutAction::Break {
                        break;
                    }
                }
                EqReadResult::Event(event, entry) => match event {
                    ffi::FI_CONNREQ => {
                        *self.0.conn_req_info.lock().unwrap() = entry.info;
                        let result = self.fire_event(ZoneEvent::Incoming);
                        *self.0.conn_req_info.lock().unwrap() = ptr::null_mut();
                        result?;
                        self.0.active_connections.fetch_add(1, Ordering::AcqRel);
                    }
                    ffi::FI_SHUTDOWN => {
                        let conn = self
                            .0
                            .registry
                            .lock()
                            .unwrap()
                            .remove(&EndpointId::from_fid(entry.fid));
                        if let Some(conn) = conn {
                            self.fire_event(ZoneEvent::Disconnect(conn))?;
                            self.0.active_connections.fetch_sub(1, Ordering::AcqRel);
                        }
                    }
                    _ => {
                        log::error!("zone: unhandled EQ event {}", event);
                        return Err(Error::Protocol(ProtocolError::UnhandledEvent));
                    }
                },
            }
        }

        Ok(())
    }

    fn fire_event(&self, event: ZoneEvent) -> Result<()> {
        let mut cbs = self.0.callbacks.lock().unwrap();
        match cbs.on_event.as_mut() {
            Some(f) => f(self, event),
            None => Ok(()),
        }
    }

    /// Stops the event loop at the next iteration boundary.
    pub fn wait_break(&self) {
        self.0.waiting.store(false, Ordering::Release);
    }

    fn eq_read(&self) -> Result<EqReadResult> {
        unsafe {
            let mut entry = MaybeUninit::<ffi::fi_eq_cm_entry>::uninit();
            let mut event: u32 = 0;
            let timeout = self.0.timeout_ms.load(Ordering::Acquire) as i32;

            let ret = ffi::fi_eq_sread(
                self.0.eq,
                &mut event,
                entry.as_mut_ptr() as *mut _,
                std::mem::size_of::<ffi::fi_eq_cm_entry>(),
                timeout,
                0,
            );

            if ret == -(ffi::FI_ETIMEDOUT as isize) || ret == -(ffi::FI_EAGAIN as isize) {
                return Ok(EqReadResult::Timeout);
            }
            if ret < 0 {
                log::error!("fi_eq_sread failed: {}", ret);
                return Err(Error::Protocol(ProtocolError::EqRead));
            }

            Ok(EqReadResult::Event(event, entry.assume_init()))
        }
    }

    /// Drains EQ events until `conn`'s endpoint receives `FI_CONNECTED`,
    /// used internally by `Connection::accept`/`establish`.
    pub(crate) fn wait_connected(&self, conn: &Connection) -> Result<()> {
        while self.0.waiting.load(Ordering::Acquire) {
            match self.eq_read()? {
                EqReadResult::Timeout => {
                    let action = {
                        let mut cbs = self.0.callbacks.lock().unwrap();
                        match cbs.on_timeout.as_mut() {
                            Some(f) => f(self),
                            None => TimeoutAction::Continue,
                        }
                    };
                    if action == TimeoutAction::Break {
                        break;
                    }
                }
                EqReadResult::Event(event, entry) => {
                    if event != ffi::FI_CONNECTED {
                        log::error!("zone: unexpected EQ event {} waiting for FI_CONNECTED", event);
                        return Err(Error::Protocol(ProtocolError::EqEvent));
                    }
                    if entry.fid != conn.endpoint_fid() {
                        return Err(Error::Protocol(ProtocolError::EqEventData));
                    }
                    return Ok(());
                }
            }
        }
        Err(Error::Protocol(ProtocolError::EqRead))
    }

    pub(crate) fn register_connection(&self, handle: ConnectionHandle) {
        let id = handle.endpoint_id();
        self.0.registry.lock().unwrap().insert(id, handle);
    }

    /// A connection is registered iff `FI_CONNECTED` fired and
    /// `FI_SHUTDOWN` has not: true exactly while this returns `true`.
    pub fn contains_connection(&self, id: EndpointId) -> bool {
        self.0.registry.lock().unwrap().contains_key(&id)
    }
}

enum EqReadResult {
    Timeout,
    Event(u32, ffi::fi_eq_cm_entry),
}

impl Drop for ZoneShared {
    fn drop(&mut self) {
        unsafe {
            let pep = *self.pep.lock().unwrap();
            if !pep.is_null() {
                ffi::fi_close(pep as ffi::fid_t);
            }
            if !self.eq.is_null() {
                ffi::fi_close(self.eq as ffi::fid_t);
            }
            if !self.domain.is_null() {
                ffi::fi_close(self.domain as ffi::fid_t);
            }
            if !self.fabric.is_null() {
                ffi::fi_close(self.fabric as ffi::fid_t);
            }
            if !self.info.is_null() {
                ffi::fi_freeinfo(self.info);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_name_follows_the_sockets_provider_feature() {
        let name = provider_name();
        if cfg!(feature = "sockets-provider") {
            assert_eq!(name, "sockets");
        } else {
            assert_eq!(name, "verbs");
        }
    }

    #[test]
    fn timeout_action_equality_distinguishes_continue_from_break() {
        assert_eq!(TimeoutAction::Continue, TimeoutAction::Continue);
        assert_ne!(TimeoutAction::Continue, TimeoutAction::Break);
    }
}
