//! A connection: one endpoint, one completion queue, and the two
//! subsystems built on top of them (`messaging`, `rma`).

pub mod messaging;
pub mod rma;

use std::any::Any;
use std::os::raw::c_void;
use std::ptr;
use std::sync::{Arc, Mutex};

use crate::dispatcher::DispatcherHandle;
use crate::error::{check_fi, Error, Result};
use crate::ffi;
use crate::memory::{Access, MemoryLocal, MemoryRemote};
use crate::zone::Zone;

const CQ_SIZE: usize = 10;
pub(crate) const RAW_BUFF_SIZE: usize = 4096;
pub(crate) const RAW_SIZE: usize = 8;

/// Stable key for the zone's endpoint→connection registry: the endpoint's
/// raw `fid_t` pointer value, valid for the endpoint's lifetime (replaces
/// the C source's RAVL tree keyed the same way).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EndpointId(usize);

impl EndpointId {
    pub(crate) fn from_fid(fid: ffi::fid_t) -> Self {
        EndpointId(fid as usize)
    }
}

/// `Created → Establishing → Connected → Disconnecting → Terminated`.
/// CQ I/O is permitted only in `Connected` (enforced by `messaging`/`rma`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Created,
    Establishing,
    Connected,
    Disconnecting,
    Terminated,
}

pub(crate) struct ConnectionInner {
    zone: Zone,
    ep: Mutex<*mut ffi::fid_ep>,
    cq: Mutex<*mut ffi::fid_cq>,
    state: Mutex<ConnState>,

    pub(crate) send_buff: MemoryLocal,
    pub(crate) recv_buff: MemoryLocal,
    pub(crate) send_buff_id: Mutex<u64>,

    pub(crate) raw_dst: MemoryLocal,
    pub(crate) raw_src: Mutex<Option<MemoryRemote>>,

    dispatcher: Mutex<Option<DispatcherHandle>>,
    on_recv: Mutex<Option<Box<dyn FnMut(&Connection, &[u8]) -> Result<()> + Send>>>,
    on_notify: Mutex<Option<Box<dyn FnMut(&Connection, &[u8]) -> Result<()> + Send>>>,
    custom_data: Mutex<Option<Box<dyn Any + Send>>>,
}

unsafe impl Send for ConnectionInner {}
unsafe impl Sync for ConnectionInner {}

/// A connection, cheaply `Clone`-able (an `Arc` handle), matching `Zone`'s
/// ownership style. `Connection` is both the public type and the "handle"
/// shared with `Zone`'s registry, `Dispatcher`, and `ConnectionGroup`.
#[derive(Clone)]
pub struct Connection(pub(crate) Arc<ConnectionInner>);

pub type ConnectionHandle = Connection;

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for Connection {}

impl std::hash::Hash for Connection {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (Arc::as_ptr(&self.0) as usize).hash(state)
    }
}

fn page_align(size: usize) -> usize {
    const PAGE: usize = 4096;
    (size + PAGE - 1) & !(PAGE - 1)
}

fn alloc_page_aligned(size: usize) -> Result<*mut u8> {
    let mut ptr: *mut c_void = ptr::null_mut();
    let ret = unsafe { libc::posix_memalign(&mut ptr, 4096, size) };
    if ret != 0 || ptr.is_null() {
        return Err(Error::alloc());
    }
    unsafe { ptr::write_bytes(ptr as *mut u8, 0, size) };
    Ok(ptr as *mut u8)
}

impl Connection {
    /// Allocates state, registers the send/recv ring buffers and the
    /// read-after-write scratch buffer. Does not yet own an endpoint —
    /// that happens in `accept`/`establish`.
    pub fn new(zone: &Zone) -> Result<Self> {
        let msg_size = zone.msg_size();
        let send_len = page_align(msg_size * zone.send_queue_length() as usize);
        let recv_len = page_align(msg_size * zone.recv_queue_length() as usize);

        let send_ptr = alloc_page_aligned(send_len)?;
        let send_buff = match unsafe { MemoryLocal::new(zone, send_ptr, send_len, Access::WRITE_SRC) } {
            Ok(mr) => mr,
            Err(e) => {
                unsafe { libc::free(send_ptr as *mut c_void) };
                return Err(e);
            }
        };

        let recv_ptr = alloc_page_aligned(recv_len)?;
        let recv_buff = match unsafe { MemoryLocal::new(zone, recv_ptr, recv_len, Access::READ_DST) } {
            Ok(mr) => mr,
            Err(e) => {
                unsafe { libc::free(recv_ptr as *mut c_void) };
                return Err(e);
            }
        };

        let raw_ptr = alloc_page_aligned(RAW_BUFF_SIZE)?;
        let raw_dst = match unsafe { MemoryLocal::new(zone, raw_ptr, RAW_BUFF_SIZE, Access::READ_DST) } {
            Ok(mr) => mr,
            Err(e) => {
                unsafe { libc::free(raw_ptr as *mut c_void) };
                return Err(e);
            }
        };

        Ok(Connection(Arc::new(ConnectionInner {
            zone: zone.clone(),
            ep: Mutex::new(ptr::null_mut()),
            cq: Mutex::new(ptr::null_mut()),
            state: Mutex::new(ConnState::Created),
            send_buff,
            recv_buff,
            send_buff_id: Mutex::new(0),
            raw_dst,
            raw_src: Mutex::new(None),
            dispatcher: Mutex::new(None),
            on_recv: Mutex::new(None),
            on_notify: Mutex::new(None),
            custom_data: Mutex::new(None),
        })))
    }

    /// A connection over a stub zone, with no endpoint and no real memory
    /// registrations — enough to enqueue on a `Dispatcher` and be passed to
    /// a work-item callback, but never to drive actual CQ I/O.
    #[cfg(test)]
    pub(crate) fn new_test_stub() -> Self {
        let zone = Zone::new_test_stub();
        let stub_buf = |len: usize| -> MemoryLocal {
            let ptr = Box::leak(vec![0u8; len].into_boxed_slice()).as_mut_ptr();
            MemoryLocal::new_test_stub(ptr, len)
        };
        Connection(Arc::new(ConnectionInner {
            zone,
            ep: Mutex::new(ptr::null_mut()),
            cq: Mutex::new(ptr::null_mut()),
            state: Mutex::new(ConnState::Created),
            send_buff: stub_buf(64),
            recv_buff: stub_buf(64),
            send_buff_id: Mutex::new(0),
            raw_dst: stub_buf(RAW_BUFF_SIZE),
            raw_src: Mutex::new(None),
            dispatcher: Mutex::new(None),
            on_recv: Mutex::new(None),
            on_notify: Mutex::new(None),
            custom_data: Mutex::new(None),
        }))
    }

    pub fn zone(&self) -> Zone {
        self.0.zone.clone()
    }

    pub fn state(&self) -> ConnState {
        *self.0.state.lock().unwrap()
    }

    pub(crate) fn endpoint_fid(&self) -> ffi::fid_t {
        *self.0.ep.lock().unwrap() as ffi::fid_t
    }

    pub(crate) fn endpoint_id(&self) -> EndpointId {
        EndpointId::from_fid(self.endpoint_fid())
    }

    pub(crate) fn ep_ptr(&self) -> *mut ffi::fid_ep {
        *self.0.ep.lock().unwrap()
    }

    pub(crate) fn cq_ptr(&self) -> *mut ffi::fid_cq {
        *self.0.cq.lock().unwrap()
    }

    fn ep_init(&self, info: *mut ffi::fi_info) -> Result<()> {
        unsafe {
            let mut ep: *mut ffi::fid_ep = ptr::null_mut();
            let ret = ffi::fi_endpoint(self.0.zone.domain_ptr(), info, &mut ep, ptr::null_mut());
            check_fi("fi_endpoint", ret)?;

            let ret = ffi::fi_ep_bind(ep, self.0.zone.eq_ptr() as ffi::fid_t, 0);
            if let Err(e) = check_fi("fi_ep_bind(eq)", ret) {
                ffi::fi_close(ep as ffi::fid_t);
                return Err(e);
            }

            let cq_attr = ffi::fi_cq_attr {
                size: CQ_SIZE,
                flags: 0,
                format: ffi::FI_CQ_FORMAT_MSG,
                wait_obj: ffi::FI_WAIT_UNSPEC,
                signaling_vector: 0,
                wait_cond: ffi::FI_CQ_COND_NONE,
                wait_set: ptr::null_mut(),
            };
            let context = Arc::as_ptr(&self.0) as *mut c_void;
            let mut cq: *mut ffi::fid_cq = ptr::null_mut();
            let ret = ffi::fi_cq_open(self.0.zone.domain_ptr(), &cq_attr, &mut cq, context);
            if let Err(e) = check_fi("fi_cq_open", ret) {
                ffi::fi_close(ep as ffi::fid_t);
                return Err(e);
            }

            let flags = ffi::FI_RECV | ffi::FI_TRANSMIT | ffi::FI_SELECTIVE_COMPLETION;
            let ret = ffi::fi_ep_bind(ep, cq as ffi::fid_t, flags);
            if let Err(e) = check_fi("fi_ep_bind(cq)", ret) {
                ffi::fi_close(cq as ffi::fid_t);
                ffi::fi_close(ep as ffi::fid_t);
                return Err(e);
            }

            let ret = ffi::fi_enable(ep);
            if let Err(e) = check_fi("fi_enable", ret) {
                ffi::fi_close(cq as ffi::fid_t);
                ffi::fi_close(ep as ffi::fid_t);
                return Err(e);
            }

            *self.0.ep.lock().unwrap() = ep;
            *self.0.cq.lock().unwrap() = cq;
        }
        Ok(())
    }

    fn ep_fini(&self) {
        unsafe {
            let mut ep = self.0.ep.lock().unwrap();
            if !ep.is_null() {
                ffi::fi_close(*ep as ffi::fid_t);
                *ep = ptr::null_mut();
            }
            let mut cq = self.0.cq.lock().unwrap();
            if !cq.is_null() {
                ffi::fi_close(*cq as ffi::fid_t);
                *cq = ptr::null_mut();
            }
        }
    }

    /// Opens an endpoint against the zone's stashed `conn_req_info`,
    /// pre-posts every receive slot, and accepts the inbound request.
    /// Must only be called from inside the `Incoming` event callback.
    pub fn accept(&self) -> Result<()> {
        let info = *self.0.zone.0.conn_req_info.lock().unwrap();
        if info.is_null() {
            return Err(Error::Logic(
                "accept() called with no pending connection request",
            ));
        }

        *self.0.state.lock().unwrap() = ConnState::Establishing;
        self.ep_init(info)?;

        if let Err(e) = self.messaging_recv_post_all() {
            self.ep_fini();
            return Err(e);
        }

        let ret = unsafe { ffi::fi_accept(self.ep_ptr(), ptr::null(), 0) };
        if let Err(e) = check_fi("fi_accept", ret) {
            self.ep_fini();
            return Err(e);
        }

        if let Err(e) = self.0.zone.wait_connected(self) {
            self.ep_fini();
            return Err(e);
        }

        *self.0.state.lock().unwrap() = ConnState::Connected;
        self.0.zone.register_connection(self.clone());
        Ok(())
    }

    /// Opens an endpoint against the zone's resolved outgoing `info` and
    /// issues `fi_connect`.
    pub fn establish(&self) -> Result<()> {
        *self.0.state.lock().unwrap() = ConnState::Establishing;
        self.ep_init(self.0.zone.0.info)?;

        if let Err(e) = self.messaging_recv_post_all() {
            self.ep_fini();
            return Err(e);
        }

        let dest_addr = unsafe { (*self.0.zone.0.info).dest_addr };
        let ret = unsafe { ffi::fi_connect(self.ep_ptr(), dest_addr, ptr::null(), 0) };
        if let Err(e) = check_fi("fi_connect", ret) {
            self.ep_fini();
            return Err(e);
        }

        if let Err(e) = self.0.zone.wait_connected(self) {
            self.ep_fini();
            return Err(e);
        }

        *self.0.state.lock().unwrap() = ConnState::Connected;
        self.0.zone.register_connection(self.clone());
        Ok(())
    }

    /// Rejects the zone's stashed `conn_req_info` instead of accepting it.
    /// Only meaningful from inside the `Incoming` event callback, before
    /// any `accept`/`establish` has opened an endpoint on this connection.
    pub fn reject(&self) -> Result<()> {
        let info = *self.0.zone.0.conn_req_info.lock().unwrap();
        if info.is_null() {
            return Err(Error::Logic(
                "reject() called with no pending connection request",
            ));
        }
        let pep = *self.0.zone.0.pep.lock().unwrap();
        let handle = unsafe { (*info).handle };
        let ret = unsafe { ffi::fi_reject(pep, handle, ptr::null(), 0) };
        check_fi("fi_reject", ret)
    }

    /// Shuts the endpoint down; the matching `FI_SHUTDOWN` EQ event
    /// arrives asynchronously and fires `ZoneEvent::Disconnect`.
    pub fn disconnect(&self) -> Result<()> {
        *self.0.state.lock().unwrap() = ConnState::Disconnecting;
        let ret = unsafe { ffi::fi_shutdown(self.ep_ptr(), 0) };
        check_fi("fi_shutdown", ret)
    }

    pub fn set_custom_data<T: Any + Send>(&self, data: T) {
        *self.0.custom_data.lock().unwrap() = Some(Box::new(data));
    }

    pub fn custom_data<T: Any + Send + Clone>(&self) -> Option<T> {
        self.0
            .custom_data
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|b| b.downcast_ref::<T>())
            .cloned()
    }

    pub fn register_on_recv(
        &self,
        func: impl FnMut(&Connection, &[u8]) -> Result<()> + Send + 'static,
    ) {
        *self.0.on_recv.lock().unwrap() = Some(Box::new(func));
    }

    pub fn register_on_notify(
        &self,
        func: impl FnMut(&Connection, &[u8]) -> Result<()> + Send + 'static,
    ) {
        *self.0.on_notify.lock().unwrap() = Some(Box::new(func));
    }

    pub(crate) fn invoke_on_recv(&self, buf: &[u8]) -> Result<()> {
        let mut guard = self.0.on_recv.lock().unwrap();
        match guard.as_mut() {
            Some(f) => f(self, buf),
            None => Ok(()),
        }
    }

    pub(crate) fn invoke_on_notify(&self, buf: &[u8]) -> Result<()> {
        let mut guard = self.0.on_notify.lock().unwrap();
        match guard.as_mut() {
            Some(f) => f(self, buf),
            None => Ok(()),
        }
    }

    /// Attaches this connection to a dispatcher. At most one dispatcher
    /// may be attached at a time.
    pub fn attach(&self, disp: &crate::dispatcher::Dispatcher) -> Result<()> {
        let mut slot = self.0.dispatcher.lock().unwrap();
        if slot.is_some() {
            return Err(Error::Logic("connection already attached to a dispatcher"));
        }
        disp.attach_connection(self.clone());
        *slot = Some(disp.handle());
        Ok(())
    }

    pub fn detach(&self) -> Result<()> {
        let mut slot = self.0.dispatcher.lock().unwrap();
        if let Some(disp) = slot.take() {
            disp.detach_connection(self);
        }
        Ok(())
    }

    pub(crate) fn dispatcher(&self) -> Option<DispatcherHandle> {
        self.0.dispatcher.lock().unwrap().clone()
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        *self.state.lock().unwrap() = ConnState::Terminated;
        unsafe {
            let ep = *self.ep.lock().unwrap();
            if !ep.is_null() {
                ffi::fi_close(ep as ffi::fid_t);
            }
            let cq = *self.cq.lock().unwrap();
            if !cq.is_null() {
                ffi::fi_close(cq as ffi::fid_t);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_align_rounds_up_to_the_next_4096_byte_boundary() {
        assert_eq!(page_align(0), 0);
        assert_eq!(page_align(1), 4096);
        assert_eq!(page_align(4096), 4096);
        assert_eq!(page_align(4097), 8192);
        assert_eq!(page_align(30 * 10), 4096);
    }

    #[test]
    fn endpoint_id_equality_tracks_the_underlying_fid_value() {
        let a = EndpointId::from_fid(0x1000 as ffi::fid_t);
        let b = EndpointId::from_fid(0x1000 as ffi::fid_t);
        let c = EndpointId::from_fid(0x2000 as ffi::fid_t);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
        assert!(!set.contains(&c));
    }

    #[test]
    fn conn_state_transitions_compare_by_value() {
        assert_eq!(ConnState::Created, ConnState::Created);
        assert_ne!(ConnState::Created, ConnState::Connected);
    }
}
