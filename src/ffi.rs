//! Hand-maintained bindings to the subset of the libfabric (`libfabric.so`)
//! C ABI this crate drives.
//!
//! Upstream `rdma/fabric.h` and friends are large; rather than vendoring the
//! headers and running `bindgen` at build time (the approach `rrddmma` takes
//! for `rdma-core`), this module declares only the structs and functions the
//! core actually calls, following the field names and semantics of the
//! upstream headers. `fi_mr_key`/`fi_mr_desc` are normally `static inline`
//! wrappers over `fid_mr::ops`; they are declared here as plain `extern "C"`
//! functions, which is the one place this module's layout diverges from
//! upstream (see `DESIGN.md`).
#![allow(non_camel_case_types, non_upper_case_globals, dead_code)]

use libc::{c_char, c_int, c_void, sockaddr, size_t, ssize_t, uint32_t, uint64_t};

pub type fid_t = *mut fid;

macro_rules! opaque_fid {
    ($name:ident) => {
        #[repr(C)]
        pub struct $name {
            _private: [u8; 0],
        }
    };
}

opaque_fid!(fid);
opaque_fid!(fid_fabric);
opaque_fid!(fid_domain);
opaque_fid!(fid_eq);
opaque_fid!(fid_cq);
opaque_fid!(fid_ep);
opaque_fid!(fid_pep);
opaque_fid!(fid_mr);

// -- capability / mode bits (rdma/fabric.h) ---------------------------------

pub const FI_MSG: uint64_t = 1 << 1;
pub const FI_RMA: uint64_t = 1 << 2;
pub const FI_ATOMIC: uint64_t = 1 << 9;
pub const FI_READ: uint64_t = 1 << 8;
pub const FI_WRITE: uint64_t = 1 << 7;
pub const FI_RECV: uint64_t = 1 << 6;
pub const FI_SEND: uint64_t = 1 << 5;
pub const FI_TRANSMIT: uint64_t = FI_SEND;
pub const FI_REMOTE_READ: uint64_t = 1 << 10;
pub const FI_REMOTE_WRITE: uint64_t = 1 << 11;

pub const FI_CONTEXT: uint64_t = 1 << 59;
pub const FI_LOCAL_MR: uint64_t = 1 << 23;
pub const FI_RX_CQ_DATA: uint64_t = 1 << 24;
pub const FI_SOURCE: uint64_t = 1 << 20;
pub const FI_COMPLETION: uint64_t = 1 << 21;
pub const FI_SELECTIVE_COMPLETION: uint64_t = 1 << 22;

pub const FI_ORDER_RAW: uint64_t = 1 << 0;
pub const FI_ORDER_WAR: uint64_t = 1 << 2;
pub const FI_ORDER_WAW: uint64_t = 1 << 3;
pub const FI_ORDER_SAW: uint64_t = 1 << 14;

pub const FI_EP_MSG: c_int = 3;

pub const FI_SOCKADDR: uint32_t = 3;

pub const FI_MR_BASIC: uint64_t = (1 << 1) | (1 << 2) | (1 << 3);

pub const FI_THREAD_SAFE: c_int = 1;

pub const FI_WAIT_UNSPEC: c_int = 0;
pub const FI_CQ_COND_NONE: c_int = 0;
pub const FI_CQ_FORMAT_MSG: c_int = 2;

pub const FI_UINT64: c_int = 6;
pub const FI_ATOMIC_WRITE: c_int = 0;

// -- access flags for fi_mr_reg ---------------------------------------------

pub const FI_MR_ACCESS_SEND: uint64_t = FI_SEND;
pub const FI_MR_ACCESS_RECV: uint64_t = FI_RECV;
pub const FI_MR_ACCESS_READ: uint64_t = FI_READ;
pub const FI_MR_ACCESS_WRITE: uint64_t = FI_WRITE;
pub const FI_MR_ACCESS_REMOTE_READ: uint64_t = FI_REMOTE_READ;
pub const FI_MR_ACCESS_REMOTE_WRITE: uint64_t = FI_REMOTE_WRITE;

// -- EQ / CM events -----------------------------------------------------

pub const FI_CONNREQ: uint32_t = 1;
pub const FI_CONNECTED: uint32_t = 2;
pub const FI_SHUTDOWN: uint32_t = 3;

// -- errno-space values the source checks explicitly -------------------

pub const FI_ETIMEDOUT: c_int = 110;
pub const FI_EAGAIN: c_int = 11;
pub const FI_EAVAIL: c_int = 1000; // libfabric-local sentinel, not a real errno

pub const FI_VERSION_1_4: uint32_t = (1 << 16) | 4;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct fi_tx_attr {
    pub caps: uint64_t,
    pub mode: uint64_t,
    pub op_flags: uint64_t,
    pub msg_order: uint64_t,
    pub comp_order: uint64_t,
    pub inject_size: size_t,
    pub size: size_t,
    pub iov_limit: size_t,
    pub rma_iov_limit: size_t,
    pub tclass: uint32_t,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct fi_rx_attr {
    pub caps: uint64_t,
    pub mode: uint64_t,
    pub op_flags: uint64_t,
    pub msg_order: uint64_t,
    pub comp_order: uint64_t,
    pub total_buffered_recv: size_t,
    pub size: size_t,
    pub iov_limit: size_t,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct fi_ep_attr {
    pub ty: c_int, // `type` is reserved in Rust
    pub protocol: uint32_t,
    pub protocol_version: uint32_t,
    pub max_msg_size: size_t,
    pub msg_prefix_size: size_t,
    pub max_order_raw_size: size_t,
    pub max_order_war_size: size_t,
    pub max_order_waw_size: size_t,
    pub mem_tag_format: uint64_t,
    pub tx_ctx_cnt: size_t,
    pub rx_ctx_cnt: size_t,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct fi_domain_attr {
    pub domain: *mut fid_domain,
    pub name: *mut c_char,
    pub threading: c_int,
    pub control_progress: c_int,
    pub data_progress: c_int,
    pub resource_mgmt: c_int,
    pub av_type: c_int,
    pub mr_mode: uint64_t,
    pub mr_key_size: size_t,
    pub cq_data_size: size_t,
    pub cq_cnt: size_t,
    pub ep_cnt: size_t,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct fi_fabric_attr {
    pub fabric: *mut fid_fabric,
    pub name: *mut c_char,
    pub prov_name: *mut c_char,
    pub prov_version: uint32_t,
    pub api_version: uint32_t,
}

#[repr(C)]
pub struct fi_info {
    pub next: *mut fi_info,
    pub caps: uint64_t,
    pub mode: uint64_t,
    pub addr_format: uint32_t,
    pub src_addrlen: size_t,
    pub dest_addrlen: size_t,
    pub src_addr: *mut c_void,
    pub dest_addr: *mut c_void,
    pub handle: fid_t,
    pub tx_attr: *mut fi_tx_attr,
    pub rx_attr: *mut fi_rx_attr,
    pub ep_attr: *mut fi_ep_attr,
    pub domain_attr: *mut fi_domain_attr,
    pub fabric_attr: *mut fi_fabric_attr,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct fi_eq_attr {
    pub size: size_t,
    pub flags: uint64_t,
    pub wait_obj: c_int,
    pub signaling_vector: c_int,
    pub wait_set: *mut c_void,
}

#[repr(C)]
pub struct fi_eq_cm_entry {
    pub fid: fid_t,
    pub info: *mut fi_info,
    // followed in the real ABI by a variable-length `data[]` tail we never read
}

#[repr(C)]
pub struct fi_eq_err_entry {
    pub fid: fid_t,
    pub context: *mut c_void,
    pub data: uint64_t,
    pub err: c_int,
    pub prov_errno: c_int,
    pub err_data: *mut c_void,
    pub err_data_size: size_t,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct fi_cq_attr {
    pub size: size_t,
    pub flags: uint64_t,
    pub format: c_int,
    pub wait_obj: c_int,
    pub signaling_vector: c_int,
    pub wait_cond: c_int,
    pub wait_set: *mut c_void,
}

#[repr(C)]
pub struct fi_cq_msg_entry {
    pub op_context: *mut c_void,
    pub flags: uint64_t,
    pub len: size_t,
}

#[repr(C)]
pub struct fi_cq_err_entry {
    pub op_context: *mut c_void,
    pub flags: uint64_t,
    pub len: size_t,
    pub buf: *mut c_void,
    pub data: uint64_t,
    pub tag: uint64_t,
    pub olen: size_t,
    pub err: c_int,
    pub prov_errno: c_int,
    pub err_data: *mut c_void,
    pub err_data_size: size_t,
}

#[repr(C)]
pub struct iovec {
    pub iov_base: *mut c_void,
    pub iov_len: size_t,
}

#[repr(C)]
pub struct fi_msg {
    pub msg_iov: *const iovec,
    pub desc: *mut *mut c_void,
    pub iov_count: size_t,
    pub addr: uint64_t,
    pub context: *mut c_void,
    pub data: uint64_t,
}

#[repr(C)]
pub struct fi_rma_iov {
    pub addr: uint64_t,
    pub len: size_t,
    pub key: uint64_t,
}

#[repr(C)]
pub struct fi_msg_rma {
    pub msg_iov: *const iovec,
    pub desc: *mut *mut c_void,
    pub iov_count: size_t,
    pub addr: uint64_t,
    pub rma_iov: *const fi_rma_iov,
    pub rma_iov_count: size_t,
    pub context: *mut c_void,
    pub data: uint64_t,
}

#[repr(C)]
pub struct fi_ioc {
    pub addr: *mut c_void,
    pub count: size_t,
}

#[repr(C)]
pub struct fi_msg_atomic {
    pub msg_iov: *const fi_ioc,
    pub desc: *mut *mut c_void,
    pub iov_count: size_t,
    pub addr: uint64_t,
    pub rma_iov: *const fi_rma_iov,
    pub rma_iov_count: size_t,
    pub datatype: c_int,
    pub op: c_int,
    pub context: *mut c_void,
    pub data: uint64_t,
}

extern "C" {
    pub fn fi_allocinfo() -> *mut fi_info;
    pub fn fi_freeinfo(info: *mut fi_info);
    pub fn fi_dupinfo(info: *const fi_info) -> *mut fi_info;

    pub fn fi_getinfo(
        version: uint32_t,
        node: *const c_char,
        service: *const c_char,
        flags: uint64_t,
        hints: *const fi_info,
        info: *mut *mut fi_info,
    ) -> c_int;

    pub fn fi_fabric(
        attr: *const fi_fabric_attr,
        fabric: *mut *mut fid_fabric,
        context: *mut c_void,
    ) -> c_int;

    pub fn fi_domain(
        fabric: *mut fid_fabric,
        info: *const fi_info,
        domain: *mut *mut fid_domain,
        context: *mut c_void,
    ) -> c_int;

    pub fn fi_eq_open(
        fabric: *mut fid_fabric,
        attr: *const fi_eq_attr,
        eq: *mut *mut fid_eq,
        context: *mut c_void,
    ) -> c_int;

    pub fn fi_passive_ep(
        fabric: *mut fid_fabric,
        info: *const fi_info,
        pep: *mut *mut fid_pep,
        context: *mut c_void,
    ) -> c_int;

    pub fn fi_pep_bind(pep: *mut fid_pep, bfid: fid_t, flags: uint64_t) -> c_int;
    pub fn fi_listen(pep: *mut fid_pep) -> c_int;

    pub fn fi_endpoint(
        domain: *mut fid_domain,
        info: *const fi_info,
        ep: *mut *mut fid_ep,
        context: *mut c_void,
    ) -> c_int;

    pub fn fi_ep_bind(ep: *mut fid_ep, bfid: fid_t, flags: uint64_t) -> c_int;
    pub fn fi_enable(ep: *mut fid_ep) -> c_int;

    pub fn fi_accept(ep: *mut fid_ep, param: *const c_void, paramlen: size_t) -> c_int;
    pub fn fi_connect(
        ep: *mut fid_ep,
        addr: *const c_void,
        param: *const c_void,
        paramlen: size_t,
    ) -> c_int;
    pub fn fi_reject(
        pep: *mut fid_pep,
        handle: fid_t,
        param: *const c_void,
        paramlen: size_t,
    ) -> c_int;
    pub fn fi_shutdown(ep: *mut fid_ep, flags: uint64_t) -> c_int;

    pub fn fi_close(fid: fid_t) -> c_int;
    pub fn fi_getname(fid: fid_t, addr: *mut sockaddr, addrlen: *mut size_t) -> c_int;

    pub fn fi_cq_open(
        domain: *mut fid_domain,
        attr: *const fi_cq_attr,
        cq: *mut *mut fid_cq,
        context: *mut c_void,
    ) -> c_int;

    pub fn fi_cq_sread(
        cq: *mut fid_cq,
        buf: *mut c_void,
        count: size_t,
        cond: *const c_void,
        timeout: c_int,
    ) -> ssize_t;
    pub fn fi_cq_readerr(cq: *mut fid_cq, buf: *mut fi_cq_err_entry, flags: uint64_t) -> ssize_t;
    pub fn fi_cq_strerror(
        cq: *mut fid_cq,
        prov_errno: c_int,
        err_data: *const c_void,
        buf: *mut c_char,
        len: size_t,
    ) -> *const c_char;

    pub fn fi_eq_sread(
        eq: *mut fid_eq,
        event: *mut uint32_t,
        buf: *mut c_void,
        len: size_t,
        timeout: c_int,
        flags: uint64_t,
    ) -> ssize_t;
    pub fn fi_eq_readerr(eq: *mut fid_eq, buf: *mut fi_eq_err_entry, flags: uint64_t) -> ssize_t;
    pub fn fi_eq_strerror(
        eq: *mut fid_eq,
        prov_errno: c_int,
        err_data: *const c_void,
        buf: *mut c_char,
        len: size_t,
    ) -> *const c_char;

    pub fn fi_mr_reg(
        domain: *mut fid_domain,
        buf: *const c_void,
        len: size_t,
        access: uint64_t,
        offset: uint64_t,
        requested_key: uint64_t,
        flags: uint64_t,
        mr: *mut *mut fid_mr,
        context: *mut c_void,
    ) -> c_int;
    pub fn fi_mr_key(mr: *mut fid_mr) -> uint64_t;
    pub fn fi_mr_desc(mr: *mut fid_mr) -> *mut c_void;

    pub fn fi_sendmsg(ep: *mut fid_ep, msg: *const fi_msg, flags: uint64_t) -> ssize_t;
    pub fn fi_recvmsg(ep: *mut fid_ep, msg: *const fi_msg, flags: uint64_t) -> ssize_t;
    pub fn fi_readmsg(ep: *mut fid_ep, msg: *const fi_msg_rma, flags: uint64_t) -> ssize_t;
    pub fn fi_writemsg(ep: *mut fid_ep, msg: *const fi_msg_rma, flags: uint64_t) -> ssize_t;
    pub fn fi_atomicmsg(ep: *mut fid_ep, msg: *const fi_msg_atomic, flags: uint64_t) -> ssize_t;

    pub fn fi_strerror(errnum: c_int) -> *const c_char;
}
