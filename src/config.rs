//! Immutable-once-built connection parameters (`rpma_config` in the source).

use bitflags::bitflags;

use crate::error::{Error, ProtocolError, Result};

pub(crate) const DEFAULT_MSG_SIZE: usize = 30;
pub(crate) const DEFAULT_QUEUE_LENGTH: u64 = 10;

bitflags! {
    /// Role/behavior flags recognized by `Config`.
    pub struct Flags: u32 {
        /// This zone accepts connections rather than initiating one.
        const IS_SERVER = 0b0000_0001;
    }
}

/// Optional hooks for allocating/freeing the send/receive ring buffers.
///
/// Defaults to the global allocator when unset, matching the source's
/// `malloc`/`free` fields defaulting to `NULL` (interpreted by the queue
/// allocator as "use the libc allocator").
#[derive(Clone)]
pub struct QueueAllocFuncs {
    pub malloc: fn(usize) -> *mut u8,
    pub free: unsafe fn(*mut u8, usize),
}

/// Connection parameters shared by a `Zone` and all `Connection`s it owns.
///
/// Built with the `new`/`set_*` idiom of the C source; every setter returns
/// `Result<&mut Self>` or `Result<Self>` so construction reads top to bottom
/// the way `rpma_config_set_*` calls did, without a separate "apply" step.
#[derive(Clone)]
pub struct Config {
    addr: Option<String>,
    service: Option<String>,
    msg_size: usize,
    send_queue_length: u64,
    recv_queue_length: u64,
    alloc_funcs: Option<QueueAllocFuncs>,
    flags: Flags,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            addr: None,
            service: None,
            msg_size: DEFAULT_MSG_SIZE,
            send_queue_length: DEFAULT_QUEUE_LENGTH,
            recv_queue_length: DEFAULT_QUEUE_LENGTH,
            alloc_funcs: None,
            flags: Flags::empty(),
        }
    }
}

impl Config {
    /// Constructs a `Config` with the documented defaults: `msg_size = 30`,
    /// `send_queue_length = recv_queue_length = 10`, no flags.
    pub fn new() -> Self {
        Config::default()
    }

    /// Sets the address to resolve via `fi_getinfo`. A null/empty address
    /// fails, matching `rpma_config_set_addr(cfg, NULL)` returning `-1`.
    pub fn set_addr(mut self, addr: impl Into<String>) -> Result<Self> {
        let addr = addr.into();
        if addr.is_empty() {
            return Err(Error::Logic("addr must not be empty"));
        }
        self.addr = Some(addr);
        Ok(self)
    }

    /// Sets the service (port) to resolve. Same null/empty rejection as
    /// `set_addr`.
    pub fn set_service(mut self, service: impl Into<String>) -> Result<Self> {
        let service = service.into();
        if service.is_empty() {
            return Err(Error::Logic("service must not be empty"));
        }
        self.service = Some(service);
        Ok(self)
    }

    pub fn set_msg_size(mut self, msg_size: usize) -> Self {
        self.msg_size = msg_size;
        self
    }

    pub fn set_send_queue_length(mut self, len: u64) -> Self {
        self.send_queue_length = len;
        self
    }

    pub fn set_recv_queue_length(mut self, len: u64) -> Self {
        self.recv_queue_length = len;
        self
    }

    pub fn set_queue_alloc_funcs(mut self, funcs: QueueAllocFuncs) -> Self {
        self.alloc_funcs = Some(funcs);
        self
    }

    pub fn set_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    pub fn addr(&self) -> Option<&str> {
        self.addr.as_deref()
    }

    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    pub fn msg_size(&self) -> usize {
        self.msg_size
    }

    pub fn send_queue_length(&self) -> u64 {
        self.send_queue_length
    }

    pub fn recv_queue_length(&self) -> u64 {
        self.recv_queue_length
    }

    pub fn alloc_funcs(&self) -> Option<&QueueAllocFuncs> {
        self.alloc_funcs.as_ref()
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn is_server(&self) -> bool {
        self.flags.contains(Flags::IS_SERVER)
    }
}

/// A registered timeout must be non-negative; kept as a free function since
/// both `Zone::register_on_timeout` and `Config` validate the same rule.
pub(crate) fn check_timeout(timeout_ms: i64) -> Result<u64> {
    if timeout_ms < 0 {
        Err(Error::Protocol(ProtocolError::NegativeTimeout))
    } else {
        Ok(timeout_ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_round_trips_every_field() {
        let cfg = Config::new()
            .set_addr("127.0.0.1")
            .unwrap()
            .set_service("2345")
            .unwrap()
            .set_msg_size(50)
            .set_send_queue_length(5)
            .set_recv_queue_length(5)
            .set_flags(Flags::IS_SERVER);

        assert_eq!(cfg.addr(), Some("127.0.0.1"));
        assert_eq!(cfg.service(), Some("2345"));
        assert_eq!(cfg.msg_size(), 50);
        assert_eq!(cfg.send_queue_length(), 5);
        assert_eq!(cfg.recv_queue_length(), 5);
        assert!(cfg.is_server());
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let cfg = Config::new();
        assert_eq!(cfg.msg_size(), DEFAULT_MSG_SIZE);
        assert_eq!(cfg.send_queue_length(), DEFAULT_QUEUE_LENGTH);
        assert_eq!(cfg.recv_queue_length(), DEFAULT_QUEUE_LENGTH);
        assert!(!cfg.is_server());
    }

    #[test]
    fn empty_addr_is_rejected() {
        assert!(Config::new().set_addr("").is_err());
    }

    #[test]
    fn empty_service_is_rejected() {
        assert!(Config::new().set_service("").is_err());
    }

    #[test]
    fn negative_timeout_is_rejected() {
        assert!(check_timeout(-1).is_err());
    }
}
