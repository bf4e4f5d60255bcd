//! Two-sided messaging: the pre-posted receive ring and the send-ring slot
//! allocator (`msg.c` in the source).

use std::os::raw::c_void;
use std::ptr;

use crate::error::{check_fi_ssize, Error, Result};
use crate::ffi;

use super::{Connection, ConnState};

const CQ_DEFAULT_TIMEOUT_MS: i32 = 1000;

/// Given the current send-ring cursor, returns the slot to hand out and the
/// cursor's next value. Pulled out of `msg_get_ptr` so the round-robin law
/// can be exercised without a live fabric provider.
fn advance_ring_cursor(cursor: u64, queue_length: u64) -> (u64, u64) {
    (cursor, (cursor + 1) % queue_length)
}

impl Connection {
    fn msg_size(&self) -> usize {
        self.0.zone.msg_size()
    }

    fn require_connected(&self) -> Result<()> {
        if self.state() != ConnState::Connected {
            return Err(Error::Logic("CQ I/O attempted outside the Connected state"));
        }
        Ok(())
    }

    pub(crate) fn messaging_recv_post_all(&self) -> Result<()> {
        let msg_size = self.msg_size();
        let base = self.0.recv_buff.ptr();
        for i in 0..self.0.zone.recv_queue_length() {
            let ptr = unsafe { base.add(i as usize * msg_size) };
            self.recv_post(ptr)?;
        }
        Ok(())
    }

    fn recv_post(&self, ptr: *mut u8) -> Result<()> {
        let msg_size = self.msg_size();
        let iov = ffi::iovec {
            iov_base: ptr as *mut c_void,
            iov_len: msg_size,
        };
        let mut desc = self.0.recv_buff.desc();
        let msg = ffi::fi_msg {
            msg_iov: &iov,
            desc: &mut desc,
            iov_count: 1,
            addr: 0,
            context: ptr as *mut c_void,
            data: 0,
        };
        let ret = unsafe { ffi::fi_recvmsg(self.ep_ptr(), &msg, ffi::FI_COMPLETION) };
        check_fi_ssize("fi_recvmsg", ret as isize).map(|_| ())
    }

    /// Returns the next send-ring slot, round-robin via a cursor modulo
    /// `send_queue_length`, zeroed before being handed to the caller.
    /// Uniquely owned by the caller until its send completion fires.
    pub fn msg_get_ptr(&self) -> *mut u8 {
        let msg_size = self.msg_size();
        let mut id = self.0.send_buff_id.lock().unwrap();
        let (slot, next) = advance_ring_cursor(*id, self.0.zone.send_queue_length());
        *id = next;

        let ptr = unsafe { self.0.send_buff.ptr().add(slot as usize * msg_size) };
        unsafe { ptr::write_bytes(ptr, 0, msg_size) };
        ptr
    }

    /// Issues `fi_sendmsg` and blocks on the matching send completion.
    /// Out-of-order completions observed while waiting are routed to the
    /// attached dispatcher, or to `on_recv` directly if none is attached.
    pub fn send(&self, ptr: *mut u8) -> Result<()> {
        self.require_connected()?;
        let msg_size = self.msg_size();
        let iov = ffi::iovec {
            iov_base: ptr as *mut c_void,
            iov_len: msg_size,
        };
        let mut desc = self.0.send_buff.desc();
        let msg = ffi::fi_msg {
            msg_iov: &iov,
            desc: &mut desc,
            iov_count: 1,
            addr: 0,
            context: ptr as *mut c_void,
            data: 0,
        };
        let ret = unsafe { ffi::fi_sendmsg(self.ep_ptr(), &msg, ffi::FI_COMPLETION) };
        check_fi_ssize("fi_sendmsg", ret as isize)?;

        self.cq_wait(ffi::FI_SEND, ptr as *mut c_void)
    }

    fn cq_read(&self) -> Result<Option<ffi::fi_cq_msg_entry>> {
        let mut entry = ffi::fi_cq_msg_entry {
            op_context: ptr::null_mut(),
            flags: 0,
            len: 0,
        };
        let ret = unsafe {
            ffi::fi_cq_sread(
                self.cq_ptr(),
                &mut entry as *mut _ as *mut c_void,
                1,
                ptr::null(),
                CQ_DEFAULT_TIMEOUT_MS,
            )
        };

        if ret == -(ffi::FI_EAGAIN as isize) {
            return Ok(None);
        }
        if ret == -(ffi::FI_EAVAIL as isize) {
            return Err(self.cq_read_err());
        }
        if ret < 0 {
            log::error!("fi_cq_sread failed: {}", ret);
            return Err(Error::transport("fi_cq_sread", -ret as i32));
        }
        Ok(Some(entry))
    }

    fn cq_read_err(&self) -> Error {
        let mut err = ffi::fi_cq_err_entry {
            op_context: ptr::null_mut(),
            flags: 0,
            len: 0,
            buf: ptr::null_mut(),
            data: 0,
            tag: 0,
            olen: 0,
            err: 0,
            prov_errno: 0,
            err_data: ptr::null_mut(),
            err_data_size: 0,
        };
        let ret = unsafe { ffi::fi_cq_readerr(self.cq_ptr(), &mut err, 0) };
        if ret < 0 {
            log::error!("fi_cq_readerr failed: {}", ret);
        } else {
            log::error!("CQ error: provider errno {}", err.prov_errno);
        }
        Error::transport("fi_cq_sread", err.prov_errno)
    }

    fn cq_entry_process_or_enqueue(&self, entry: ffi::fi_cq_msg_entry) -> Result<()> {
        match self.dispatcher() {
            Some(disp) => {
                disp.enqueue_cq_entry(self.clone(), entry);
                Ok(())
            }
            None => self.cq_entry_process(&entry),
        }
    }

    /// Blocks until a CQ entry matching `flags` and `op_context` arrives.
    /// Any entry that doesn't match is routed to the dispatcher (or
    /// `on_recv`/`on_notify` directly) rather than dropped — unrelated
    /// completions are parked, never lost.
    pub(crate) fn cq_wait(&self, flags: u64, op_context: *mut c_void) -> Result<()> {
        loop {
            let entry = match self.cq_read()? {
                Some(e) => e,
                None => continue,
            };

            let mismatch = (entry.flags & flags) == 0 || entry.op_context != op_context;
            if mismatch {
                self.cq_entry_process_or_enqueue(entry)?;
                continue;
            }

            return Ok(());
        }
    }

    /// Drains every currently-ready CQ entry, routing each one via the
    /// attached dispatcher or directly to `on_recv`/`on_notify`.
    pub fn cq_process(&self) -> Result<()> {
        while let Some(entry) = self.cq_read()? {
            self.cq_entry_process(&entry)?;
        }
        Ok(())
    }

    /// Processes one CQ entry inline: routes `FI_MSG|FI_RECV` completions
    /// to `on_recv` and re-posts the consumed receive slot; routes
    /// `FI_RMA` completions (a `read`'s completion, used by `commit`) to
    /// `on_notify`.
    pub(crate) fn cq_entry_process(&self, entry: &ffi::fi_cq_msg_entry) -> Result<()> {
        let msg_size = self.msg_size();
        if entry.flags & ffi::FI_MSG != 0 {
            let buf =
                unsafe { std::slice::from_raw_parts(entry.op_context as *const u8, msg_size) };
            self.invoke_on_recv(buf)?;
            self.recv_post(entry.op_context as *mut u8)?;
            Ok(())
        } else if entry.flags & (ffi::FI_READ | ffi::FI_WRITE) != 0 {
            let buf = unsafe { std::slice::from_raw_parts(entry.op_context as *const u8, entry.len) };
            self.invoke_on_notify(buf)
        } else {
            Err(Error::Logic("unexpected CQ entry flags"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn msg_get_ptr_is_round_robin_over_the_configured_queue_length() {
        // Drives the same `advance_ring_cursor` that `msg_get_ptr` calls, so
        // a broken real implementation would break this test too (see
        // SPEC_FULL.md §8 on the test seam).
        let msg_size = 16usize;
        let send_queue_length = 3u64;
        let mut cursor = 0u64;
        let mut offsets = Vec::new();
        for _ in 0..5 {
            let (slot, next) = advance_ring_cursor(cursor, send_queue_length);
            offsets.push(slot as usize * msg_size);
            cursor = next;
        }
        assert_eq!(offsets, vec![0, msg_size, 2 * msg_size, 0, msg_size]);
    }

    #[test]
    fn config_defaults_feed_the_ring_sizes_used_above() {
        let cfg = Config::new().set_send_queue_length(3);
        assert_eq!(cfg.send_queue_length(), 3);
    }
}
