//! An unordered set of connections with an ordered broadcast (§4.7).

use std::sync::{Arc, Mutex};

use crate::connection::Connection;
use crate::dispatcher::Dispatcher;
use crate::error::Result;

#[derive(Default)]
pub struct ConnectionGroup {
    members: Mutex<Vec<Connection>>,
}

impl ConnectionGroup {
    pub fn new() -> Self {
        ConnectionGroup {
            members: Mutex::new(Vec::new()),
        }
    }

    /// Idempotent: adding an already-present connection is a no-op.
    /// Returns whether the connection was newly added.
    pub fn add(&self, conn: Connection) -> bool {
        let mut members = self.members.lock().unwrap();
        if members.contains(&conn) {
            false
        } else {
            members.push(conn);
            true
        }
    }

    /// Idempotent: removing an absent connection is a no-op. Returns
    /// whether a connection was removed.
    pub fn remove(&self, conn: &Connection) -> bool {
        let mut members = self.members.lock().unwrap();
        let before = members.len();
        members.retain(|c| c != conn);
        members.len() != before
    }

    pub fn len(&self) -> usize {
        self.members.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueues `func` on `disp` once per member, in insertion order.
    /// Members do not observe each other's completion — broadcast does
    /// not synchronize across connections (§5).
    pub fn group_enqueue(
        &self,
        disp: &Dispatcher,
        func: impl Fn(&Connection) -> Result<()> + Send + Sync + 'static,
    ) {
        let func: Arc<dyn Fn(&Connection) -> Result<()> + Send + Sync> = Arc::new(func);
        let members = self.members.lock().unwrap();
        for conn in members.iter() {
            disp.enqueue_shared(conn.clone(), func.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_fresh_group_is_empty() {
        let group = ConnectionGroup::new();
        assert!(group.is_empty());
        assert_eq!(group.len(), 0);
    }
}
