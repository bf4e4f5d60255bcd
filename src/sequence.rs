//! An ordered, reusable list of callback steps, executed atomically with
//! respect to other work queued on the same dispatcher (§4.8).

use crate::connection::Connection;
use crate::error::Result;

type Step = Box<dyn Fn(&Connection) -> Result<()> + Send + Sync>;

/// Immutable once built. May be enqueued against many connections; each
/// enqueue runs every step, in order, against whichever connection it was
/// enqueued on. Steps that close over shared state are responsible for
/// synchronizing it themselves — the sequence itself does not.
#[derive(Default)]
pub struct Sequence {
    steps: Vec<Step>,
}

impl Sequence {
    pub fn new() -> Self {
        Sequence { steps: Vec::new() }
    }

    /// Appends a step. Returns `self` so steps can be chained the way
    /// `Config`'s setters are.
    pub fn add_step(mut self, func: impl Fn(&Connection) -> Result<()> + Send + Sync + 'static) -> Self {
        self.steps.push(Box::new(func));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs every step in order against `conn`, stopping at the first
    /// error. Called by the dispatcher from inside a single work-queue
    /// iteration; no other work item for `conn` interleaves between steps.
    pub(crate) fn run(&self, conn: &Connection) -> Result<()> {
        for step in &self.steps {
            step(conn)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_step_accumulates_in_order() {
        let seq = Sequence::new()
            .add_step(|_conn| Ok(()))
            .add_step(|_conn| Ok(()))
            .add_step(|_conn| Ok(()));
        assert_eq!(seq.len(), 3);
    }

    #[test]
    fn a_fresh_sequence_is_empty() {
        assert!(Sequence::new().is_empty());
    }
}
