//! Module that contains utility functions for fault injection in test code
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum When {
    Always,
    Never,
    /// The first N evaluations fail, every following one succeeds
    FirstN(usize),
}

/// A fault is an error that is returned based on the [`When`]
#[derive(Clone, Debug)]
pub struct Fault {
    pub when: When,
    evaluations: Arc<AtomicUsize>,
}

impl Default for Fault {
    fn default() -> Self {
        Self::new(When::Never)
    }
}

impl Fault {
    pub fn new(when: When) -> Self {
        Self {
            when,
            evaluations: Default::default(),
        }
    }

    /// Same [`When`] with its own evaluation counter
    pub fn fresh(&self) -> Self {
        Self::new(self.when.clone())
    }

    /// Returns true if the fault should be injected this time
    pub fn fires(&self) -> bool {
        match self.when {
            When::Always => true,
            When::Never => false,
            When::FirstN(n) => self.evaluations.fetch_add(1, Ordering::SeqCst) < n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Fault, When};

    #[test]
    fn first_n() {
        let fault = Fault::new(When::FirstN(2));
        assert!(fault.fires());
        assert!(fault.fires());
        assert!(!fault.fires());

        // clones share the counter, fresh copies don't
        let fresh = fault.fresh();
        assert!(!fault.clone().fires());
        assert!(fresh.fires());
    }
}
