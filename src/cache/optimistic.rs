/// Client-side copy of a query result that can be changed ahead of the write
/// that backs it.
#[derive(Debug, Clone)]
pub struct OptimisticCell<T> {
    value: Option<T>,
    stale: bool,
}

/// Snapshot taken when an optimistic change was applied.
#[must_use = "a pending mutation must be settled"]
#[derive(Debug)]
pub struct PendingMutation<T> {
    snapshot: Option<T>,
}

impl<T> Default for OptimisticCell<T> {
    fn default() -> Self {
        Self {
            value: None,
            stale: true,
        }
    }
}

impl<T: Clone> OptimisticCell<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Store a fresh read.
    pub fn set(&mut self, value: T) {
        self.value = Some(value);
        self.stale = false;
    }

    pub fn invalidate(&mut self) {
        self.stale = true;
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn begin(&mut self, apply: impl FnOnce(&mut T)) -> PendingMutation<T> {
        let snapshot = self.value.clone();
        if let Some(value) = self.value.as_mut() {
            apply(value);
        }
        PendingMutation { snapshot }
    }

    /// Roll back on error, reconcile on success. Either way the value is
    /// marked stale so the next read replaces it.
    pub fn settle<R, E>(
        &mut self,
        pending: PendingMutation<T>,
        result: &Result<R, E>,
        reconcile: impl FnOnce(&mut T, &R),
    ) {
        match result {
            Ok(confirmed) => {
                if let Some(value) = self.value.as_mut() {
                    reconcile(value, confirmed);
                }
            }
            Err(_) => {
                self.value = pending.snapshot;
            }
        }
        self.stale = true;
    }

    /// Keep the current value after a failed read instead of retrying it.
    pub fn mark_fresh(&mut self) {
        self.stale = false;
    }
}
