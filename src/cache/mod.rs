mod feed;
mod optimistic;

pub use feed::{apply_optimistic_toggle, reconcile_post};
pub use optimistic::{OptimisticCell, PendingMutation};
