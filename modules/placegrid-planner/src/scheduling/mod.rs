pub mod budget;
pub mod enqueuer;

pub use budget::{BudgetSnapshot, BudgetTracker};
pub use enqueuer::{BackgroundEnqueuer, EnqueueCursor, EnqueueHandle, EnqueueOptions, EnqueueStats};
