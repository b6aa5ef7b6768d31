pub mod page_driver;
pub mod progress_tracker;
pub mod run_context;

pub use page_driver::PageDriver;
pub use progress_tracker::ProgressTracker;
pub use run_context::RunContext;
