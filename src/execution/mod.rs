// =============================================================================
// Execution — order lifecycle, the paired executor, and the paper simulator
// =============================================================================

pub mod engine;
pub mod order;
pub mod paired;
pub mod paper;

pub use engine::{ExecutionEngine, SubmitResult};
pub use order::Order;
pub use paired::{PairState, PairedExecutionResult, PairedExecutor, PairedOrder};
