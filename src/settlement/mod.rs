// Settlement: serialized counter-transfers for detected pool transactions
pub mod processor;
pub mod queue;
pub mod retry;

pub use processor::{
    ledger_write, ProcessorConfig, SettlementKind, SettlementProcessor, SettlementResult,
};
pub use queue::{QueueHandle, SettlementQueue};
pub use retry::RetryPolicy;
