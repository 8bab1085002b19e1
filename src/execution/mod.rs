// Order tracking, position state and the per-symbol trading decisions
pub mod accumulation;
pub mod controller;
pub mod engine;
pub mod orders;
pub mod positions;

pub use accumulation::{
    AccumulationConfig, AccumulationLedger, AccumulationMode, EntryReason, LedgerEntry,
    PlannedEntry, TriggerBasis,
};
pub use controller::{ControllerSettings, HedgeConfig, IntentKind, OrderIntent, SymbolController};
pub use engine::TradingEngine;
pub use orders::{CancelSummary, Order, OrderManager};
pub use positions::{ExitReason, ExitSignal, Position, PositionBook, TakeProfitLevel};
