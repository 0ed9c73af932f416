//! Risk management: stop-loss lifecycle, sell execution, position sizing.

pub mod executor;
pub mod sizing;
pub mod stop_loss;

pub use executor::StopLossExecutor;
pub use sizing::{AllocationConstraints, CvarPositionSizer, PositionSizer, ReserveConstraints};
pub use stop_loss::{StopLossOrder, StopLossRegistry, StopParams, StopType};
