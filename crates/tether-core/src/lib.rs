pub mod dispatch;
pub mod fault;
pub mod policy;

pub use dispatch::{Dispatch, EventHandler};
pub use fault::{DispatchError, DispatchFault};
pub use policy::{DispatchPolicy, ErrorPolicy, FaultHook};
