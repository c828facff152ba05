pub mod bus;
pub mod collect;
mod registration;
pub mod wait;

pub use bus::EventBus;
pub use collect::collect_matches;
pub use wait::wait_for;
