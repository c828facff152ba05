pub mod bucket;
pub mod error;
pub mod frame;
pub mod identify;
pub mod inflate;
pub mod transport;
pub mod ws;

pub use bucket::{Bucket, BucketKey, RateLimiter};
pub use error::GatewayError;
pub use frame::{Frame, FrameKind, WireSink, WireStream};
pub use identify::{IdentifyLimiter, IdentifyTicket};
pub use inflate::{Inflate, Inflater};
pub use transport::{Transport, TransportConfig, TransportEvent, TransportState};
