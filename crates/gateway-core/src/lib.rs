//! Gateway Core: request dispatch, rate limiting, model diagnostics,
//! caller authentication, the HTTP-facing error taxonomy, and the
//! explicit application context (`GatewayState`) that wires C1-C8
//! together for the `gateway` service binary.

pub mod auth;
pub mod clock;
pub mod dispatch;
pub mod error;
pub mod limiter;
pub mod model_log;
pub mod state;

pub use clock::{Clock, SleepOutcome, SystemClock};
pub use dispatch::{handle_generate, handle_stream_generate};
pub use error::{DispatchError, ErrorCode};
pub use limiter::{ModelSlot, RateLimiter};
pub use model_log::{ModelLogEntry, ModelLogger};
pub use state::{DispatchConfig, GatewayState};
