//! Outbound capabilities the core needs from its host environment.
//!
//! # Responsibility
//! - Describe presentation, navigation, network submission and time as
//!   traits, so the core runs unchanged under a browser bridge, a desktop
//!   shell or tests.
//!
//! # Invariants
//! - Implementations must not block the async runtime for long; long work
//!   belongs behind the async methods.

mod clock;
mod presenter;
mod transport;

pub use clock::{Clock, SystemClock, TokioClock};
pub use presenter::{AppNavigator, NotificationPresenter, PresentError, PresentRequest};
pub use transport::{NetworkError, SyncTransport};
