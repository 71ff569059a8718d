#![forbid(unsafe_code)]

pub mod auth;
pub mod error;
pub mod gamification;
pub mod invalidate;
pub mod notify;
pub mod progress_service;
pub mod retry;
pub mod watch;

pub use campus_core::Clock;

pub use auth::AuthContext;
pub use error::{LedgerError, ProgressServiceError, TrackerError};
pub use gamification::{AwardReceipt, PointsLedger};
pub use invalidate::{CacheInvalidator, NullInvalidator, QueryScope};
pub use notify::{Notice, Notifier, NullNotifier};
pub use progress_service::ProgressService;
pub use retry::RetryPolicy;
pub use watch::{FlushOutcome, PlaybackEvent, WatchDebouncer, WatchTracker};
