//! Core domain types for webhook fan-out.
//!
//! Subscribers, delivery attempts and delivery jobs, the validation that
//! guards them, and the PostgreSQL repositories that persist them. The
//! delivery and API crates build on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    AttemptId, AttemptResponse, DeliveryAttempt, DeliveryJob, JobId, NewSubscriber, Payload,
    Subscriber, SubscriberId, Subscriptions, TransportFailure,
};
pub use time::{Clock, RealClock, TestClock};
