//! Core functionality of the admission layer.
//!
//! This module contains identity resolution, endpoint classification, the
//! sliding-window rate limiter, DDoS detection, the ban registry and the
//! controller that composes them per request.

pub mod admission;
pub mod ban_registry;
pub mod classifier;
pub mod control_plane;
pub mod ddos_detector;
pub mod degraded;
pub mod identity;
pub mod rate_limiter;
pub mod window;

pub use admission::{AdmissionController, Denial, DenialReason, RateLimitHeaders, Verdict};
pub use ban_registry::BanRegistry;
pub use classifier::{EndpointClassifier, PolicyTable};
pub use control_plane::{ControlError, ControlPlane};
pub use ddos_detector::DdosDetector;
pub use degraded::DegradedMode;
pub use identity::{IdentityKey, IdentityResolver, Whitelist};
pub use rate_limiter::RateLimiter;
