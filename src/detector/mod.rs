//! Failure Detector Support
//!
//! Two pieces the probe scheduler leans on:
//!
//! - [`awareness::Awareness`] — a bounded local health score. Probe failures
//!   raise it, successes lower it, and every probe interval and timeout is
//!   stretched by `(1 + score)` so a degraded node stops declaring healthy
//!   peers dead on the strength of its own bad measurements.
//! - [`suspicion::Suspicion`] — one cancellable timer per suspected node.
//!   Independent corroborating suspicions shrink the remaining timeout
//!   toward the lower bound; a refutation or removal cancels the timer, and
//!   natural expiry confirms the death.

pub mod awareness;
pub mod suspicion;
