//! Retention policy language and the keep-decision engine.

pub mod calendar;
pub mod keep;
pub mod rules;
