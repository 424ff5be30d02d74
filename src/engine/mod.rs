//! Pure reconciliation helpers: no I/O, no client handles. Everything here
//! is a function from observed state to a decision or a rendered value.

pub mod condition;
pub mod dag;
pub mod jsonpath;
pub mod schedule;
pub mod template;
pub mod validation;
