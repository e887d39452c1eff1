//! `postcards-api` — webhook ingress, background worker, admin surface.

pub mod app;
pub mod stripe;
pub mod worker;
