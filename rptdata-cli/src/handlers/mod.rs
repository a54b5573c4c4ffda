//! Request handlers that outgrow a single route function

pub mod sse;
