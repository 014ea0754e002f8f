pub mod circuit_breaker;
pub mod logging;
pub mod retry;
pub mod validation;
