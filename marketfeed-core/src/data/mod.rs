//! Provider boundary: collaborator traits, their error type, the circuit
//! breaker, and the Yahoo Finance adapters.

pub mod circuit_breaker;
pub mod provider;
pub mod yahoo;

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use provider::{
    ChartSource, Dividend, FetchError, Fundamentals, FundamentalsSource, NewsSource, StatementHistory, StatementRow,
};
pub use yahoo::{YahooClient, YahooEndpoints};
