//! Typed configuration for listeners, destinations, routes and brokers,
//! loaded from a TOML bootstrap file and mutable at runtime through
//! [`ConfigStore`]. Mutations are validated before they are applied; a
//! destination referenced by any route cannot be deleted.

pub mod model;
pub mod rules;
pub mod store;

pub use model::{
    BrokerBackend, BrokerConfig, DateShiftConfig, DestinationConfig, GatewayConfig, OcrConfig,
    ResilienceConfig, RouteConfig, RouteDestinationConfig,
};
pub use rules::{Rule, RuleAction, RuleOperator, TagValues};
pub use store::{ConfigError, ConfigStore};
