pub mod schema;

pub use schema::{
    CacheBackend, CacheConfig, Config, Environment, FailMode, GatewayConfig, LlmConfig,
    LlmProvider, RateLimitConfig, WindowMode,
};
