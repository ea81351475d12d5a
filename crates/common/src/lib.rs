pub mod configuration;

pub use configuration::{
    Backend, BackendAuthConfig, ConfigError, FilterConfig, HeaderMatch, RequestCost,
    RequestCostKind, RouteRule, VersionedApiSchema,
};
