mod error_handler;
mod rate_limit;
mod response_cache;

pub use error_handler::log_errors;
pub use rate_limit::{
    X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING, X_RATELIMIT_RESET, apply_rate_limit_headers, rate_limit,
    too_many_requests,
};
pub use response_cache::response_cache;
