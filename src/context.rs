use std::sync::Arc;

use crate::auth::TokenValidator;
use crate::config::Config;
use crate::rate_limit::LoginRateLimiter;
use crate::registry::Registry;
use crate::relay::RelayProducer;
use crate::router::Router;

/// Application context containing shared dependencies
/// This reduces parameter passing and makes it easier to add new dependencies
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub router: Arc<Router>,
    pub relay: Arc<RelayProducer>,
    pub rate_limiter: Arc<LoginRateLimiter>,
    pub validator: Arc<dyn TokenValidator>,
}

impl AppContext {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<Registry>,
        router: Arc<Router>,
        relay: Arc<RelayProducer>,
        rate_limiter: Arc<LoginRateLimiter>,
        validator: Arc<dyn TokenValidator>,
    ) -> Self {
        Self {
            config,
            registry,
            router,
            relay,
            rate_limiter,
            validator,
        }
    }
}
