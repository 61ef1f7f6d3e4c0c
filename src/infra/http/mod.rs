mod middleware;
mod public;

use axum::http::HeaderName;

pub use middleware::REQUEST_ID_HEADER;
pub use public::{HttpState, build_router};

/// Carries `HIT`, `STALE` or `MISS` on every served page.
pub const CACHE_STATUS_HEADER: HeaderName = HeaderName::from_static("x-isr-cache");
