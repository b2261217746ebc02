pub mod key;
pub mod limiter;
pub mod middleware;
pub mod policy;
pub mod store;

pub use key::{KeyGenerator, PrincipalResolver, RequestContext};
pub use limiter::{RateLimitResult, SlidingWindowLimiter};
pub use middleware::{admission_middleware, AdmissionControl, AdmissionResult, AdmissionStats};
pub use policy::{Policy, PolicyRegistry};
pub use store::{now_millis, spawn_sweeper, WindowEntry, WindowStore};
