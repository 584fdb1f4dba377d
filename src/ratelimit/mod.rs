//! Token-bucket admission control.

mod backend;
mod bucket;
mod clock;
mod descriptor;
mod limiter;
mod policy;
mod rules;

pub use backend::{BucketStore, TakeRequest};
pub use bucket::{BucketLimit, BucketState, Decision};
pub use clock::{Clock, ManualClock, SystemClock};
pub use descriptor::{BucketId, DEFAULT_KEY_PREFIX};
pub use limiter::{LimiterError, RateLimiter};
pub use policy::{Admission, OutageGuard, OutageMode, OutagePolicy, OutageStats};
pub use rules::LimitRules;
