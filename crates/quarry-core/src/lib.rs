//! Priority fetch scheduling for scraping paginated, rate-limited,
//! authenticated web data.
//!
//! The central type is [`Scheduler`]: submit fetches with a string
//! priority and a converter closure, and await the converted result.
//! The scheduler bounds live concurrency, consults a write-through
//! [`Cache`] before touching the network, recognizes session-expiry
//! responses, and shuts itself down once all submitted work has drained.
//!
//! Network I/O and storage are behind the [`Transport`] and [`KvStore`]
//! traits, so the whole engine runs against test doubles (see
//! [`testutil`]) or an in-process overlay of canned bodies.

pub mod cache;
pub mod config;
pub mod error;
pub mod heap;
pub mod request;
pub mod scheduler;
pub mod stats;
pub mod store;
pub mod testutil;
pub mod traits;
pub mod urls;

pub use cache::Cache;
pub use config::SchedulerConfig;
pub use error::{ConvertError, FetchError, StoreError};
pub use request::{Event, FetchResponse, FetchResult, State, next_state};
pub use scheduler::{Lifecycle, Scheduler, SchedulerBuilder};
pub use stats::{Statistics, StatsSink, TracingStatsSink};
pub use store::MemoryStore;
pub use traits::{KvStore, Notice, TracingNotice, Transport};
pub use urls::normalize_url;
