//! External stores: the time-series sink and the key-value cache.
//!
//! Both are remote and fallible. The sink is write-behind with a circuit
//! breaker so a dead store can never stall the control loops; the cache is
//! best-effort with an in-process fallback.

pub mod breaker;
pub mod cache;
pub mod influx;

pub use breaker::CircuitBreaker;
pub use cache::{connect_cache, KvCache, MemoryCache, RedisCache};
pub use influx::{InfluxQuery, InfluxSink, Point, QueryRow, SinkHandle};
