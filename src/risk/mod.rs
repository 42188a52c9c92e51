// Risk scoring and bad-actor screening
pub mod bad_actors;
pub mod scorer;

pub use bad_actors::{
    BadActorRegistry, InMemoryBadActorRegistry, RedisBadActorRegistry, DEFAULT_BAD_ACTORS_KEY,
};
pub use scorer::RiskScorer;
