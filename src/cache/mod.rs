mod async_cache;
mod lazy;
mod volatile;

pub use async_cache::AsyncCache;
pub use lazy::LazyFuture;
pub use volatile::VolatileMap;
