//! Runtime adapters used to drive armed tasks.

pub mod tokio_spawner;

pub use tokio_spawner::{Spawn, TokioSpawner};
