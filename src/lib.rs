pub mod assistant;
pub mod campaigns;
pub mod config;
pub mod logging;
pub mod presence;
pub mod runtime;
pub mod session;
pub mod stream;
pub mod sweeper;
pub mod web;

pub use helpdock_core::error;
pub use helpdock_core::types;
pub use helpdock_storage::db;

#[cfg(test)]
pub mod test_support {
    use std::sync::{Mutex, MutexGuard, OnceLock};

    pub fn env_lock() -> MutexGuard<'static, ()> {
        static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        ENV_LOCK
            .get_or_init(|| Mutex::new(()))
            .lock()
            .expect("env lock poisoned")
    }
}
