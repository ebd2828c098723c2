//! Database connection pool and bundled migrations.
//!
//! The pool is shared by every repository; each operation checks out its own
//! connection for one statement or transaction and returns it immediately.

mod pool;

pub use pool::{AsyncDbPool, MIGRATIONS, establish_async_connection_pool, run_migrations};
