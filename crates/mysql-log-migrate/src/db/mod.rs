//! Database plumbing: connection pools, discovery queries, SQL builders, and
//! the fast-load envelope around the destination server.

mod discovery;
mod fastload;
mod pool;
mod sql;

pub use discovery::{max_pk, pk_range, secure_file_priv, table_columns};
pub use fastload::{disable_fast_load, enable_fast_load, FastLoadSettings, OriginalSettings};
pub use pool::connect;
pub use sql::{build_load_data, build_range_select, quote_ident};
