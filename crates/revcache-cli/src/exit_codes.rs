//! Process exit codes for the revcache binary.
//! Values line up with `CacheError::exit_code`.

pub const SUCCESS: i32 = 0;
pub const CONFIG_ERROR: i32 = 1; // Bad config file, flag or URL
pub const INTERNAL_ERROR: i32 = 2; // Anything not classified below
pub const ORIGIN_ERROR: i32 = 3; // Origin unreachable or answered with an error
pub const STORAGE_ERROR: i32 = 4; // Content store or index IO failure
pub const NOT_CACHED: i32 = 6; // `inspect` found no entry

/// Map a top-level error to an exit code.
pub fn for_error(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<revcache_core::CacheError>()
        .map(revcache_core::CacheError::exit_code)
        .unwrap_or(INTERNAL_ERROR)
}
