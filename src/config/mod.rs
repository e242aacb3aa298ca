pub mod paths;
pub mod persistence;
pub mod schema;

pub use paths::*;
pub use persistence::*;
pub use schema::*;

fn default_max_write() -> usize {
    64 * 1024
}

fn default_max_background() -> usize {
    12
}

fn default_fs_name() -> String {
    "nodefuse".to_string()
}

fn default_timeout() -> f64 {
    1.0
}
