//! In-process call coalescing: at most one execution per key is in flight,
//! concurrent callers for the same key share its outcome.

mod config;
mod derive;
mod error;
mod key;
mod service;

pub use config::CoalescerConfig;
pub use derive::{fn_name, make_key, Args, Callable};
pub use error::Error;
pub use key::{Key, Token};
pub use service::Coalescer;
