//! Core Tether types shared by every layer.
//!
//! - [`Value`]: the copyable tree that crosses an endpoint as plain data
//! - [`Path`]: a validated access chain from an exposed root
//! - [`Error`]: failures while reading records out of a `Value`
//!
//! ```rust
//! use tether_core::{path, Value};
//!
//! let mut service = Value::map();
//! service.insert("name", "blog");
//! assert_eq!(service.get(&path!("name")), Some(&Value::from("blog")));
//! ```

mod error;
mod path;
mod value;

pub use error::Error;
pub use path::{Path, PathError};
pub use value::Value;
