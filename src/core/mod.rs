pub mod error;
pub mod time;
pub mod value;

pub use error::{Result, SessionError};
pub use time::parse_timestamp;
pub use value::{Fields, Value};
