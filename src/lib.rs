//! Identity-preserving client-side cache for remote entity stores.
//!
//! A [`Session`] sits between application code and a [`RequestGateway`] to
//! a remote production-tracking server. Every record the gateway returns is
//! merged into one canonical [`EntityRef`] per `(type, id)`, so separate
//! queries that touch the same entity always hand back the same object,
//! already carrying everything the session has learned about it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use tracksession::{Filter, RequestGateway, Session};
//!
//! fn shots(gateway: Arc<dyn RequestGateway>) -> tracksession::Result<()> {
//!     let session = Session::new(gateway);
//!     let shots = session.find("Shot", &[Filter::is("sg_status_list", "ip")], &["code"])?;
//!     for shot in &shots {
//!         println!("{} {:?}", shot, shot.get("code")?);
//!     }
//!     Ok(())
//! }
//! ```

pub mod core;
pub mod entity;
pub mod executor;
pub mod gateway;
pub mod planner;
pub mod session;

pub use crate::core::{parse_timestamp, Fields, Result, SessionError, Value};
pub use crate::entity::{Entity, EntityRef, Existence};
pub use crate::executor::Task;
pub use crate::gateway::{
    BatchRequest, BatchResponse, Filter, FindOptions, PathRemap, RequestGateway, SchemaResolver,
};
pub use crate::planner::{expand_braces, FieldPolicy};
pub use crate::session::{BatchOutcome, OverridePolicy, Session, SessionBuilder};
