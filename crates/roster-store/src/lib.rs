//! roster-store: SQLite persistence for enrolled identities and attendance.
//!
//! Implements the `EnrollmentStore` and `AttendanceStore` adapters from
//! roster-core over a single database file.

mod codec;
pub mod sqlite;

pub use sqlite::{EnrolledIdentity, SqliteStore};
