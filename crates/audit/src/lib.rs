//! Genesis Mesh Audit - Tamper-Evident Security Log
//!
//! An append-only log where every event's hash depends on its
//! predecessor. Any modification of a past event breaks every later
//! link, so tampering is detectable at the exact index it occurred.

#![warn(missing_docs)]

pub mod event;
pub mod log;

pub use event::{AuditEvent, AuditEventKind, GENESIS_PREV_HASH};
pub use log::{spawn_audit_writer, AuditError, AuditHandle, AuditLog};
