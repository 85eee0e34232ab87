//! Domain Layer
//!
//! Entities, value objects, ports (outbound interfaces) and pure routing
//! logic. Nothing here performs I/O directly.

pub mod entities;
pub mod ports;
pub mod services;
pub mod value_objects;
