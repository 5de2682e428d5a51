//! Metadata records and the JSON stores that hold them.
//!
//! Each artifact kind gets one [`MetadataStore`] whose document lives at
//! `<kind>s/metadata/<kind>s_metadata.json` under the asset root. Records are a
//! [`Common`] part plus kind-specific attributes (see [`models`]); anything
//! else found in a record is carried along untouched.

pub mod error;
pub mod migrate;
pub mod models;
mod store;

pub use crate::migrate::{ARTIFACT_MIGRATIONS, CURRENT_SCHEMA, Migration};
pub use crate::models::{Bounds, Common, Record};
pub use crate::store::MetadataStore;
