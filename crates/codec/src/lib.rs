//! Decoders, encoders and pure transformations for every artifact format
//! the registry understands.
//!
//! Nothing in here touches the filesystem: decoders take bytes and return
//! the attributes for a metadata record, transformations take decoded
//! values and return new ones.

use serde_json::{Map, Value};

pub mod animation;
pub mod audio;
pub mod document;
pub mod error;
pub mod gltf;
pub mod mesh;
pub mod model;
pub mod obj;
pub mod shader;
pub mod texture;

/// Everything a decoder could read out of one artifact.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Decoded<A> {
    pub attributes: A,
    /// Free-form parameters carried by the artifact itself.
    pub parameters: Map<String, Value>,
    /// Version declared by the artifact, if it declares one.
    pub version: Option<String>,
    /// Names of other artifacts this one needs.
    pub dependencies: Vec<String>,
}
impl<A> Decoded<A> {
    pub fn new(attributes: A) -> Self {
        Self {
            attributes,
            parameters: Map::new(),
            version: None,
            dependencies: Vec::new(),
        }
    }
}
