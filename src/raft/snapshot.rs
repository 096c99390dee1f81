use serde_derive::{Deserialize, Serialize};

/// A snapshot root object: one named, self-describing piece of state
/// machine data, transferred whole. The receiver deletes any existing
/// object of the same name and rebuilds it from the stream.
///
/// The two variants cover the two persistent root shapes: an ordered map
/// and a structured row table. The tagged enum replaces dynamic dispatch
/// while keeping the stream extensible.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RootObject {
    /// An ordered-map root: key/value pairs in key order.
    Tree { name: String, entries: Vec<(Vec<u8>, Vec<u8>)> },
    /// A structured-row root: encoded rows in insertion order.
    Table { name: String, rows: Vec<Vec<u8>> },
}

impl RootObject {
    /// Returns the root object's name.
    pub fn name(&self) -> &str {
        match self {
            RootObject::Tree { name, .. } => name,
            RootObject::Table { name, .. } => name,
        }
    }
}

impl crate::encoding::Value for RootObject {}
