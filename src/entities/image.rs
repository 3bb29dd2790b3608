use std::collections::HashMap;

use serde::Serialize;

/// Boot image for a server. The in-memory object is authoritative, so
/// reloading an image is a no-op at the service level.
#[derive(Clone, Serialize)]
pub struct Image {
    pub id: u64,
    pub name: String,
    pub labels: HashMap<String, String>,
    pub meta: HashMap<String, String>,
}

impl Image {
    pub fn new(id: u64, name: String) -> Self {
        Image {
            id,
            name,
            labels: HashMap::new(),
            meta: HashMap::new(),
        }
    }
}
