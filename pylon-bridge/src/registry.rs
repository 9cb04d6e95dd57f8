//! Static datacenter registry.

use std::collections::HashMap;

/// Maps datacenter ids (1..=5) to upstream endpoint addresses.
#[derive(Clone, Debug)]
pub struct DcRegistry {
    endpoints: HashMap<u8, String>,
}

impl Default for DcRegistry {
    /// Production datacenter addresses.
    fn default() -> Self {
        let endpoints = [
            (1, "149.154.175.53:443"),
            (2, "149.154.167.51:443"),
            (3, "149.154.175.100:443"),
            (4, "149.154.167.91:443"),
            (5, "91.108.56.130:443"),
        ]
        .into_iter()
        .map(|(id, addr)| (id, addr.to_owned()))
        .collect();
        Self { endpoints }
    }
}

impl DcRegistry {
    /// A registry with no endpoints; populate with [`DcRegistry::set_endpoint`].
    pub fn empty() -> Self {
        Self { endpoints: HashMap::new() }
    }

    /// The upstream address for `dc_id`, if registered.
    pub fn endpoint_for(&self, dc_id: u8) -> Option<&str> {
        self.endpoints.get(&dc_id).map(String::as_str)
    }

    /// Register or override an endpoint.
    pub fn set_endpoint(&mut self, dc_id: u8, addr: impl Into<String>) {
        self.endpoints.insert(dc_id, addr.into());
    }
}
