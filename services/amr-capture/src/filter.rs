//! Meter ID / type inclusion filter

use std::collections::HashSet;

use crate::protocol::MeterMessage;

/// Inclusion sets built once at startup.
///
/// An empty set means "no filtering on this dimension".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeterFilter {
    ids: HashSet<u32>,
    types: HashSet<u8>,
}

impl MeterFilter {
    pub fn new(ids: impl IntoIterator<Item = u32>, types: impl IntoIterator<Item = u8>) -> Self {
        Self {
            ids: ids.into_iter().collect(),
            types: types.into_iter().collect(),
        }
    }

    pub fn accept<M: MeterMessage>(&self, msg: &M) -> bool {
        (self.ids.is_empty() || self.ids.contains(&msg.meter_id()))
            && (self.types.is_empty() || self.types.contains(&msg.meter_type()))
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty() && self.types.is_empty()
    }

    pub fn ids(&self) -> &HashSet<u32> {
        &self.ids
    }

    pub fn types(&self) -> &HashSet<u8> {
        &self.types
    }
}
