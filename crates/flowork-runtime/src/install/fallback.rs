//! Expected dependency lists for components whose `requirements.txt` may go
//! missing.

use crate::component::ComponentKind;
use std::collections::BTreeMap;

/// Table `kind -> component -> [package spec]`.
///
/// An entry with an empty list marks a component known to need nothing; an
/// entry with packages lets the reconciler restore a lost dependency file.
#[derive(Debug, Clone, Default)]
pub struct FallbackRequirements {
    table: BTreeMap<ComponentKind, BTreeMap<String, Vec<String>>>,
}

impl FallbackRequirements {
    pub fn new(table: BTreeMap<ComponentKind, BTreeMap<String, Vec<String>>>) -> Self {
        Self { table }
    }

    /// First entry found under any of `names` (directory name, then id).
    pub fn lookup(&self, kind: ComponentKind, names: &[&str]) -> Option<&[String]> {
        let entries = self.table.get(&kind)?;
        names
            .iter()
            .find_map(|name| entries.get(*name))
            .map(Vec::as_slice)
    }
}
