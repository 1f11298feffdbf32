use std::fmt;
use zeroize::Zeroize;

use crate::mask::mask;

/// A secret record as stored in a vault backend.
#[derive(Clone, PartialEq, Eq)]
pub struct VaultItem {
    pub name: String,
    pub path: String,
    pub field: String,
    pub value: String,
}

impl fmt::Debug for VaultItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultItem")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("field", &self.field)
            .field("value", &mask(&self.value))
            .finish()
    }
}

impl Drop for VaultItem {
    fn drop(&mut self) {
        self.value.zeroize();
    }
}
