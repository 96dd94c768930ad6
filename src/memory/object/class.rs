use super::{Gc, Object};
use crate::table::Table;

/// A class declaration containing the name and all of its methods.
///
/// Methods are keyed by interned name; inheritance copies the superclass
/// methods into the subclass table up front, so lookups never walk a chain.
#[derive(Debug)]
pub struct Class {
    /// Name of the class. Always an interned string object.
    pub name: Gc<Object>,

    /// Methods this class contains, name to closure value.
    pub methods: Table,
}

impl Class {
    pub fn new(name: Gc<Object>) -> Self {
        Self {
            name,
            methods: Table::new(),
        }
    }
}
