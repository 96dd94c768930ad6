use super::{Gc, Object};
use crate::table::Table;

/// An instance of a class, holding its own field values.
#[derive(Debug)]
pub struct Instance {
    pub class: Gc<Object>,
    pub fields: Table,
}

impl Instance {
    pub fn new(class: Gc<Object>) -> Self {
        Self {
            class,
            fields: Table::new(),
        }
    }
}
