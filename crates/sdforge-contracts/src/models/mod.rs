mod catalog;
mod reference;
mod selections;

pub use catalog::ModelCatalog;
pub use reference::{ModelReference, ModelReferenceError};
pub use selections::{Selection, SelectionChange, SelectionSet, DEFAULT_SELECTION_WEIGHT};
