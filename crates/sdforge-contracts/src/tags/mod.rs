mod formats;
mod repository;

pub use repository::{
    default_search_paths, search_paths_from, TagLoadDiagnostic, TagRepository, TAG_PATH_ENV,
};
