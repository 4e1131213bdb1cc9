mod registry;

pub use registry::{ModelRegistry, ModelSpec, DEFAULT_EDIT_MODELS, DRYRUN_EDIT_MODEL};
