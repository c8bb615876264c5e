mod error;
mod links;
mod model;
mod naming;
mod profile;
mod scaffold;
mod settings;
mod validate;

pub use error::SpecError;
pub use links::{link_state, normalize_path, resolve_target_path, LinkState};
pub use model::{
    Dotfile, EffectiveSpecification, GitSection, HookPoint, Hooks, Repository, Script,
    ScriptWhen, Specification, SystemSection,
};
pub use naming::sanitize_name;
pub use profile::{
    deep_merge, load_specification, local_document_path, profile_document_path,
    FixedProfileDetector, HostProfileDetector, ProfileDetector,
};
pub use scaffold::{write_default_specification, DEFAULT_SPECIFICATION};
pub use settings::{default_rigger_home, RigSettings};
