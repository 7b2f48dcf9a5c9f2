//! In-memory stores for versions, annotations, comments and change history.
//!
//! Each store exclusively owns its entities; other components never
//! mutate them in place. Cross-component effects happen by emitting new
//! immutable records through the dispatcher.

pub mod annotations;
pub mod changes;
pub mod versions;

pub use annotations::AnnotationStore;
pub use changes::ChangeLog;
pub use versions::VersionStore;
