mod cache;
mod loader;

pub use cache::{Effect, PolicyBundle, PolicyCache, PolicyRule};
pub use loader::PolicyLoader;
