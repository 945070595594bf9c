//! Which release the user is looking at, and which documents belong to it.

mod model;
mod resolver;

pub use model::{
    is_in_perspective, resolve_perspective, CurrentRelease, Perspective, RELEASE_PARAM_PREFIX,
};
pub use resolver::{NavigationState, PerspectiveResolver, RouterState};
