//! Reference job handlers. `ModelInstallHandler` (§4.8) is the only
//! non-trivial one — grounded on `ollama_install.py`'s streaming pull and
//! post-install registration wait.

mod model_install;

pub use model_install::{ModelInstallHandler, PullTracker};
