use std::{sync::OnceLock, time::Duration};

use kiln_core::Dispatcher;

use crate::schemas::ImageSize;

/// Values filled in when a request leaves them out.
#[derive(Debug, Clone)]
pub struct GenerationDefaults {
    pub size: ImageSize,
    pub steps: usize,
    pub seed: u64,
    /// Largest width or height a request may ask for, in pixels.
    pub max_size: usize,
    /// Most denoising steps a request may ask for.
    pub max_steps: usize,
    /// Upper bound on how long a request waits for its images.
    pub request_timeout: Option<Duration>,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            size: ImageSize {
                width: 1024,
                height: 1024,
            },
            steps: 4,
            seed: 42,
            max_size: 2048,
            max_steps: 50,
            request_timeout: None,
        }
    }
}

/// Shared application state.
///
/// The dispatcher is installed once the model has loaded. Until then the
/// server is up but reports itself as not ready.
pub struct AppState {
    dispatcher: OnceLock<Dispatcher>,
    pub defaults: GenerationDefaults,
}

impl AppState {
    pub fn new(defaults: GenerationDefaults) -> Self {
        Self {
            dispatcher: OnceLock::new(),
            defaults,
        }
    }

    /// Marks the server ready. Only the first call has any effect.
    pub fn set_ready(&self, dispatcher: Dispatcher) -> bool {
        self.dispatcher.set(dispatcher).is_ok()
    }

    pub fn dispatcher(&self) -> Option<&Dispatcher> {
        self.dispatcher.get()
    }
}
