use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Asks the user to (re)select an API credential.
///
/// Fire-and-forget: nothing is retried once the prompt is raised.
#[async_trait::async_trait]
pub trait CredentialPrompt: Send + Sync {
    async fn request_credential(&self, reason: &str);
}

/// Credential prompt surfaced as a flag the presentation layer polls.
#[derive(Default)]
pub struct CredentialSignal {
    required: AtomicBool,
    requests: AtomicU64,
}

impl CredentialSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_required(&self) -> bool {
        self.required.load(Ordering::Acquire)
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Acquire)
    }

    /// The user picked a credential; lower the flag.
    pub fn acknowledge(&self) {
        self.required.store(false, Ordering::Release);
    }
}

#[async_trait::async_trait]
impl CredentialPrompt for CredentialSignal {
    async fn request_credential(&self, reason: &str) {
        let count = self.requests.fetch_add(1, Ordering::AcqRel) + 1;
        self.required.store(true, Ordering::Release);
        tracing::warn!(reason, count, "credentials: API credential selection requested");
    }
}
