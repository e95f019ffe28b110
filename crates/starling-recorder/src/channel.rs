//! The seam to the voice-client layer.
//!
//! The recorder never talks to the TeamSpeak connection directly; it sees
//! the channel through this trait, which the client layer implements from
//! its live clientlist.

/// Transient per-connection client id, as used to tag incoming PCM.
pub type ClientId = u16;

/// Stable identity of a channel member.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub uid: String,
    pub name: String,
}

pub trait ChannelDirectory: Send + Sync {
    /// Everyone currently sharing the bot's channel, excluding the bot.
    fn channel_members(&self) -> Vec<Identity>;

    /// Whether `client` is currently in the same channel as the bot. PCM
    /// from anywhere else is dropped at ingress.
    fn in_bot_channel(&self, client: ClientId) -> bool;

    /// Resolve a live client id to its stable identity, if known.
    fn identity(&self, client: ClientId) -> Option<Identity>;
}

/// A directory with nobody home; used until a client layer is attached.
#[derive(Debug, Default)]
pub struct EmptyDirectory;

impl ChannelDirectory for EmptyDirectory {
    fn channel_members(&self) -> Vec<Identity> {
        Vec::new()
    }

    fn in_bot_channel(&self, _client: ClientId) -> bool {
        false
    }

    fn identity(&self, _client: ClientId) -> Option<Identity> {
        None
    }
}

/// In-memory directory driven by explicit updates. Useful as the seam for
/// harnesses and tests that script channel membership.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    inner: std::sync::Mutex<std::collections::HashMap<ClientId, Identity>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_members(&self, members: Vec<(ClientId, Identity)>) {
        *self.inner.lock().expect("directory lock poisoned") = members.into_iter().collect();
    }

    pub fn clear(&self) {
        self.inner.lock().expect("directory lock poisoned").clear();
    }
}

impl ChannelDirectory for StaticDirectory {
    fn channel_members(&self) -> Vec<Identity> {
        let mut members: Vec<Identity> = self
            .inner
            .lock()
            .expect("directory lock poisoned")
            .values()
            .cloned()
            .collect();
        members.sort_by(|a, b| a.uid.cmp(&b.uid));
        members
    }

    fn in_bot_channel(&self, client: ClientId) -> bool {
        self.inner
            .lock()
            .expect("directory lock poisoned")
            .contains_key(&client)
    }

    fn identity(&self, client: ClientId) -> Option<Identity> {
        self.inner
            .lock()
            .expect("directory lock poisoned")
            .get(&client)
            .cloned()
    }
}

/// The channel counts as empty when nobody is left after dropping the
/// configured exclusions.
pub fn is_alone(members: &[Identity], excluded_uids: &[String]) -> bool {
    !members
        .iter()
        .any(|m| !excluded_uids.iter().any(|e| e == &m.uid))
}
