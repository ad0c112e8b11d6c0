use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;

/// A boxed future returned by [`AccessGuard`] methods.
pub type GuardFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Room membership check consulted before a new session is created.
///
/// Membership lives in the messaging subsystem, so the check is async.
pub trait AccessGuard: Send + Sync + 'static {
    fn is_participant<'a>(&'a self, user_id: &'a str, room_id: &'a str) -> GuardFuture<'a, bool>;
}

/// Fixed room membership, loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticRoster {
    rooms: HashMap<String, HashSet<String>>,
}

impl StaticRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds (or extends) a room.
    pub fn with_room<I, S>(mut self, room_id: impl Into<String>, participants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rooms
            .entry(room_id.into())
            .or_default()
            .extend(participants.into_iter().map(Into::into));
        self
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

impl AccessGuard for StaticRoster {
    fn is_participant<'a>(&'a self, user_id: &'a str, room_id: &'a str) -> GuardFuture<'a, bool> {
        Box::pin(async move {
            self.rooms
                .get(room_id)
                .is_some_and(|members| members.contains(user_id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn membership() {
        let roster = StaticRoster::new()
            .with_room("general", ["alice", "bob"])
            .with_room("ops", ["carol"]);

        assert!(roster.is_participant("alice", "general").await);
        assert!(!roster.is_participant("carol", "general").await);
        assert!(!roster.is_participant("alice", "missing").await);
        assert_eq!(roster.room_count(), 2);
    }

    #[tokio::test]
    async fn with_room_extends_existing() {
        let roster = StaticRoster::new()
            .with_room("general", ["alice"])
            .with_room("general", ["bob"]);
        assert!(roster.is_participant("alice", "general").await);
        assert!(roster.is_participant("bob", "general").await);
        assert_eq!(roster.room_count(), 1);
    }
}
