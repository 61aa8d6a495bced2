//! Actor lifecycle: authentication, client<->actor binding, reconnect (spec §4.9, C11).

use async_trait::async_trait;
use playhouse_wire::RoutePacket;

use crate::sender::ActorSender;

/// A player's server-side surface: one per authenticated client, bound to
/// exactly one stage. `actor_id` is the numeric key the stage roster and
/// `RouteHeader.account_id` use for routing; `account_id` is the business
/// identity string `OnAuthenticate` produces.
///
/// Design Note (spec §9 adaptation): the source has `OnAuthenticate` mutate
/// `account_id` as a side effect before returning `true`. Idiomatic Rust
/// ownership makes that awkward (the handler does not hold a live `&mut
/// Actor` while authenticating), so here `on_authenticate` directly returns
/// `Option<String>` - `Some(account_id)` on success, `None` on failure -
/// which is the same contract without the implicit mutation.
#[derive(Debug, Clone)]
pub struct Actor {
    pub actor_id: i64,
    pub account_id: String,
    pub sid: i64,
    pub authenticated: bool,
    pub connected: bool,
}

impl Actor {
    pub(crate) fn pending(actor_id: i64, sid: i64) -> Self {
        Actor { actor_id, account_id: String::new(), sid, authenticated: false, connected: true }
    }
}

/// User-supplied per-actor handler (spec §6 `IActor`).
#[async_trait]
pub trait IActor: Send + Sync {
    async fn on_create(&self, _actor: &Actor) {}
    async fn on_destroy(&self, _actor: &Actor) {}

    /// Validates the first packet on a session. `Some(account_id)` accepts
    /// the connection and sets the actor's business identity; `None`
    /// rejects it (the framework then emits `Unauthorized` and closes).
    async fn on_authenticate(&self, packet: &RoutePacket, sender: &ActorSender) -> Option<String>;

    async fn on_post_authenticate(&self, _actor: &Actor, _sender: &ActorSender) {}
}

/// Constructs a fresh [`IActor`] handler for a newly created [`Actor`].
/// Registered once per stage type alongside `UseStage` (spec §6).
pub trait ActorFactory: Send + Sync {
    fn create(&self) -> std::sync::Arc<dyn IActor>;
}

impl<F> ActorFactory for F
where
    F: Fn() -> std::sync::Arc<dyn IActor> + Send + Sync,
{
    fn create(&self) -> std::sync::Arc<dyn IActor> {
        (self)()
    }
}
