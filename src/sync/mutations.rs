use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::FeedError;
use crate::state::PublishedState;
use crate::store::LocalStore;
use crate::sync::fetch::{fetch_with_retry, FetchOutcome, RetryPolicy};
use crate::sync::remote::InstanceService;
use crate::types::{now_unix_ms, AuthContext, FeedEvent, IndicatorInstance, NewInstanceArgs};

/// Store key for the locally persisted instance list.
pub const INSTANCES_DOC_KEY: &str = "instances:v1";

const FALLBACK_KEY_PREFIX: &str = "instances:fallback:";

/// Key preserving the payload of a mutation the backend rejected, so the
/// edit survives for manual recovery even after the rollback.
pub fn fallback_key(instance_id: &str) -> String {
    format!("{FALLBACK_KEY_PREFIX}{instance_id}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl MutationKind {
    fn label(self) -> &'static str {
        match self {
            Self::Create => "instances.create",
            Self::Update => "instances.update",
            Self::Delete => "instances.delete",
        }
    }
}

/// Map entries exist only while a remote sync is in flight. The ticket ties
/// a sync task to the entry it registered, so a superseded task cannot
/// commit or roll back on behalf of its successor.
struct PendingMutation {
    snapshot_before: Option<IndicatorInstance>,
    cancel: CancellationToken,
    ticket: u64,
}

type PendingMap = Arc<Mutex<HashMap<String, PendingMutation>>>;

/// Applies instance mutations optimistically and reconciles them with the
/// backend. Guest sessions commit straight to local storage; authenticated
/// sessions spawn a retried remote sync that rolls the optimistic change
/// back on terminal failure.
pub struct MutationCoordinator {
    state: Arc<PublishedState>,
    store: Arc<dyn LocalStore>,
    service: Arc<dyn InstanceService>,
    auth: RwLock<AuthContext>,
    pending: PendingMap,
    policy: RetryPolicy,
    quota_warned: Arc<AtomicBool>,
    next_ticket: AtomicU64,
    root: CancellationToken,
}

struct SyncTaskContext {
    state: Arc<PublishedState>,
    store: Arc<dyn LocalStore>,
    service: Arc<dyn InstanceService>,
    pending: PendingMap,
    policy: RetryPolicy,
    auth: AuthContext,
    quota_warned: Arc<AtomicBool>,
}

impl MutationCoordinator {
    pub fn new(
        state: Arc<PublishedState>,
        store: Arc<dyn LocalStore>,
        service: Arc<dyn InstanceService>,
        policy: RetryPolicy,
        root: CancellationToken,
    ) -> Self {
        Self {
            state,
            store,
            service,
            auth: RwLock::new(AuthContext::guest()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            policy,
            quota_warned: Arc::new(AtomicBool::new(false)),
            next_ticket: AtomicU64::new(1),
            root,
        }
    }

    pub fn set_auth(&self, auth: AuthContext) {
        *self.auth.write() = auth;
    }

    pub fn auth(&self) -> AuthContext {
        self.auth.read().clone()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Loads the instance list on startup. Authenticated sessions prefer the
    /// backend copy and fall back to the local document when it is
    /// unreachable; guests read local storage only.
    pub async fn hydrate(&self) {
        let auth = self.auth.read().clone();
        if auth.is_authenticated() {
            match self.service.list_instances(&auth).await {
                Ok(remote) => {
                    persist_instances(&self.store, &remote, &self.quota_warned).await;
                    self.state.set_instances(remote);
                    return;
                }
                Err(error) => {
                    warn!(
                        error = %error,
                        "remote instance list failed; falling back to the local copy"
                    );
                }
            }
        }
        let local = load_local_instances(&self.store).await;
        self.state.set_instances(local);
    }

    pub async fn create(&self, args: NewInstanceArgs) -> Result<IndicatorInstance, FeedError> {
        let instance = args.into_instance(now_unix_ms())?;
        let mut instances = self.state.instances();
        instances.push(instance.clone());
        self.state.set_instances(instances);
        self.dispatch(MutationKind::Create, instance.clone(), None)
            .await;
        Ok(instance)
    }

    pub async fn update(&self, updated: IndicatorInstance) -> Result<(), FeedError> {
        let mut instances = self.state.instances();
        let Some(slot) = instances
            .iter_mut()
            .find(|instance| instance.id == updated.id)
        else {
            return Err(FeedError::InvalidArgument(format!(
                "unknown indicator instance '{}'",
                updated.id
            )));
        };
        let snapshot = slot.clone();
        *slot = updated.clone();
        self.state.set_instances(instances);
        self.dispatch(MutationKind::Update, updated, Some(snapshot))
            .await;
        Ok(())
    }

    pub async fn remove(&self, instance_id: &str) -> Result<(), FeedError> {
        let mut instances = self.state.instances();
        let Some(index) = instances
            .iter()
            .position(|instance| instance.id == instance_id)
        else {
            return Err(FeedError::InvalidArgument(format!(
                "unknown indicator instance '{instance_id}'"
            )));
        };
        let snapshot = instances.remove(index);
        self.state.set_instances(instances);
        self.state.drop_indicator(instance_id);
        self.dispatch(MutationKind::Delete, snapshot.clone(), Some(snapshot))
            .await;
        Ok(())
    }

    /// Payloads of rejected mutations kept for manual recovery.
    pub async fn fallback_drafts(&self) -> Vec<IndicatorInstance> {
        let keys = match self.store.list_keys(FALLBACK_KEY_PREFIX).await {
            Ok(keys) => keys,
            Err(error) => {
                warn!(error = %error, "failed to list fallback drafts");
                return Vec::new();
            }
        };
        let mut drafts = Vec::new();
        for key in keys {
            match self.store.get(&key).await {
                Ok(Some(payload)) => match serde_json::from_str(&payload) {
                    Ok(instance) => drafts.push(instance),
                    Err(error) => warn!(key, error = %error, "skipping corrupt fallback draft"),
                },
                Ok(None) => {}
                Err(error) => warn!(key, error = %error, "failed to read fallback draft"),
            }
        }
        drafts
    }

    async fn dispatch(
        &self,
        kind: MutationKind,
        instance: IndicatorInstance,
        snapshot_before: Option<IndicatorInstance>,
    ) {
        let auth = self.auth.read().clone();
        if !auth.is_authenticated() {
            // Guest sessions are local-only: the write-through is the commit.
            persist_instances(&self.store, &self.state.instances(), &self.quota_warned).await;
            return;
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::SeqCst);
        let cancel = self.root.child_token();
        {
            let mut pending = self.pending.lock();
            // A still-pending mutation for the same instance is superseded:
            // its task is cancelled and its pre-mutation snapshot carries
            // over, so a later rollback lands on the state before the burst
            // of edits began.
            let inherited = match pending.remove(&instance.id) {
                Some(prior) => {
                    prior.cancel.cancel();
                    prior.snapshot_before
                }
                None => snapshot_before,
            };
            pending.insert(
                instance.id.clone(),
                PendingMutation {
                    snapshot_before: inherited,
                    cancel: cancel.clone(),
                    ticket,
                },
            );
        }

        let ctx = SyncTaskContext {
            state: Arc::clone(&self.state),
            store: Arc::clone(&self.store),
            service: Arc::clone(&self.service),
            pending: Arc::clone(&self.pending),
            policy: self.policy.clone(),
            auth,
            quota_warned: Arc::clone(&self.quota_warned),
        };
        tokio::spawn(run_remote_sync(ctx, kind, instance, ticket, cancel));
    }
}

async fn run_remote_sync(
    ctx: SyncTaskContext,
    kind: MutationKind,
    instance: IndicatorInstance,
    ticket: u64,
    cancel: CancellationToken,
) {
    let outcome = fetch_with_retry(kind.label(), &ctx.policy, &cancel, || {
        let service = Arc::clone(&ctx.service);
        let auth = ctx.auth.clone();
        let payload = instance.clone();
        async move {
            match kind {
                MutationKind::Create => service.create_instance(&auth, &payload).await,
                MutationKind::Update => service.update_instance(&auth, &payload).await,
                MutationKind::Delete => service.delete_instance(&auth, &payload.id).await,
            }
        }
    })
    .await;

    match outcome {
        FetchOutcome::Success(()) => {
            if take_if_owner(&ctx.pending, &instance.id, ticket).is_none() {
                debug!(
                    instance_id = %instance.id,
                    "committed mutation was superseded before finishing"
                );
                return;
            }
            ctx.state.set_offline(false);
            persist_instances(&ctx.store, &ctx.state.instances(), &ctx.quota_warned).await;
        }
        FetchOutcome::Failed(error) => {
            let Some(entry) = take_if_owner(&ctx.pending, &instance.id, ticket) else {
                debug!(instance_id = %instance.id, "failed mutation was already superseded");
                return;
            };
            warn!(
                instance_id = %instance.id,
                error = %error,
                "instance sync failed; rolling back the optimistic change"
            );
            rollback_instance(&ctx.state, &instance.id, entry.snapshot_before);
            if matches!(kind, MutationKind::Create | MutationKind::Update) {
                write_fallback(&ctx.store, &instance).await;
            }
            persist_instances(&ctx.store, &ctx.state.instances(), &ctx.quota_warned).await;
            ctx.state.emit(FeedEvent::MutationFailed {
                instance_id: instance.id.clone(),
                message: error.to_string(),
            });
            if error.is_network() {
                ctx.state.set_offline(true);
            }
        }
        FetchOutcome::Cancelled => {
            debug!(instance_id = %instance.id, "instance sync cancelled");
        }
    }
}

/// Removes and returns the pending entry only when it still belongs to the
/// given ticket.
fn take_if_owner(pending: &PendingMap, instance_id: &str, ticket: u64) -> Option<PendingMutation> {
    let mut map = pending.lock();
    let owns = map
        .get(instance_id)
        .is_some_and(|entry| entry.ticket == ticket);
    if owns {
        map.remove(instance_id)
    } else {
        None
    }
}

fn rollback_instance(
    state: &PublishedState,
    instance_id: &str,
    snapshot: Option<IndicatorInstance>,
) {
    let mut instances = state.instances();
    match snapshot {
        Some(previous) => match instances
            .iter_mut()
            .find(|instance| instance.id == instance_id)
        {
            Some(slot) => *slot = previous,
            None => instances.push(previous),
        },
        None => instances.retain(|instance| instance.id != instance_id),
    }
    state.set_instances(instances);
}

async fn persist_instances(
    store: &Arc<dyn LocalStore>,
    instances: &[IndicatorInstance],
    quota_warned: &AtomicBool,
) {
    let payload = match serde_json::to_string(instances) {
        Ok(payload) => payload,
        Err(error) => {
            warn!(error = %error, "failed to encode the instance document");
            return;
        }
    };
    match store.set(INSTANCES_DOC_KEY, &payload).await {
        Ok(()) => {}
        Err(FeedError::QuotaExceeded) => {
            if !quota_warned.swap(true, Ordering::SeqCst) {
                warn!("local storage quota exceeded; instances persist in memory only");
            }
        }
        Err(error) => warn!(error = %error, "failed to persist the instance document"),
    }
}

async fn write_fallback(store: &Arc<dyn LocalStore>, instance: &IndicatorInstance) {
    let payload = match serde_json::to_string(instance) {
        Ok(payload) => payload,
        Err(error) => {
            warn!(error = %error, "failed to encode the fallback draft");
            return;
        }
    };
    if let Err(error) = store.set(&fallback_key(&instance.id), &payload).await {
        warn!(
            instance_id = %instance.id,
            error = %error,
            "failed to preserve the rejected mutation"
        );
    }
}

async fn load_local_instances(store: &Arc<dyn LocalStore>) -> Vec<IndicatorInstance> {
    let payload = match store.get(INSTANCES_DOC_KEY).await {
        Ok(Some(payload)) => payload,
        Ok(None) => return Vec::new(),
        Err(error) => {
            warn!(error = %error, "failed to read the local instance document");
            return Vec::new();
        }
    };
    match serde_json::from_str(&payload) {
        Ok(instances) => instances,
        Err(error) => {
            warn!(error = %error, "local instance document is corrupt; starting empty");
            Vec::new()
        }
    }
}
