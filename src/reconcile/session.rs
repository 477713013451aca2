//! Feed session: drives [`Reconciliation`] over a [`RequestProcessor`].
//!
//! A session owns one primary [`FeedContainer`]. Each `load` claims the
//! single-flight guard, discovers shards, then runs an event loop: shard
//! replies arrive on an mpsc channel from whatever task the processor uses,
//! and a deadline per phase guarantees the round ends even when nothing
//! answers.
//!
//! Every round is reconciled into a staging container. A refresh replaces
//! the primary once it publishes; a page ("more") is spliced into it. A
//! failed or cancelled round leaves the primary as it was.

use std::mem;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, info_span, trace, warn, Instrument};

use super::engine::{Command, Reconciliation, RoundContext, RoundSummary, SessionEvent, Stage, Step};
use super::guard::{FlightPermit, SessionPhase, SingleFlight};
use crate::config::Config;
use crate::error::{FeedError, Result};
use crate::feed::{
    CursorManager, FeedContainer, FeedEvent, FeedFilter, FeedProfile, FeedSnapshot, PageDirection,
    PageToken,
};
use crate::identity::IdentityCache;
use crate::model::{ChainId, FeedItem, ItemId};
use crate::transport::{ContentReply, IdentityReply, RequestProcessor, ScatterReply};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Result of a completed load.
#[derive(Debug, Clone, Serialize)]
pub struct FeedReport {
    pub session_id: String,
    pub feed: FeedSnapshot,
    /// For a page load, whether the page added anything to the feed
    pub appended: Option<bool>,
    pub summary: RoundSummary,
}

#[derive(Debug)]
pub enum LoadOutcome {
    Published(FeedReport),
    /// Another load was already in flight; nothing was changed
    Dropped,
}

impl LoadOutcome {
    pub fn report(&self) -> Option<&FeedReport> {
        match self {
            LoadOutcome::Published(report) => Some(report),
            LoadOutcome::Dropped => None,
        }
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self, LoadOutcome::Dropped)
    }
}

/// Container a round reconciles into before it is published.
enum Staging {
    /// Replaces the primary
    Refresh(FeedContainer),
    /// Appended to the primary
    Page(FeedContainer),
}

struct SessionState {
    primary: FeedContainer,
    staging: Option<Staging>,
    cursors: CursorManager,
    phase: SessionPhase,
}

impl SessionState {
    /// The container the current round writes into.
    fn target(&mut self) -> &mut FeedContainer {
        match self.staging.as_mut() {
            Some(Staging::Refresh(container) | Staging::Page(container)) => container,
            None => &mut self.primary,
        }
    }

    fn reset(&mut self) {
        self.staging = None;
        self.cursors.release();
        self.phase = SessionPhase::Idle;
    }
}

/// Owns the flight permit for one round and returns the session to idle
/// when the round ends, including when the `load` future is dropped.
struct RoundGuard<'a> {
    state: &'a Mutex<SessionState>,
    armed: bool,
    _permit: FlightPermit,
}

impl RoundGuard<'_> {
    async fn finish(mut self) {
        self.state.lock().await.reset();
        self.armed = false;
    }
}

impl Drop for RoundGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        // runs before the permit is released; a contended lock leaves the
        // cleanup to the next round, which reclaims it under the permit
        match self.state.try_lock() {
            Ok(mut state) => {
                state.reset();
                debug!("abandoned round cleaned up");
            }
            Err(_) => debug!("abandoned round left for the next load to reclaim"),
        }
    }
}

pub struct FeedSession {
    session_id: String,
    profile: Arc<dyn FeedProfile>,
    processor: Arc<dyn RequestProcessor>,
    identities: Arc<IdentityCache>,
    config: Config,
    flight: Arc<SingleFlight>,
    events: broadcast::Sender<FeedEvent>,
    state: Mutex<SessionState>,
}

impl FeedSession {
    pub fn new(
        profile: Arc<dyn FeedProfile>,
        processor: Arc<dyn RequestProcessor>,
        identities: Arc<IdentityCache>,
        config: Config,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let primary = FeedContainer::new(config.reconcile.container(profile.as_ref()))
            .with_events(events.clone());
        let cursors = CursorManager::new(profile.cursor_fields(), profile.grouping());

        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            profile,
            processor,
            identities,
            config,
            flight: SingleFlight::new(),
            events,
            state: Mutex::new(SessionState {
                primary,
                staging: None,
                cursors,
                phase: SessionPhase::Idle,
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn profile(&self) -> &dyn FeedProfile {
        self.profile.as_ref()
    }

    /// Observer events for the primary container.
    pub fn subscribe(&self) -> broadcast::Receiver<FeedEvent> {
        self.events.subscribe()
    }

    pub fn is_processing(&self) -> bool {
        self.flight.is_processing()
    }

    pub async fn phase(&self) -> SessionPhase {
        self.state.lock().await.phase
    }

    /// Current feed, newest first. Each call is a fresh enumeration.
    pub async fn feed(&self) -> FeedSnapshot {
        self.state.lock().await.primary.feed()
    }

    /// Look up a loaded item by hex content id.
    pub async fn locate(&self, id: &str) -> Result<Option<FeedItem>> {
        let id: ItemId = id.parse()?;
        Ok(self.state.lock().await.primary.locate(&id).cloned())
    }

    /// Token for the page after what the feed currently holds.
    pub async fn next_page(&self) -> PageToken {
        self.next_page_in(PageDirection::Older).await
    }

    pub async fn next_page_in(&self, direction: PageDirection) -> PageToken {
        let state = self.state.lock().await;
        state.cursors.capture(&state.primary, direction)
    }

    /// Run one reconciliation round.
    ///
    /// Without a page token the feed is refreshed from the top; with one, the
    /// page is reconciled separately and appended. Returns
    /// [`LoadOutcome::Dropped`] if a round is already running.
    pub async fn load(&self, filter: FeedFilter, page: Option<PageToken>) -> Result<LoadOutcome> {
        let filter = self.profile.validate(&filter)?;

        let Some(permit) = self.flight.try_begin() else {
            debug!(session = %self.session_id, "load dropped, round already in flight");
            return Ok(LoadOutcome::Dropped);
        };
        let guard = RoundGuard {
            state: &self.state,
            armed: true,
            _permit: permit,
        };

        let span = info_span!(
            "feed_load",
            session = %self.session_id,
            feed = self.profile.name(),
            filter = filter.label(),
            paging = page.is_some()
        );
        let result = self.run(filter, page).instrument(span).await;
        guard.finish().await;

        match result {
            Ok(report) => Ok(LoadOutcome::Published(report)),
            Err(err) => {
                warn!(session = %self.session_id, code = err.code(), error = %err, "load failed");
                Err(err)
            }
        }
    }

    /// Run a load on its own task and report through callbacks.
    ///
    /// A load dropped by the single-flight guard invokes neither callback.
    pub fn spawn_load<R, E>(
        self: &Arc<Self>,
        filter: FeedFilter,
        page: Option<PageToken>,
        on_ready: R,
        on_error: E,
    ) -> JoinHandle<()>
    where
        R: FnOnce(FeedReport) + Send + 'static,
        E: FnOnce(&'static str, String) + Send + 'static,
    {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            match session.load(filter, page).await {
                Ok(LoadOutcome::Published(report)) => on_ready(report),
                Ok(LoadOutcome::Dropped) => {}
                Err(err) => on_error(err.code(), err.to_string()),
            }
        })
    }

    async fn run(&self, filter: FeedFilter, page: Option<PageToken>) -> Result<FeedReport> {
        let shards = self.discover().await?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let timeout = self.config.reconcile.round_timeout();

        let (mut round, commands) = {
            let mut state = self.state.lock().await;
            let state = &mut *state;
            if state.cursors.is_frozen() {
                // we hold the permit, so whoever froze them is gone
                warn!(session = %self.session_id, "reclaiming state of an abandoned round");
                state.reset();
            }
            match page {
                Some(token) => state.cursors.install(token)?,
                None => state.cursors.reset()?,
            }
            state.cursors.freeze();
            state.phase = SessionPhase::FanningOut;

            let mut container =
                FeedContainer::new(self.config.reconcile.container(self.profile.as_ref()));
            container.begin_round();
            state.staging = Some(if state.cursors.is_paging() {
                Staging::Page(container)
            } else {
                Staging::Refresh(container.with_events(self.events.clone()))
            });

            let (round, commands) = Reconciliation::start(
                Arc::clone(&self.profile),
                &filter,
                &shards,
                &state.cursors,
                &self.config.reconcile,
            )?;
            state.phase = round.phase();
            (round, commands)
        };
        self.dispatch(commands, &tx);

        let mut phase = round.phase();
        let deadline = sleep(timeout);
        tokio::pin!(deadline);

        loop {
            let (event, expired) = tokio::select! {
                Some(event) = rx.recv() => (event, false),
                () = &mut deadline => {
                    debug!(%phase, "phase deadline reached");
                    (SessionEvent::Deadline, true)
                }
            };

            let step = {
                let mut state = self.state.lock().await;
                let state = &mut *state;
                let mut ctx = RoundContext {
                    container: state.target(),
                    identities: self.identities.as_ref(),
                };
                let step = round.handle(event, &mut ctx);
                state.phase = round.phase();
                step
            };

            match step {
                Step::Continue(commands) => self.dispatch(commands, &tx),
                Step::Published(summary) => return Ok(self.publish(summary).await),
                Step::Failed(err) => return Err(err),
            }

            if expired || round.phase() != phase {
                phase = round.phase();
                deadline.as_mut().reset(Instant::now() + timeout);
            }
        }
    }

    /// Known shards, refreshing shard state once if none are known.
    async fn discover(&self) -> Result<Vec<ChainId>> {
        let app_name = &self.config.network.app_name;
        let shards = self.processor.collect_chains(app_name).await;
        if !shards.is_empty() {
            return Ok(shards);
        }

        warn!(app = %app_name, "no shards known, requesting state refresh");
        self.processor.request_state();
        let shards = self.processor.collect_chains(app_name).await;
        if shards.is_empty() {
            return Err(FeedError::NoShards(app_name.clone()));
        }
        Ok(shards)
    }

    /// Hand commands to the processor. Dispatch failures come back as events.
    fn dispatch(&self, commands: Vec<Command>, tx: &mpsc::UnboundedSender<SessionEvent>) {
        for command in commands {
            let (chain_id, stage, round, result) = match command {
                Command::Scatter(request) => {
                    let chain_id = request.chain_id;
                    let result = self
                        .processor
                        .scatter(request, ScatterReply::new(chain_id, tx.clone()))
                        .map(|handle| {
                            trace!(
                                chain = %chain_id.short(),
                                handle = handle.0,
                                "scatter dispatched"
                            )
                        });
                    (chain_id, Stage::Scatter, 0, result)
                }
                Command::SelectContent { chain_id, ids, round } => {
                    let reply = ContentReply::new(chain_id, round, tx.clone());
                    let result = self.processor.select_content(chain_id, ids, reply);
                    (chain_id, Stage::Backfill, round, result)
                }
                Command::LoadIdentities { chain_id, ids } => {
                    let result = self
                        .processor
                        .load_transactions(chain_id, ids, IdentityReply::new(chain_id, tx.clone()));
                    (chain_id, Stage::Identity, 0, result)
                }
            };

            if let Err(err) = result {
                // the receiver lives as long as the round loop
                let _ = tx.send(SessionEvent::DispatchFailed {
                    chain_id,
                    stage,
                    round,
                    reason: err.to_string(),
                });
            }
        }
    }

    async fn publish(&self, summary: RoundSummary) -> FeedReport {
        let mut state = self.state.lock().await;
        let appended = match state.staging.take() {
            Some(Staging::Page(page)) => {
                let added = state.primary.absorb(page);
                if added {
                    let _ = self.events.send(FeedEvent::LargeUpdate);
                }
                Some(added)
            }
            Some(Staging::Refresh(fresh)) => {
                let replaced = mem::replace(&mut state.primary, fresh);
                debug!(dropped = replaced.len(), "primary feed replaced");
                let _ = self.events.send(FeedEvent::LargeUpdate);
                None
            }
            None => None,
        };
        state.phase = SessionPhase::Published;

        let feed = state.primary.feed();
        info!(
            session = %self.session_id,
            entries = feed.len(),
            appended = ?appended,
            quorate = summary.quorate,
            "feed published"
        );
        FeedReport {
            session_id: self.session_id.clone(),
            feed,
            appended,
            summary,
        }
    }
}

impl std::fmt::Debug for FeedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedSession")
            .field("session_id", &self.session_id)
            .field("feed", &self.profile.name())
            .field("processing", &self.flight.is_processing())
            .finish()
    }
}
