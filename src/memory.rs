//! The memory store: per-chat tiers, the shared relation graph, persistence and events

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::affect::{AffectEntry, AffectQuery};
use crate::chat::{ChatChange, ChatMemory, MemoryStats};
use crate::config::{Config, MemoryConfig, MemoryConfigPatch};
use crate::consolidation::{self, ConsolidationRun};
use crate::curation::{self, CurateRequest, CuratedEntry, CurationAction, CurationOutcome};
use crate::encoding::EncodingEntry;
use crate::error::{Error, Result};
use crate::events::{Envelope, EventBus, MemoryEvent};
use crate::extract::Extraction;
use crate::graph::{RelatedEntity, RelationGraph};
use crate::lexical::LexicalHit;
use crate::retrieval::{self, RetrievalQuery, RetrievalResult};
use crate::river::{RiverEntry, RiverStats, Role};
use crate::salience::{SalienceEntry, SalienceQuery};
use crate::storage::{RunLog, SqliteStorage};
use crate::types::{ChatId, ConsolidationTrigger, Layer};

/// Where IMPORTANT looks for the text of a message the store has never seen
#[async_trait]
pub trait MessageSource: Send + Sync {
    async fn fetch_content(&self, chat_id: &str, message_id: &str) -> Result<Option<String>>;
}

/// A new conversational turn for L1
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl IngestRequest {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// One chat's state plus the locks that order access to it
#[derive(Default)]
struct ChatSlot {
    /// Held by every mutation; consolidation holds it for the whole run
    gate: Mutex<()>,
    state: RwLock<ChatMemory>,
    consolidating: AtomicBool,
}

/// Clears the consolidating flag however the run ends
struct RunFlag<'a>(&'a AtomicBool);

impl Drop for RunFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owns an in-flight run; a run dropped before `record` is recorded as aborted
struct RunRecorder<'a> {
    store: &'a MemoryStore,
    slot: &'a ChatSlot,
    run: ConsolidationRun,
    recorded: bool,
}

impl RunRecorder<'_> {
    /// Log the run, keep it with the chat and broadcast it
    fn record(&mut self) -> ConsolidationRun {
        self.recorded = true;
        if let Some(log) = &self.store.runs {
            if let Err(e) = log.append(&self.run) {
                warn!(
                    chat_id = %self.run.chat_id,
                    run_id = %self.run.id,
                    error = %e,
                    "run log append failed"
                );
                self.run.errors.push(format!("run log: {e}"));
            }
        }
        self.slot
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .runs
            .push(self.run.clone());
        self.store.events.publish(MemoryEvent::ConsolidationCompleted {
            run: self.run.clone(),
        });
        self.run.clone()
    }
}

impl Drop for RunRecorder<'_> {
    fn drop(&mut self) {
        if !self.recorded {
            self.run.abort();
            warn!(
                chat_id = %self.run.chat_id,
                run_id = %self.run.id,
                promoted = self.run.promoted,
                "consolidation aborted"
            );
            self.record();
        }
    }
}

/// Access to one chat for code that already holds its gate.
///
/// Locks are always taken chat state first, then the graph.
pub(crate) struct ChatHandle<'a> {
    store: &'a MemoryStore,
    chat_id: &'a str,
    slot: &'a ChatSlot,
}

impl ChatHandle<'_> {
    /// Run `f` against a consistent snapshot of the chat and graph
    pub(crate) fn read<T>(&self, f: impl FnOnce(&ChatMemory, &RelationGraph) -> T) -> Result<T> {
        let chat = read_lock(&self.slot.state)?;
        let graph = read_lock(&self.store.graph)?;
        Ok(f(&chat, &graph))
    }

    /// Persist a change and make it visible
    pub(crate) fn commit(&self, change: ChatChange) -> Result<()> {
        if change.is_empty() {
            return Ok(());
        }
        let mut chat = write_lock(&self.slot.state)?;
        let mut graph = write_lock(&self.store.graph)?;
        self.persist(&mut chat, &mut graph, change)
    }

    /// Commit a promotion, merging its extraction into the graph under the graph lock
    pub(crate) fn commit_promotion(
        &self,
        mut change: ChatChange,
        message_id: &str,
        extraction: &Extraction,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut chat = write_lock(&self.slot.state)?;
        let mut graph = write_lock(&self.store.graph)?;
        change.graph = graph.plan(self.chat_id, message_id, extraction, now);
        if change.is_empty() {
            return Ok(());
        }
        self.persist(&mut chat, &mut graph, change)
    }

    fn persist(
        &self,
        chat: &mut ChatMemory,
        graph: &mut RelationGraph,
        change: ChatChange,
    ) -> Result<()> {
        self.store.sqlite.apply_change(self.chat_id, &change)?;
        chat.apply(&change);
        if !change.graph.is_empty() {
            graph.apply(change.graph);
        }
        Ok(())
    }
}

/// The main memory store that coordinates tiers, storage and events
pub struct MemoryStore {
    config: Config,
    sqlite: SqliteStorage,
    /// `None` keeps run records in memory only
    runs: Option<RunLog>,
    chats: RwLock<HashMap<ChatId, Arc<ChatSlot>>>,
    graph: RwLock<RelationGraph>,
    memory_config: RwLock<MemoryConfig>,
    events: EventBus,
    source: Option<Arc<dyn MessageSource>>,
}

impl MemoryStore {
    /// Open the store under `config.data_dir`, hydrating everything persisted there
    pub fn open(config: Config) -> Result<Self> {
        config.ensure_dirs()?;
        let sqlite = SqliteStorage::new(&config)?;
        let runs = RunLog::new(&config)?;
        let history = runs.read_every_chat()?;
        Self::hydrate(config, sqlite, Some(runs), history)
    }

    /// A throwaway store backed by an in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with(Config::default())
    }

    /// In-memory store seeded with the given startup config
    pub fn open_in_memory_with(config: Config) -> Result<Self> {
        let sqlite = SqliteStorage::open_in_memory()?;
        Self::hydrate(config, sqlite, None, HashMap::new())
    }

    fn hydrate(
        config: Config,
        sqlite: SqliteStorage,
        runs: Option<RunLog>,
        history: HashMap<ChatId, Vec<ConsolidationRun>>,
    ) -> Result<Self> {
        let memory_config = match sqlite.load_memory_config()? {
            Some(saved) => saved,
            None => config.memory.clone(),
        };
        memory_config.validate()?;

        let mut chats: HashMap<ChatId, ChatMemory> = HashMap::new();
        for (chat_id, change) in sqlite.load_chats()? {
            chats.entry(chat_id).or_default().apply(&change);
        }
        for (chat_id, chat_runs) in history {
            chats.entry(chat_id).or_default().runs = chat_runs;
        }

        let mut graph = RelationGraph::default();
        graph.apply(sqlite.load_graph()?);

        info!(
            chats = chats.len(),
            entities = graph.entity_count(),
            relations = graph.relation_count(),
            "memory store hydrated"
        );

        let chats = chats
            .into_iter()
            .map(|(id, state)| {
                let slot = ChatSlot {
                    state: RwLock::new(state),
                    ..Default::default()
                };
                (id, Arc::new(slot))
            })
            .collect();

        Ok(Self {
            events: EventBus::new(config.event_capacity),
            config,
            sqlite,
            runs,
            chats: RwLock::new(chats),
            graph: RwLock::new(graph),
            memory_config: RwLock::new(memory_config),
            source: None,
        })
    }

    /// Let IMPORTANT fetch text for messages the store holds no content for
    pub fn with_message_source(mut self, source: Arc<dyn MessageSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Get the startup configuration
    pub fn startup_config(&self) -> &Config {
        &self.config
    }

    /// Ids of every chat the store holds state for, sorted
    pub fn chat_ids(&self) -> Result<Vec<ChatId>> {
        let mut ids: Vec<ChatId> = read_lock(&self.chats)?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn existing_slot(&self, chat_id: &str) -> Result<Option<Arc<ChatSlot>>> {
        Ok(read_lock(&self.chats)?.get(chat_id).cloned())
    }

    fn known_slot(&self, chat_id: &str) -> Result<Arc<ChatSlot>> {
        self.existing_slot(chat_id)?
            .ok_or_else(|| Error::not_found(format!("chat {chat_id:?}")))
    }

    fn slot(&self, chat_id: &str) -> Result<Arc<ChatSlot>> {
        if chat_id.trim().is_empty() {
            return Err(Error::validation("chatId is required"));
        }
        if let Some(slot) = self.existing_slot(chat_id)? {
            return Ok(slot);
        }
        let mut chats = write_lock(&self.chats)?;
        Ok(chats.entry(chat_id.to_string()).or_default().clone())
    }

    fn handle<'a>(&'a self, chat_id: &'a str, slot: &'a ChatSlot) -> ChatHandle<'a> {
        ChatHandle {
            store: self,
            chat_id,
            slot,
        }
    }

    fn snapshot<T>(&self, chat_id: &str, f: impl FnOnce(&ChatMemory) -> T) -> Result<Option<T>> {
        match self.existing_slot(chat_id)? {
            Some(slot) => Ok(Some(f(&*read_lock(&slot.state)?))),
            None => Ok(None),
        }
    }

    // ---- L1 ----

    /// Append a turn to the river. Re-ingesting a known id returns the stored entry.
    pub async fn ingest(&self, chat_id: &str, request: IngestRequest) -> Result<RiverEntry> {
        if request.content.trim().is_empty() {
            return Err(Error::validation("content is required"));
        }
        let slot = self.slot(chat_id)?;
        let _gate = slot.gate.lock().await;
        let handle = self.handle(chat_id, &slot);

        let id = request
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let (existing, muted) =
            handle.read(|chat, _| (chat.river.get(&id).cloned(), chat.is_muted(&id)))?;
        if let Some(existing) = existing {
            debug!(chat_id, message_id = %id, "turn already ingested");
            return Ok(existing);
        }

        let entry = RiverEntry {
            muted,
            ..RiverEntry::new(
                id,
                chat_id,
                request.role.unwrap_or_default(),
                request.content,
                request.timestamp.unwrap_or_else(Utc::now),
            )
        };
        handle.commit(ChatChange {
            river: vec![entry.clone()],
            ..Default::default()
        })?;
        debug!(chat_id, message_id = %entry.id, "turn ingested");
        Ok(entry)
    }

    /// Newest-first river entries, muted ones included
    pub fn river_entries(&self, chat_id: &str, limit: Option<usize>) -> Result<Vec<RiverEntry>> {
        let entries = self.snapshot(chat_id, |chat| {
            chat.river
                .newest_first()
                .into_iter()
                .take(limit.unwrap_or(usize::MAX))
                .cloned()
                .collect()
        })?;
        Ok(entries.unwrap_or_default())
    }

    pub fn river_stats(&self, chat_id: &str) -> Result<RiverStats> {
        self.snapshot(chat_id, |chat| chat.river.stats())?
            .ok_or_else(|| Error::not_found(format!("chat {chat_id:?}")))
    }

    /// Counts per tier, including this chat's share of the graph
    pub fn stats(&self, chat_id: &str) -> Result<MemoryStats> {
        let slot = self.known_slot(chat_id)?;
        let chat = read_lock(&slot.state)?;
        let graph = read_lock(&self.graph)?;
        Ok(chat.stats(graph.chat_counts(chat_id)))
    }

    // ---- Queries ----

    /// Ensemble retrieval; unknown chats yield an empty result
    pub fn retrieve(&self, query: &RetrievalQuery) -> Result<RetrievalResult> {
        let config = self.config()?;
        let resolved = query.resolve(&config)?;
        let Some(slot) = self.existing_slot(&resolved.chat_id)? else {
            return Ok(RetrievalResult::default());
        };
        let chat = read_lock(&slot.state)?;
        let graph = read_lock(&self.graph)?;
        let memories = retrieval::rank(&resolved, &chat, &graph, &config, Utc::now());
        debug!(chat_id = %resolved.chat_id, hits = memories.len(), "retrieved");
        Ok(RetrievalResult { memories })
    }

    /// Keyword search over river and encoded text
    pub fn search_lexical(
        &self,
        chat_id: &str,
        query: &str,
        top_k: Option<usize>,
    ) -> Result<Vec<LexicalHit>> {
        let top_k = match top_k {
            Some(0) => return Err(Error::validation("topK must be at least 1")),
            Some(k) => k,
            None => self.config()?.default_top_k,
        };
        let hits = self.snapshot(chat_id, |chat| {
            chat.lexical
                .search(query, top_k)
                .into_iter()
                .filter(|hit| !chat.is_muted(&hit.message_id))
                .collect()
        })?;
        Ok(hits.unwrap_or_default())
    }

    pub fn affect_entries(&self, chat_id: &str, filter: &AffectQuery) -> Result<Vec<AffectEntry>> {
        self.snapshot(chat_id, |chat| chat.affect.query(filter))?
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    pub fn salience_entries(
        &self,
        chat_id: &str,
        filter: &SalienceQuery,
    ) -> Result<Vec<SalienceEntry>> {
        Ok(self
            .snapshot(chat_id, |chat| chat.salience.query(filter))?
            .unwrap_or_default())
    }

    /// Entities reachable from `value`; `hops` defaults to the configured limit
    pub fn related_entities(
        &self,
        value: &str,
        chat_id: Option<&str>,
        hops: Option<usize>,
    ) -> Result<Vec<RelatedEntity>> {
        let hops = match hops {
            Some(h) => h,
            None => self.config()?.graph_hop_limit,
        };
        read_lock(&self.graph)?.related(value, chat_id, hops)
    }

    // ---- Curation ----

    /// Validate and apply one curation request
    pub async fn curate(&self, request: CurateRequest) -> Result<CurationOutcome> {
        let action = request.validate()?;
        let (chat_id, message_id) = (request.chat_id.as_str(), request.message_id.as_str());
        debug!(chat_id, message_id, action = action.name(), "curate");

        match action {
            CurationAction::Pin { content } => {
                let entry = self.pin(chat_id, message_id, &content).await?;
                Ok(CurationOutcome::entry(CuratedEntry::Salience(entry)))
            }
            CurationAction::Important { factor } => {
                let entry = self.important(chat_id, message_id, factor).await?;
                Ok(CurationOutcome::entry(CuratedEntry::Encoding(entry)))
            }
            CurationAction::Mute => {
                let layers = self.mute(chat_id, message_id).await?;
                Ok(CurationOutcome::layers(layers))
            }
            CurationAction::AffectTag {
                tag,
                intensity,
                reason,
            } => {
                let entry = self
                    .affect_tag(chat_id, message_id, &tag, intensity, reason)
                    .await?;
                Ok(CurationOutcome::entry(CuratedEntry::Affect(entry)))
            }
        }
    }

    /// Pin a message into L4 with caller-supplied content
    pub async fn pin(
        &self,
        chat_id: &str,
        message_id: &str,
        content: &str,
    ) -> Result<SalienceEntry> {
        require_message(message_id)?;
        curation::require_pin_content(content)?;
        let slot = self.slot(chat_id)?;
        let _gate = slot.gate.lock().await;
        let handle = self.handle(chat_id, &slot);

        let (change, entry) = handle
            .read(|chat, _| curation::plan_pin(chat, chat_id, message_id, content, Utc::now()))??;
        handle.commit(change)?;

        info!(chat_id, message_id, entry_id = %entry.id, "pin applied");
        self.events.publish(MemoryEvent::PinApplied {
            chat_id: chat_id.to_string(),
            message_id: message_id.to_string(),
            entry_id: entry.id,
        });
        Ok(entry)
    }

    /// Boost a message's encoding; `factor` defaults to the configured boost factor
    pub async fn important(
        &self,
        chat_id: &str,
        message_id: &str,
        factor: Option<f64>,
    ) -> Result<EncodingEntry> {
        require_message(message_id)?;
        let config = self.config()?;
        let factor = factor.unwrap_or(config.default_boost_factor);
        curation::require_boost_factor(factor)?;

        // an unknown chat is only created once the source proves the message exists
        let (slot, mut fallback) = match (self.existing_slot(chat_id)?, &self.source) {
            (Some(slot), _) => (slot, None),
            (None, Some(source)) => {
                let content = self
                    .fetch_from_source(source.as_ref(), chat_id, message_id)
                    .await?;
                (self.slot(chat_id)?, Some(content))
            }
            (None, None) => return Err(Error::not_found(format!("chat {chat_id:?}"))),
        };
        let _gate = slot.gate.lock().await;
        let handle = self.handle(chat_id, &slot);

        let unknown_locally = handle.read(|chat, _| {
            chat.encoding.by_source(message_id).is_none()
                && curation::local_content(chat, message_id).is_none()
        })?;
        let ask_source = unknown_locally && fallback.is_none();
        if let Some(source) = self.source.as_ref().filter(|_| ask_source) {
            fallback = source.fetch_content(chat_id, message_id).await?;
        }

        let (change, entry) = handle.read(|chat, _| {
            curation::plan_important(
                chat,
                chat_id,
                message_id,
                factor,
                fallback,
                &config,
                Utc::now(),
            )
        })??;
        handle.commit(change)?;

        info!(
            chat_id,
            message_id,
            factor,
            strength = entry.encoding_strength,
            "message boosted"
        );
        self.events.publish(MemoryEvent::MessageBoosted {
            chat_id: chat_id.to_string(),
            message_id: message_id.to_string(),
            encoding_strength: entry.encoding_strength,
        });
        Ok(entry)
    }

    async fn fetch_from_source(
        &self,
        source: &dyn MessageSource,
        chat_id: &str,
        message_id: &str,
    ) -> Result<String> {
        if chat_id.trim().is_empty() {
            return Err(Error::validation("chatId is required"));
        }
        source
            .fetch_content(chat_id, message_id)
            .await?
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| {
                Error::not_found(format!("no encodable content for message {message_id}"))
            })
    }

    /// Suppress a message across L1, L3 and L4; returns the layers that changed
    pub async fn mute(&self, chat_id: &str, message_id: &str) -> Result<Vec<Layer>> {
        require_message(message_id)?;
        let slot = self.slot(chat_id)?;
        let _gate = slot.gate.lock().await;
        let handle = self.handle(chat_id, &slot);

        let (change, layers) = handle.read(|chat, _| curation::plan_mute(chat, message_id))?;
        handle.commit(change)?;

        info!(chat_id, message_id, layers = ?layers, "message muted");
        self.events.publish(MemoryEvent::MessageMuted {
            chat_id: chat_id.to_string(),
            message_id: message_id.to_string(),
            affected_layers: layers.clone(),
        });
        Ok(layers)
    }

    /// Append an affect annotation to L2
    pub async fn affect_tag(
        &self,
        chat_id: &str,
        message_id: &str,
        tag: &str,
        intensity: f64,
        reason: Option<String>,
    ) -> Result<AffectEntry> {
        require_message(message_id)?;
        let (change, entry) =
            curation::plan_affect_tag(chat_id, message_id, tag, intensity, reason)?;
        let slot = self.slot(chat_id)?;
        let _gate = slot.gate.lock().await;
        self.handle(chat_id, &slot).commit(change)?;

        info!(chat_id, message_id, tag = %entry.tag, intensity, "affect tag added");
        self.events.publish(MemoryEvent::AffectTagged {
            chat_id: chat_id.to_string(),
            message_id: message_id.to_string(),
            tag: entry.tag.clone(),
            intensity: entry.intensity,
        });
        Ok(entry)
    }

    // ---- Consolidation ----

    pub async fn consolidate(
        &self,
        chat_id: &str,
        trigger: ConsolidationTrigger,
    ) -> Result<ConsolidationRun> {
        self.consolidate_with_cancel(chat_id, trigger, CancellationToken::new())
            .await
    }

    /// Run consolidation, stopping between entries once `cancel` fires.
    ///
    /// Fails with CONFLICT while another run for the same chat is in flight.
    /// A run whose future is dropped part way is still recorded and broadcast,
    /// with `aborted` in its errors.
    pub async fn consolidate_with_cancel(
        &self,
        chat_id: &str,
        trigger: ConsolidationTrigger,
        cancel: CancellationToken,
    ) -> Result<ConsolidationRun> {
        let slot = self.known_slot(chat_id)?;
        if slot.consolidating.swap(true, Ordering::AcqRel) {
            return Err(Error::conflict(format!(
                "consolidation already running for chat {chat_id:?}"
            )));
        }
        let _flag = RunFlag(&slot.consolidating);
        let _gate = slot.gate.lock().await;

        let config = self.config()?;
        let mut recorder = RunRecorder {
            store: self,
            slot: &slot,
            run: ConsolidationRun::start(chat_id, trigger),
            recorded: false,
        };
        let handle = self.handle(chat_id, &slot);
        if let Err(e) = consolidation::execute(&handle, &mut recorder.run, &config, &cancel).await {
            recorder.run.errors.push(e.to_string());
            return Err(e);
        }
        Ok(recorder.record())
    }

    /// Finalized runs for a chat, newest first
    pub fn consolidation_runs(
        &self,
        chat_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ConsolidationRun>> {
        let runs = self.snapshot(chat_id, |chat| {
            chat.runs
                .iter()
                .rev()
                .take(limit.unwrap_or(usize::MAX))
                .cloned()
                .collect()
        })?;
        Ok(runs.unwrap_or_default())
    }

    // ---- Config & events ----

    /// The current runtime config
    pub fn config(&self) -> Result<MemoryConfig> {
        Ok(read_lock(&self.memory_config)?.clone())
    }

    /// Merge a partial JSON patch into the config, persist it, then broadcast it
    pub fn update_config(&self, patch: serde_json::Value) -> Result<MemoryConfig> {
        let patch = MemoryConfigPatch::from_json(patch)?;
        let next = {
            let mut current = write_lock(&self.memory_config)?;
            let next = current.merged(patch)?;
            self.sqlite.save_memory_config(&next)?;
            *current = next.clone();
            next
        };

        info!("memory config updated");
        self.events.publish(MemoryEvent::ConfigUpdated {
            config: next.clone(),
        });
        Ok(next)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.events.subscribe()
    }
}

fn require_message(message_id: &str) -> Result<()> {
    if message_id.trim().is_empty() {
        return Err(Error::validation("messageId is required"));
    }
    Ok(())
}

fn read_lock<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|e| Error::internal(e.to_string()))
}

fn write_lock<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|e| Error::internal(e.to_string()))
}
