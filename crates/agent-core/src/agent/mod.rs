//! Agent control core: one instance per character identity. Owns the
//! conversation history, command registry, execution engine, self-prompt
//! loop, and mode supervisor, and orchestrates them from a single event
//! loop fed by the world connection.

pub mod coder;
pub mod commands;
pub mod history;
pub mod modes;
pub mod script;
pub mod self_prompter;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::llm::ChatModel;
use crate::store::{MemorySnapshot, MemoryStore};
use crate::translate::Translator;
use crate::world::{NameCatalog, Position, WorldApi, WorldEvent};

pub use coder::{Coder, ExecResult};
pub use commands::{CommandError, CommandRegistry};
pub use history::{History, Speaker, Turn};
pub use modes::ModeSupervisor;
pub use self_prompter::SelfPrompter;

/// Server housekeeping lines that should never reach the model.
const IGNORE_PREFIXES: [&str; 6] = [
    "Set own game mode to",
    "Set the time to",
    "Set the difficulty to",
    "Teleported ",
    "Set the weather to",
    "Gamerule ",
];

/// Character budget for the "recent behaviors" system note.
const MAX_BEHAVIOR_LOG: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// `!restart` or another deliberate restart request.
    Requested,
    /// Known world-state inconsistency repaired by a supervised restart.
    ForcedRestartRecovery,
    /// Kick, disconnect, or a closed world connection.
    FatalWorldEvent,
    /// A collaborator failure propagated out of the message loop.
    Crashed,
}

#[derive(Debug, Clone)]
pub struct Shutdown {
    pub reason: ShutdownReason,
    pub message: String,
}

pub struct Collaborators {
    pub world: Arc<dyn WorldApi>,
    pub model: Arc<dyn ChatModel>,
    pub translator: Arc<dyn Translator>,
    pub store: Arc<dyn MemoryStore>,
    pub catalog: Arc<dyn NameCatalog>,
}

#[derive(Debug)]
struct Vitals {
    health: f64,
    food: f64,
    last_damage: Option<Instant>,
    last_damage_taken: f64,
}

impl Default for Vitals {
    fn default() -> Self {
        // Assume full until the first health event says otherwise.
        Self {
            health: 20.0,
            food: 20.0,
            last_damage: None,
            last_damage_taken: 0.0,
        }
    }
}

pub struct Agent {
    pub name: String,
    pub settings: Settings,
    pub registry: CommandRegistry,
    pub world: Arc<dyn WorldApi>,
    pub model: Arc<dyn ChatModel>,
    pub translator: Arc<dyn Translator>,
    pub store: Arc<dyn MemoryStore>,
    pub catalog: Arc<dyn NameCatalog>,
    pub history: tokio::sync::Mutex<History>,
    pub coder: Arc<Coder>,
    pub self_prompter: Arc<SelfPrompter>,
    pub modes: Arc<ModeSupervisor>,
    pub places: StdMutex<BTreeMap<String, Position>>,
    quiet: AtomicBool,
    vitals: StdMutex<Vitals>,
    halt: CancellationToken,
    halt_reason: StdMutex<Option<Shutdown>>,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        settings: Settings,
        collaborators: Collaborators,
    ) -> Result<Arc<Self>, CommandError> {
        let registry = commands::default_registry()?;
        Ok(Self::with_registry(name, settings, collaborators, registry))
    }

    pub fn with_registry(
        name: impl Into<String>,
        settings: Settings,
        collaborators: Collaborators,
        registry: CommandRegistry,
    ) -> Arc<Self> {
        let history = History::new(settings.max_messages);
        Arc::new(Self {
            name: name.into(),
            settings,
            registry,
            world: collaborators.world,
            model: collaborators.model,
            translator: collaborators.translator,
            store: collaborators.store,
            catalog: collaborators.catalog,
            history: tokio::sync::Mutex::new(history),
            coder: Arc::new(Coder::new()),
            self_prompter: Arc::new(SelfPrompter::new()),
            modes: Arc::new(ModeSupervisor::default()),
            places: StdMutex::new(BTreeMap::new()),
            quiet: AtomicBool::new(false),
            vitals: StdMutex::new(Vitals::default()),
            halt: CancellationToken::new(),
            halt_reason: StdMutex::new(None),
        })
    }

    pub fn is_idle(&self) -> bool {
        self.coder.is_idle()
    }

    pub fn recently_damaged(&self, window: Duration) -> bool {
        self.vitals
            .lock()
            .unwrap()
            .last_damage
            .map(|at| at.elapsed() <= window)
            .unwrap_or(false)
    }

    pub fn last_damage_taken(&self) -> f64 {
        self.vitals.lock().unwrap().last_damage_taken
    }

    /// Hunger as of the last health event.
    pub fn current_food(&self) -> f64 {
        self.vitals.lock().unwrap().food
    }

    /// Silences chatting and self-prompting; the current action keeps going.
    /// Deactivating the goal happens in the background because its loop may
    /// be blocked inside the very action we are leaving alone.
    pub fn shut_up(self: &Arc<Self>) {
        self.quiet.store(true, Ordering::SeqCst);
        if self.self_prompter.is_on() {
            let agent = self.clone();
            tokio::spawn(async move { agent.self_prompter.stop(&agent, false).await });
        }
    }

    /// Translates and relays text through the single chat primitive.
    pub async fn clean_chat(&self, message: &str) -> anyhow::Result<()> {
        self.clean_chat_up_to(message, None).await
    }

    /// Like [`clean_chat`](Self::clean_chat), but only translates the prefix
    /// before `translate_up_to`, leaving the rest (a command invocation)
    /// verbatim.
    async fn clean_chat_up_to(
        &self,
        message: &str,
        translate_up_to: Option<usize>,
    ) -> anyhow::Result<()> {
        let (to_translate, remainder) = match translate_up_to {
            Some(i) if i <= message.len() && message.is_char_boundary(i) => message.split_at(i),
            _ => (message, ""),
        };
        let translated = self.translator.translate(to_translate).await?;
        let full = format!("{} {remainder}", translated.trim());
        // Newlines read as separate chat lines and trip spam filters.
        let single_line = full.trim().replace('\n', " ");
        self.world.chat(&single_line).await
    }

    pub async fn save_history(&self) {
        let snapshot = MemorySnapshot {
            turns: self.history.lock().await.turns(),
            self_prompt: self.self_prompter.active_prompt(),
        };
        if let Err(err) = self.store.save(&snapshot) {
            tracing::error!("failed to persist history: {err:#}");
        }
    }

    /// Persists state, says goodbye, and asks the event loop to terminate.
    /// The process supervisor decides whether to respawn.
    pub async fn clean_kill(self: &Arc<Self>, reason: ShutdownReason, message: &str) {
        self.history
            .lock()
            .await
            .append(Speaker::System, message);
        self.save_history().await;
        let _ = self.world.chat("Goodbye world.").await;
        self.halt(reason, message);
    }

    pub fn halt(&self, reason: ShutdownReason, message: impl Into<String>) {
        let mut slot = self.halt_reason.lock().unwrap();
        if slot.is_none() {
            *slot = Some(Shutdown {
                reason,
                message: message.into(),
            });
        }
        drop(slot);
        self.halt.cancel();
    }

    /// Consumes one input turn: either dispatches a user command directly, or
    /// runs the conversational loop, executing at most the budgeted number of
    /// model-chosen commands. Returns whether any command was executed.
    pub async fn handle_message(
        self: &Arc<Self>,
        source: Speaker,
        message: &str,
        max_responses: Option<i64>,
    ) -> anyhow::Result<bool> {
        let mut used_command = false;
        let self_prompt = source.is_self_or_system();

        if !self_prompt {
            if let Some(name) = commands::find_command(message).map(str::to_string) {
                if !self.registry.exists(&name) {
                    self.world
                        .chat(&format!("Command '{name}' does not exist."))
                        .await?;
                    return Ok(false);
                }
                self.clean_chat(&format!("*{source} used {}*", &name[1..]))
                    .await?;
                if name == "!newAction" {
                    // The only user command that needs the triggering message
                    // in history, as context for generation.
                    self.history.lock().await.append(source.clone(), message);
                }
                if let Some(text) = commands::execute_command(self, message).await {
                    self.clean_chat(&text).await?;
                }
                return Ok(true);
            }
        }

        let check_interrupt = || {
            self.self_prompter.should_interrupt(self_prompt) || self.quiet.load(Ordering::SeqCst)
        };

        {
            let mut history = self.history.lock().await;
            let behavior_log = self.modes.flush_behavior_log();
            if !behavior_log.trim().is_empty() {
                history.append(
                    Speaker::System,
                    format!(
                        "Recent behaviors log: {}",
                        clip_to_recent_lines(&behavior_log, MAX_BEHAVIOR_LOG)
                    ),
                );
            }
            history.append(source.clone(), message);
        }
        self.save_history().await;

        let mut budget = max_responses.unwrap_or(self.settings.max_commands);
        if !self_prompt && self.self_prompter.is_on() {
            // One reply, then the self-prompt loop regains control.
            budget = 1;
        }

        let mut taken: i64 = 0;
        loop {
            if budget >= 0 && taken >= budget {
                break;
            }
            taken += 1;
            if check_interrupt() {
                break;
            }

            let turns = self.history.lock().await.turns();
            let reply = self.model.prompt_conversation(turns).await?;

            if let Some(name) = commands::find_command(&reply).map(str::to_string) {
                let reply = commands::truncate_after_command(&reply);
                self.history
                    .lock()
                    .await
                    .append(Speaker::Agent, reply.clone());

                if !self.registry.exists(&name) {
                    tracing::warn!(command = %name, "model hallucinated a command");
                    self.history
                        .lock()
                        .await
                        .append(Speaker::System, format!("Command {name} does not exist."));
                    continue;
                }
                if name == "!endGoal" && self_prompt {
                    // Self-prompt loops may not stop themselves.
                    self.history.lock().await.append(
                        Speaker::System,
                        "Cannot end goal unless requested by user.",
                    );
                    continue;
                }
                if check_interrupt() {
                    break;
                }
                self.self_prompter
                    .handle_user_prompted_cmd(self_prompt, self.registry.is_action(&name));

                if self.settings.verbose_commands {
                    self.clean_chat_up_to(&reply, reply.find(&name)).await?;
                } else {
                    let cut = reply.find(&name).unwrap_or(0);
                    let pre = reply[..cut].trim();
                    let note = if pre.is_empty() {
                        format!("*used {}*", &name[1..])
                    } else {
                        format!("{pre}  *used {}*", &name[1..])
                    };
                    self.clean_chat(&note).await?;
                }

                let result = commands::execute_command(self, &reply).await;
                tracing::info!(command = %name, result = ?result, "executed command");
                used_command = true;

                match result {
                    Some(out) if !out.is_empty() => {
                        self.history.lock().await.append(Speaker::System, out);
                    }
                    // An empty result ends the turn.
                    _ => break,
                }
            } else {
                self.history
                    .lock()
                    .await
                    .append(Speaker::Agent, reply.clone());
                self.clean_chat(&reply).await?;
                break;
            }
            self.save_history().await;
        }

        self.world.finished_executing().await;
        Ok(used_command)
    }

    /// Top-level event loop; returns once a shutdown was requested. Any
    /// shutdown surfaces as an error so the process exits nonzero and the
    /// supervisor can decide about a respawn.
    pub async fn run(self: &Arc<Self>, mut events: mpsc::Receiver<WorldEvent>) -> anyhow::Result<()> {
        let snapshot = if self.settings.load_memory {
            self.store.load().unwrap_or_else(|err| {
                tracing::warn!("failed to load memory snapshot: {err:#}");
                None
            })
        } else {
            None
        };
        if let Some(snapshot) = &snapshot {
            self.history.lock().await.restore(snapshot.turns.clone());
        }

        let mut spawned = false;
        loop {
            let event = tokio::select! {
                _ = self.halt.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => {
                        self.clean_kill(
                            ShutdownReason::FatalWorldEvent,
                            "World connection closed! Shutting down.",
                        )
                        .await;
                        break;
                    }
                },
            };

            match event {
                WorldEvent::Spawn => {
                    if spawned {
                        continue;
                    }
                    spawned = true;
                    tracing::info!(name = %self.name, "spawned");
                    self.coder.clear();

                    let agent = self.clone();
                    tokio::spawn(async move { agent.run_supervisor_loop().await });

                    let agent = self.clone();
                    let resume_prompt = snapshot.as_ref().and_then(|s| s.self_prompt.clone());
                    tokio::spawn(async move { agent.on_spawned(resume_prompt).await });
                }
                WorldEvent::Chat { from, text } => {
                    if self.settings.profiles.len() <= 1 {
                        self.intake_chat(from, text);
                    }
                }
                WorldEvent::Whisper { from, text } => {
                    // With multiple identities in the world, open chat would
                    // echo between them; whispers only.
                    if self.settings.profiles.len() > 1 {
                        self.intake_chat(from, text);
                    }
                }
                WorldEvent::Health { health, food } => self.note_vitals(health, food),
                WorldEvent::Death { message } => {
                    self.coder.cancel_resume();
                    self.coder.stop().await;
                    let agent = self.clone();
                    tokio::spawn(async move {
                        let note = format!(
                            "You died with the final message: '{message}'. Previous actions were stopped and you have respawned. Notify the user and perform any necessary actions."
                        );
                        if let Err(err) = agent.handle_message(Speaker::System, &note, None).await {
                            agent.halt(ShutdownReason::Crashed, format!("{err:#}"));
                        }
                    });
                }
                WorldEvent::Idle => {
                    self.modes.unpause_all();
                    self.coder.unpause();
                    let agent = self.clone();
                    tokio::spawn(async move {
                        if let Some(result) = agent.coder.resume_from_idle().await {
                            tracing::debug!(?result, "resumed action after idle signal");
                        }
                    });
                }
                WorldEvent::Time { time_of_day } => {
                    tracing::trace!(time_of_day, "world time");
                }
                WorldEvent::Kicked { reason } => {
                    self.clean_kill(
                        ShutdownReason::FatalWorldEvent,
                        &format!("Kicked from the world: {reason}. Shutting down."),
                    )
                    .await;
                    break;
                }
                WorldEvent::Disconnected { reason } => {
                    self.clean_kill(
                        ShutdownReason::FatalWorldEvent,
                        &format!("Disconnected from the world: {reason}. Shutting down."),
                    )
                    .await;
                    break;
                }
                WorldEvent::Custom { text } => {
                    let agent = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = agent.handle_message(Speaker::System, &text, None).await {
                            agent.halt(ShutdownReason::Crashed, format!("{err:#}"));
                        }
                    });
                }
            }
        }

        let shutdown = self.halt_reason.lock().unwrap().clone();
        match shutdown {
            Some(shutdown) => Err(anyhow::anyhow!("agent terminated: {}", shutdown.message)),
            None => Ok(()),
        }
    }

    fn intake_chat(self: &Arc<Self>, from: String, text: String) {
        if from == self.name {
            return;
        }
        if IGNORE_PREFIXES.iter().any(|p| text.starts_with(p)) {
            return;
        }
        self.quiet.store(false, Ordering::SeqCst);
        let agent = self.clone();
        tokio::spawn(async move {
            let translated = match agent.translator.translate(&text).await {
                Ok(translated) => translated,
                Err(err) => {
                    tracing::warn!("inbound translation failed: {err:#}");
                    text
                }
            };
            tracing::info!(%from, message = %translated, "received message");
            if let Err(err) = agent
                .handle_message(Speaker::Player(from), &translated, None)
                .await
            {
                agent.halt(ShutdownReason::Crashed, format!("{err:#}"));
            }
        });
    }

    async fn on_spawned(self: &Arc<Self>, resume_prompt: Option<String>) {
        if let Some(prompt) = resume_prompt {
            self.history
                .lock()
                .await
                .append(Speaker::System, prompt.clone());
            self.self_prompter.start(self, &prompt);
        } else if let Some(init) = self.settings.init_message.clone() {
            if let Err(err) = self.handle_message(Speaker::System, &init, Some(2)).await {
                self.halt(ShutdownReason::Crashed, format!("{err:#}"));
            }
        } else {
            let _ = self
                .clean_chat(&format!("Hello world! I am {}", self.name))
                .await;
            self.world.finished_executing().await;
        }
    }

    /// Fixed-period supervisor tick. Each cycle performs exactly one pass no
    /// matter how long the previous pass took, then sleeps only the leftover
    /// budget so slow passes don't compound into drift.
    async fn run_supervisor_loop(self: &Arc<Self>) {
        let mut last = Instant::now();
        loop {
            if self.halt.is_cancelled() {
                break;
            }
            let start = Instant::now();
            let delta = start.duration_since(last);

            self.modes.update(self).await;
            self.self_prompter.update(self, delta);

            if let Some(remaining) = modes::remaining_budget(modes::TICK_PERIOD, start.elapsed()) {
                tokio::time::sleep(remaining).await;
            }
            last = start;
        }
    }

    fn note_vitals(&self, health: f64, food: f64) {
        let mut vitals = self.vitals.lock().unwrap();
        if health < vitals.health {
            vitals.last_damage = Some(Instant::now());
            vitals.last_damage_taken = vitals.health - health;
        }
        vitals.health = health;
        vitals.food = food;
    }
}

/// Keeps only the tail of `log` up to `max` bytes, trimmed to whole lines.
/// Behavior-log entries are newline-led, so an untruncated log passes
/// through intact.
fn clip_to_recent_lines(log: &str, max: usize) -> String {
    if log.len() <= max {
        return log.to_string();
    }
    let mut cut = log.len() - max;
    while !log.is_char_boundary(cut) {
        cut += 1;
    }
    let tail = &log[cut..];
    let from_line = tail.find('\n').map(|i| &tail[i..]).unwrap_or("");
    format!("...{from_line}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::world::WorldStats;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeWorld {
        chats: StdMutex<Vec<String>>,
        go_to_player_calls: StdMutex<Vec<(String, f64)>>,
    }

    impl FakeWorld {
        fn chats(&self) -> Vec<String> {
            self.chats.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WorldApi for FakeWorld {
        async fn chat(&self, text: &str) -> anyhow::Result<()> {
            self.chats.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn stats(&self) -> anyhow::Result<WorldStats> {
            Ok(WorldStats {
                health: 20.0,
                food: 20.0,
                ..WorldStats::default()
            })
        }

        async fn go_to_player(&self, name: &str, closeness: f64) -> anyhow::Result<String> {
            self.go_to_player_calls
                .lock()
                .unwrap()
                .push((name.to_string(), closeness));
            Ok(format!("You have reached {name}."))
        }
    }

    #[derive(Default)]
    struct FakeModel {
        responses: StdMutex<VecDeque<String>>,
        calls: AtomicUsize,
    }

    impl FakeModel {
        fn push_response(&self, raw: impl Into<String>) {
            self.responses.lock().unwrap().push_back(raw.into());
        }
    }

    impl ChatModel for FakeModel {
        fn prompt_conversation<'a>(
            &'a self,
            _history: Vec<Turn>,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.responses
                    .lock()
                    .unwrap()
                    .pop_front()
                    .ok_or_else(|| anyhow::anyhow!("no model response queued"))
            })
        }
    }

    #[derive(Default)]
    struct MemStore {
        saved: StdMutex<Option<MemorySnapshot>>,
    }

    impl MemoryStore for MemStore {
        fn save(&self, snapshot: &MemorySnapshot) -> anyhow::Result<()> {
            *self.saved.lock().unwrap() = Some(snapshot.clone());
            Ok(())
        }

        fn load(&self) -> anyhow::Result<Option<MemorySnapshot>> {
            Ok(self.saved.lock().unwrap().clone())
        }
    }

    struct Fixture {
        agent: Arc<Agent>,
        world: Arc<FakeWorld>,
        model: Arc<FakeModel>,
    }

    fn fixture_with(settings: Settings, extra: Option<commands::CommandSpec>) -> Fixture {
        let world = Arc::new(FakeWorld::default());
        let model = Arc::new(FakeModel::default());
        let mut registry = commands::default_registry().unwrap();
        if let Some(spec) = extra {
            registry.register(spec).unwrap();
        }
        let agent = Agent::with_registry(
            "ember",
            settings,
            Collaborators {
                world: world.clone(),
                model: model.clone(),
                translator: Arc::new(crate::translate::Identity),
                store: Arc::new(MemStore::default()),
                catalog: Arc::new(crate::world::StaticCatalog::default()),
            },
            registry,
        );
        Fixture {
            agent,
            world,
            model,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Settings::default(), None)
    }

    #[tokio::test]
    async fn unknown_user_command_gets_an_error_reply() {
        let f = fixture();
        let used = f
            .agent
            .handle_message(Speaker::Player("steve".into()), "!fly", None)
            .await
            .unwrap();
        assert!(!used);
        assert_eq!(f.world.chats(), vec!["Command '!fly' does not exist."]);
    }

    #[tokio::test]
    async fn user_command_is_announced_executed_and_relayed() {
        let f = fixture();
        // Negative closeness is sign-normalized before dispatch.
        let used = f
            .agent
            .handle_message(
                Speaker::Player("steve".into()),
                "come here !goToPlayer(Steve, -5)",
                None,
            )
            .await
            .unwrap();
        assert!(used);

        let calls = f.world.go_to_player_calls.lock().unwrap().clone();
        assert_eq!(calls, vec![("Steve".to_string(), 5.0)]);

        let chats = f.world.chats();
        assert_eq!(chats[0], "*steve used goToPlayer*");
        assert_eq!(chats[1], "You have reached Steve.");
        // User commands bypass the model entirely.
        assert_eq!(f.model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn conversational_reply_is_relayed_and_ends_the_turn() {
        let f = fixture();
        f.model.push_response("Nice to meet you!");
        let used = f
            .agent
            .handle_message(Speaker::Player("steve".into()), "hello", None)
            .await
            .unwrap();
        assert!(!used);
        assert_eq!(f.world.chats(), vec!["Nice to meet you!"]);

        let turns = f.agent.history.lock().await.turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].speaker, Speaker::Player("steve".into()));
        assert_eq!(turns[1].speaker, Speaker::Agent);
    }

    #[tokio::test]
    async fn hallucinated_command_notes_history_and_continues() {
        let f = fixture();
        f.model.push_response("I'll just !teleportHome now");
        f.model.push_response("Never mind, walking it is.");
        let used = f
            .agent
            .handle_message(Speaker::Player("steve".into()), "go home", None)
            .await
            .unwrap();
        assert!(!used);
        assert_eq!(f.model.calls.load(Ordering::SeqCst), 2);

        let turns = f.agent.history.lock().await.turns();
        assert!(turns
            .iter()
            .any(|t| t.speaker == Speaker::System
                && t.content == "Command !teleportHome does not exist."));
        // The hallucinated reply was truncated after the command token.
        assert!(turns
            .iter()
            .any(|t| t.speaker == Speaker::Agent && t.content == "I'll just !teleportHome"));
        assert_eq!(f.world.chats(), vec!["Never mind, walking it is."]);
    }

    #[tokio::test]
    async fn empty_command_result_ends_the_loop_on_the_third_pass() {
        let lap_counter = Arc::new(AtomicUsize::new(0));
        let laps = lap_counter.clone();
        let spec = commands::CommandSpec {
            name: "!lap",
            description: "test lap",
            params: vec![],
            format: None,
            action: true,
            handler: Arc::new(move |_agent, _args| {
                let laps = laps.clone();
                Box::pin(async move {
                    let n = laps.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Ok(Some(format!("lap {n} done")))
                    } else {
                        Ok(None)
                    }
                })
            }),
        };
        let f = fixture_with(Settings::default(), Some(spec));
        for _ in 0..3 {
            f.model.push_response("!lap");
        }

        // Budget of five, but the empty result on the third pass ends it.
        let used = f
            .agent
            .handle_message(Speaker::Player("steve".into()), "run laps", Some(5))
            .await
            .unwrap();
        assert!(used);
        assert_eq!(lap_counter.load(Ordering::SeqCst), 3);
        assert_eq!(f.model.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn self_prompt_turns_cannot_end_the_goal() {
        let f = fixture();
        f.model.push_response("!endGoal");
        f.model.push_response("Back to work then.");
        let used = f
            .agent
            .handle_message(Speaker::System, "keep working on the goal", None)
            .await
            .unwrap();
        assert!(!used);

        let turns = f.agent.history.lock().await.turns();
        assert!(turns
            .iter()
            .any(|t| t.content == "Cannot end goal unless requested by user."));
        // The refused command was never executed.
        assert!(!turns.iter().any(|t| t.content == "Self-prompting stopped."));
    }

    #[tokio::test]
    async fn user_turns_can_end_the_goal() {
        let f = fixture();
        f.model.push_response("Okay! !endGoal");
        let used = f
            .agent
            .handle_message(Speaker::Player("steve".into()), "stop your goal", Some(1))
            .await
            .unwrap();
        assert!(used);
        let turns = f.agent.history.lock().await.turns();
        assert!(turns.iter().any(|t| t.content == "Self-prompting stopped."));
    }

    #[tokio::test]
    async fn silenced_agent_generates_nothing() {
        let f = fixture();
        f.agent.shut_up();
        let used = f
            .agent
            .handle_message(Speaker::System, "say something", None)
            .await
            .unwrap();
        assert!(!used);
        assert!(f.world.chats().is_empty());
        assert_eq!(f.model.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resumed_goal_aborts_after_three_commandless_cycles() {
        let f = fixture();
        f.model.push_response("thinking about it");
        f.model.push_response("still thinking");
        f.model.push_response("hmm");

        f.agent.on_spawned(Some("build a shelter".to_string())).await;
        assert!(f.agent.self_prompter.is_on());

        // Let the loop burn through its three commandless cycles.
        for _ in 0..50 {
            if !f.agent.self_prompter.is_on() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(!f.agent.self_prompter.is_on());
        assert!(f
            .world
            .chats()
            .iter()
            .any(|c| c.contains("Aborting self-prompting")));
    }

    #[tokio::test]
    async fn init_message_drives_the_first_turn() {
        let settings = Settings {
            init_message: Some("Introduce yourself.".to_string()),
            ..Settings::default()
        };
        let f = fixture_with(settings, None);
        f.model.push_response("Hi, I'm ember!");
        f.agent.on_spawned(None).await;
        assert_eq!(f.world.chats(), vec!["Hi, I'm ember!"]);
    }

    #[tokio::test]
    async fn spawn_without_memory_or_init_says_hello() {
        let f = fixture();
        f.agent.on_spawned(None).await;
        assert_eq!(f.world.chats(), vec!["Hello world! I am ember"]);
    }

    #[test]
    fn behavior_log_clips_to_whole_recent_lines() {
        let short = "\nPicked up 2 item(s).";
        assert_eq!(clip_to_recent_lines(short, 500), short);

        let mut long = String::new();
        for i in 0..100 {
            long.push_str(&format!("\nbehavior line number {i}"));
        }
        let clipped = clip_to_recent_lines(&long, 120);
        assert!(clipped.starts_with("..."));
        assert!(clipped.len() <= 130);
        // No partial line survives the cut.
        assert!(clipped[3..].starts_with('\n'));
        assert!(clipped.ends_with("behavior line number 99"));
    }
}
