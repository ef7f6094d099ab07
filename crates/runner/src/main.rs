//! Runner: without `ROAMBOT_PROFILE` set it acts as the process supervisor,
//! spawning one child process per configured character identity and applying
//! the crash-loop restart policy. With `ROAMBOT_PROFILE` set (by the
//! supervisor or by hand) it runs a single agent against a remote world
//! connection speaking JSON lines over TCP.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};

use roambot_core::agent::{Agent, Collaborators};
use roambot_core::config::{ConfigLoader, Settings};
use roambot_core::llm::{OllamaChat, OllamaConfig};
use roambot_core::store::FileStore;
use roambot_core::translate::Identity;
use roambot_core::world::{ItemStack, Position, StaticCatalog, WorldApi, WorldEvent, WorldStats};

const SETTINGS_FILE: &str = "settings.toml";
/// A child must stay up at least this long for its exit to count as healthy.
const MIN_UPTIME: Duration = Duration::from_secs(10);

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings: Settings = match ConfigLoader::parse_from_file(SETTINGS_FILE) {
        Ok(settings) => settings,
        Err(err) => {
            tracing::warn!("no usable {SETTINGS_FILE} ({err:#}); using defaults");
            Settings::default()
        }
    };

    match std::env::var("ROAMBOT_PROFILE") {
        Ok(profile) if !profile.trim().is_empty() => run_agent(settings, profile).await,
        _ => run_supervisor(settings).await,
    }
}

// ---------------------------------------------------------------------------
// Supervisor

async fn run_supervisor(settings: Settings) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("resolve current executable")?;
    tracing::info!(profiles = ?settings.profiles, "starting supervisor");

    let mut children = Vec::new();
    for profile in settings.profiles.clone() {
        let exe = exe.clone();
        children.push(tokio::spawn(async move {
            supervise_profile(exe, profile).await;
        }));
    }
    for child in children {
        let _ = child.await;
    }
    tracing::error!("All agent processes have ended. Exiting.");
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum RestartDecision {
    Restart,
    GiveUp,
}

/// Restart a crashed child unless it exited under the minimum uptime twice
/// in a row.
fn judge_exit(uptime: Duration, quick_exits_in_a_row: &mut u32) -> RestartDecision {
    if uptime < MIN_UPTIME {
        *quick_exits_in_a_row += 1;
        if *quick_exits_in_a_row >= 2 {
            return RestartDecision::GiveUp;
        }
    } else {
        *quick_exits_in_a_row = 0;
    }
    RestartDecision::Restart
}

async fn supervise_profile(exe: std::path::PathBuf, profile: String) {
    let mut quick_exits = 0u32;
    let mut restarted = false;
    loop {
        let started = Instant::now();
        let mut cmd = Command::new(&exe);
        cmd.env("ROAMBOT_PROFILE", &profile);
        if restarted {
            // A restarted agent reloads its memory and tells the world why.
            cmd.env("ROAMBOT_LOAD_MEMORY", "true");
            cmd.env("ROAMBOT_INIT_MESSAGE", "Agent process restarted.");
        }

        let status = match cmd.status().await {
            Ok(status) => status,
            Err(err) => {
                tracing::error!(%profile, "failed to start agent process: {err:#}");
                return;
            }
        };

        if status.success() {
            tracing::info!(%profile, "agent process exited cleanly");
            return;
        }

        match judge_exit(started.elapsed(), &mut quick_exits) {
            RestartDecision::GiveUp => {
                tracing::error!(
                    %profile,
                    "agent process exited too quickly twice in a row and will not be restarted"
                );
                return;
            }
            RestartDecision::Restart => {
                tracing::warn!(%profile, ?status, "agent process crashed; restarting");
                restarted = true;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Single-agent entry

async fn run_agent(mut settings: Settings, profile: String) -> anyhow::Result<()> {
    if let Ok(load) = std::env::var("ROAMBOT_LOAD_MEMORY") {
        settings.load_memory = matches!(load.trim(), "true" | "1");
    }
    if let Ok(init) = std::env::var("ROAMBOT_INIT_MESSAGE") {
        if !init.trim().is_empty() {
            settings.init_message = Some(init);
        }
    }

    let world_addr = env_or("ROAMBOT_WORLD_ADDR", "127.0.0.1:7878");
    let llm_endpoint = env_or(
        "ROAMBOT_LLM_ENDPOINT",
        "http://127.0.0.1:11434/api/generate",
    );
    let llm_model = env_or("ROAMBOT_LLM_MODEL", "mock");

    let world = Arc::new(RemoteWorld::connect(&world_addr).await?);
    let events = subscribe_events(&world_addr).await?;
    let model = Arc::new(OllamaChat::new(OllamaConfig {
        endpoint: llm_endpoint,
        model: llm_model,
    }));
    let store = Arc::new(FileStore::new(format!("memory/{profile}.json")));

    let agent = Agent::new(
        profile.clone(),
        settings,
        Collaborators {
            world,
            model,
            translator: Arc::new(Identity),
            store,
            catalog: Arc::new(StaticCatalog::default()),
        },
    )
    .map_err(|err| anyhow::anyhow!("building command registry: {err}"))?;

    tracing::info!(%profile, %world_addr, "agent connected");
    agent.run(events).await
}

// ---------------------------------------------------------------------------
// Remote world connection (JSON lines over TCP)

struct ControlConn {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

struct RemoteWorld {
    conn: Mutex<ControlConn>,
}

impl RemoteWorld {
    async fn connect(addr: &str) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect world control port {addr}"))?;
        let (read, write) = stream.into_split();
        Ok(Self {
            conn: Mutex::new(ControlConn {
                reader: BufReader::new(read),
                writer: write,
            }),
        })
    }

    async fn request_json(&self, req: Value) -> anyhow::Result<Value> {
        let line = format!("{req}\n");
        let mut conn = self.conn.lock().await;
        conn.writer
            .write_all(line.as_bytes())
            .await
            .context("control write")?;
        conn.writer.flush().await.ok();

        let mut resp_line = String::new();
        let n = conn
            .reader
            .read_line(&mut resp_line)
            .await
            .context("control read")?;
        if n == 0 {
            anyhow::bail!("control connection closed");
        }
        let v: Value =
            serde_json::from_str(resp_line.trim()).context("invalid control json response")?;
        Ok(v)
    }

    async fn skill(&self, name: &str, arguments: Value) -> anyhow::Result<Value> {
        let v = self
            .request_json(json!({ "op": "skill", "name": name, "arguments": arguments }))
            .await?;
        if v.get("ok").and_then(Value::as_bool) != Some(true) {
            anyhow::bail!("skill {name} failed: {v}");
        }
        Ok(v)
    }

    async fn skill_message(&self, name: &str, arguments: Value) -> anyhow::Result<String> {
        let v = self.skill(name, arguments).await?;
        Ok(v
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string())
    }
}

#[async_trait]
impl WorldApi for RemoteWorld {
    async fn chat(&self, text: &str) -> anyhow::Result<()> {
        self.skill("chat", json!({ "text": text })).await?;
        Ok(())
    }

    async fn finished_executing(&self) {
        let _ = self
            .request_json(json!({ "op": "finished_executing" }))
            .await;
    }

    async fn stats(&self) -> anyhow::Result<WorldStats> {
        let v = self.request_json(json!({ "op": "stats" })).await?;
        let stats = v
            .get("stats")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("missing stats in response"))?;
        serde_json::from_value(stats).context("decode stats")
    }

    async fn inventory(&self) -> anyhow::Result<Vec<ItemStack>> {
        let v = self.request_json(json!({ "op": "inventory" })).await?;
        let items = v
            .get("items")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("missing items in response"))?;
        serde_json::from_value(items).context("decode inventory")
    }

    async fn nearby_entities(&self) -> anyhow::Result<Vec<String>> {
        let v = self.request_json(json!({ "op": "entities" })).await?;
        let entities = v
            .get("entities")
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("missing entities in response"))?;
        serde_json::from_value(entities).context("decode entities")
    }

    async fn go_to_player(&self, name: &str, closeness: f64) -> anyhow::Result<String> {
        self.skill_message(
            "go_to_player",
            json!({ "name": name, "closeness": closeness }),
        )
        .await
    }

    async fn follow_player(&self, name: &str, distance: f64) -> anyhow::Result<String> {
        self.skill_message(
            "follow_player",
            json!({ "name": name, "distance": distance }),
        )
        .await
    }

    async fn go_to_position(&self, pos: Position, closeness: f64) -> anyhow::Result<String> {
        self.skill_message(
            "go_to_position",
            json!({ "x": pos.x, "y": pos.y, "z": pos.z, "closeness": closeness }),
        )
        .await
    }

    async fn go_to_block(
        &self,
        block: &str,
        closeness: f64,
        search_range: f64,
    ) -> anyhow::Result<String> {
        self.skill_message(
            "go_to_block",
            json!({ "block": block, "closeness": closeness, "search_range": search_range }),
        )
        .await
    }

    async fn move_away(&self, distance: f64) -> anyhow::Result<String> {
        self.skill_message("move_away", json!({ "distance": distance }))
            .await
    }

    async fn collect_block(&self, block: &str, count: u32) -> anyhow::Result<bool> {
        let v = self
            .skill("collect_block", json!({ "block": block, "count": count }))
            .await?;
        Ok(v.get("found").and_then(Value::as_bool).unwrap_or(true))
    }

    async fn craft_recipe(&self, recipe: &str, count: u32) -> anyhow::Result<String> {
        self.skill_message("craft_recipe", json!({ "recipe": recipe, "count": count }))
            .await
    }

    async fn smelt_item(&self, item: &str, count: u32) -> anyhow::Result<String> {
        self.skill_message("smelt_item", json!({ "item": item, "count": count }))
            .await
    }

    async fn clear_furnace(&self) -> anyhow::Result<String> {
        self.skill_message("clear_furnace", json!({})).await
    }

    async fn place_block(&self, block: &str, pos: Position) -> anyhow::Result<String> {
        self.skill_message(
            "place_block",
            json!({ "block": block, "x": pos.x, "y": pos.y, "z": pos.z }),
        )
        .await
    }

    async fn consume(&self, item: &str) -> anyhow::Result<String> {
        self.skill_message("consume", json!({ "item": item })).await
    }

    async fn equip(&self, item: &str) -> anyhow::Result<String> {
        self.skill_message("equip", json!({ "item": item })).await
    }

    async fn give_to_player(&self, item: &str, player: &str, count: u32) -> anyhow::Result<String> {
        self.skill_message(
            "give_to_player",
            json!({ "item": item, "player": player, "count": count }),
        )
        .await
    }

    async fn put_in_chest(&self, item: &str, count: u32) -> anyhow::Result<String> {
        self.skill_message("put_in_chest", json!({ "item": item, "count": count }))
            .await
    }

    async fn take_from_chest(&self, item: &str, count: u32) -> anyhow::Result<String> {
        self.skill_message("take_from_chest", json!({ "item": item, "count": count }))
            .await
    }

    async fn view_chest(&self) -> anyhow::Result<String> {
        self.skill_message("view_chest", json!({})).await
    }

    async fn discard(&self, item: &str, count: u32) -> anyhow::Result<String> {
        self.skill_message("discard", json!({ "item": item, "count": count }))
            .await
    }

    async fn attack_nearest(&self, entity: &str) -> anyhow::Result<String> {
        self.skill_message("attack_nearest", json!({ "entity": entity }))
            .await
    }

    async fn go_to_bed(&self) -> anyhow::Result<String> {
        self.skill_message("go_to_bed", json!({})).await
    }

    async fn stay(&self) -> anyhow::Result<String> {
        self.skill_message("stay", json!({})).await
    }

    async fn auto_eat(&self) -> anyhow::Result<Option<String>> {
        let note = self.skill_message("auto_eat", json!({})).await?;
        Ok(if note.is_empty() { None } else { Some(note) })
    }

    async fn defend_self(&self) -> anyhow::Result<Option<String>> {
        let note = self.skill_message("defend_self", json!({})).await?;
        Ok(if note.is_empty() { None } else { Some(note) })
    }

    async fn pick_up_nearby_items(&self) -> anyhow::Result<u32> {
        let v = self.skill("pick_up_nearby_items", json!({})).await?;
        Ok(v.get("count").and_then(Value::as_u64).unwrap_or(0) as u32)
    }
}

/// Opens the event subscription on a second connection and pumps parsed
/// events into the agent's queue. Closing the socket closes the channel,
/// which the agent treats as a fatal world event.
async fn subscribe_events(addr: &str) -> anyhow::Result<mpsc::Receiver<WorldEvent>> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connect world event port {addr}"))?;
    let (read, mut write) = stream.into_split();
    write
        .write_all(b"{\"op\":\"subscribe\"}\n")
        .await
        .context("subscribe write")?;

    let (tx, rx) = mpsc::channel(256);
    tokio::spawn(async move {
        let mut reader = BufReader::new(read);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let Ok(v) = serde_json::from_str::<Value>(line.trim()) else {
                tracing::warn!(raw = %line.trim(), "unparseable world event line");
                continue;
            };
            let Some(event) = parse_event(&v) else {
                tracing::warn!(raw = %v, "unknown world event");
                continue;
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });
    Ok(rx)
}

fn parse_event(v: &Value) -> Option<WorldEvent> {
    let kind = v.get("event").and_then(Value::as_str)?;
    let text = |key: &str| {
        v.get(key)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };
    match kind {
        "chat" => Some(WorldEvent::Chat {
            from: text("from"),
            text: text("text"),
        }),
        "whisper" => Some(WorldEvent::Whisper {
            from: text("from"),
            text: text("text"),
        }),
        "spawn" => Some(WorldEvent::Spawn),
        "health" => Some(WorldEvent::Health {
            health: v.get("health").and_then(Value::as_f64).unwrap_or(0.0),
            food: v.get("food").and_then(Value::as_f64).unwrap_or(0.0),
        }),
        "death" => Some(WorldEvent::Death {
            message: text("message"),
        }),
        "kicked" => Some(WorldEvent::Kicked {
            reason: text("reason"),
        }),
        "disconnected" => Some(WorldEvent::Disconnected {
            reason: text("reason"),
        }),
        "idle" => Some(WorldEvent::Idle),
        "time" => Some(WorldEvent::Time {
            time_of_day: v.get("time_of_day").and_then(Value::as_u64).unwrap_or(0) as u32,
        }),
        "custom" => Some(WorldEvent::Custom { text: text("text") }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_chat_event() {
        let v: Value =
            serde_json::from_str(r#"{"event":"chat","from":"Steve","text":"hi there"}"#).unwrap();
        assert_eq!(
            parse_event(&v),
            Some(WorldEvent::Chat {
                from: "Steve".to_string(),
                text: "hi there".to_string()
            })
        );
    }

    #[test]
    fn parse_health_and_unknown_events() {
        let v: Value = serde_json::from_str(r#"{"event":"health","health":7.5,"food":12}"#).unwrap();
        assert_eq!(
            parse_event(&v),
            Some(WorldEvent::Health {
                health: 7.5,
                food: 12.0
            })
        );

        let v: Value = serde_json::from_str(r#"{"event":"meteor_shower"}"#).unwrap();
        assert_eq!(parse_event(&v), None);
    }

    #[test]
    fn crash_loop_policy_gives_up_after_two_quick_exits_in_a_row() {
        let mut streak = 0;
        assert_eq!(
            judge_exit(Duration::from_secs(1), &mut streak),
            RestartDecision::Restart
        );
        assert_eq!(
            judge_exit(Duration::from_secs(2), &mut streak),
            RestartDecision::GiveUp
        );

        // A healthy run in between resets the streak.
        let mut streak = 0;
        assert_eq!(
            judge_exit(Duration::from_secs(3), &mut streak),
            RestartDecision::Restart
        );
        assert_eq!(
            judge_exit(Duration::from_secs(120), &mut streak),
            RestartDecision::Restart
        );
        assert_eq!(
            judge_exit(Duration::from_secs(3), &mut streak),
            RestartDecision::Restart
        );
    }
}
