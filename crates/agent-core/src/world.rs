use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Events emitted by the world connection. They never pre-empt in-progress
/// work; the agent observes them between its own suspension points.
#[derive(Debug, Clone, PartialEq)]
pub enum WorldEvent {
    Chat { from: String, text: String },
    Whisper { from: String, text: String },
    Spawn,
    Health { health: f64, food: f64 },
    Death { message: String },
    Kicked { reason: String },
    Disconnected { reason: String },
    Idle,
    Time { time_of_day: u32 },
    Custom { text: String },
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct WorldStats {
    pub position: Position,
    pub health: f64,
    pub food: f64,
    pub time_of_day: u32,
    #[serde(default)]
    pub weather: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ItemStack {
    pub name: String,
    pub count: u32,
}

macro_rules! unsupported {
    ($name:literal) => {
        anyhow::bail!(concat!($name, " is not supported by this world connection"))
    };
}

/// Boundary the agent uses to speak and act in the world.
///
/// `chat` is the single primitive for all user-visible text. The motor
/// skills are only ever invoked from inside an execution-engine task or a
/// mode-supervisor pass, so at most one logical actor drives the connection
/// at a time. Backends implement the subset they support; the defaults
/// report the skill as unavailable, which surfaces as a textual action
/// failure rather than a crash.
#[async_trait]
pub trait WorldApi: Send + Sync {
    async fn chat(&self, text: &str) -> anyhow::Result<()>;

    /// The message-handling loop signals this on every exit, regardless of
    /// exit reason, so the connection can re-arm its idle detection.
    async fn finished_executing(&self) {}

    async fn stats(&self) -> anyhow::Result<WorldStats> {
        unsupported!("stats")
    }

    async fn position(&self) -> anyhow::Result<Position> {
        Ok(self.stats().await?.position)
    }

    async fn inventory(&self) -> anyhow::Result<Vec<ItemStack>> {
        unsupported!("inventory")
    }

    async fn nearby_entities(&self) -> anyhow::Result<Vec<String>> {
        unsupported!("nearby_entities")
    }

    async fn go_to_player(&self, _name: &str, _closeness: f64) -> anyhow::Result<String> {
        unsupported!("go_to_player")
    }

    /// Runs until the connection drops the follow or the future is abandoned.
    async fn follow_player(&self, _name: &str, _distance: f64) -> anyhow::Result<String> {
        unsupported!("follow_player")
    }

    async fn go_to_position(&self, _pos: Position, _closeness: f64) -> anyhow::Result<String> {
        unsupported!("go_to_position")
    }

    async fn go_to_block(
        &self,
        _block: &str,
        _closeness: f64,
        _search_range: f64,
    ) -> anyhow::Result<String> {
        unsupported!("go_to_block")
    }

    async fn move_away(&self, _distance: f64) -> anyhow::Result<String> {
        unsupported!("move_away")
    }

    /// Returns `false` once no more matching blocks are reachable.
    async fn collect_block(&self, _block: &str, _count: u32) -> anyhow::Result<bool> {
        unsupported!("collect_block")
    }

    async fn craft_recipe(&self, _recipe: &str, _count: u32) -> anyhow::Result<String> {
        unsupported!("craft_recipe")
    }

    async fn smelt_item(&self, _item: &str, _count: u32) -> anyhow::Result<String> {
        unsupported!("smelt_item")
    }

    async fn clear_furnace(&self) -> anyhow::Result<String> {
        unsupported!("clear_furnace")
    }

    async fn place_block(&self, _block: &str, _pos: Position) -> anyhow::Result<String> {
        unsupported!("place_block")
    }

    async fn consume(&self, _item: &str) -> anyhow::Result<String> {
        unsupported!("consume")
    }

    async fn equip(&self, _item: &str) -> anyhow::Result<String> {
        unsupported!("equip")
    }

    async fn give_to_player(
        &self,
        _item: &str,
        _player: &str,
        _count: u32,
    ) -> anyhow::Result<String> {
        unsupported!("give_to_player")
    }

    async fn put_in_chest(&self, _item: &str, _count: u32) -> anyhow::Result<String> {
        unsupported!("put_in_chest")
    }

    async fn take_from_chest(&self, _item: &str, _count: u32) -> anyhow::Result<String> {
        unsupported!("take_from_chest")
    }

    async fn view_chest(&self) -> anyhow::Result<String> {
        unsupported!("view_chest")
    }

    async fn discard(&self, _item: &str, _count: u32) -> anyhow::Result<String> {
        unsupported!("discard")
    }

    async fn attack_nearest(&self, _entity: &str) -> anyhow::Result<String> {
        unsupported!("attack_nearest")
    }

    async fn go_to_bed(&self) -> anyhow::Result<String> {
        unsupported!("go_to_bed")
    }

    /// Holds position until abandoned.
    async fn stay(&self) -> anyhow::Result<String> {
        unsupported!("stay")
    }

    // Mode hooks. Like the motor skills these default to "not available";
    // connections that can't serve them simply make the mode a no-op.

    async fn auto_eat(&self) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    async fn defend_self(&self) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    async fn pick_up_nearby_items(&self) -> anyhow::Result<u32> {
        Ok(0)
    }
}

/// External name catalog used to validate enumerated-name command arguments
/// (block and item names) before dispatch.
pub trait NameCatalog: Send + Sync {
    fn is_block(&self, name: &str) -> bool;
    fn is_item(&self, name: &str) -> bool;
}

/// Fixed catalog built from name lists. Good enough for offline validation
/// and tests; a real deployment feeds it from the world connection's data.
pub struct StaticCatalog {
    blocks: Vec<String>,
    items: Vec<String>,
}

impl StaticCatalog {
    pub fn new<B, I>(blocks: B, items: I) -> Self
    where
        B: IntoIterator,
        B::Item: Into<String>,
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            blocks: blocks.into_iter().map(Into::into).collect(),
            items: items.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for StaticCatalog {
    fn default() -> Self {
        Self::new(
            [
                "stone",
                "dirt",
                "grass_block",
                "cobblestone",
                "oak_log",
                "oak_planks",
                "birch_log",
                "sand",
                "gravel",
                "coal_ore",
                "iron_ore",
                "crafting_table",
                "furnace",
                "chest",
                "torch",
                "bed",
            ],
            [
                "stick",
                "bread",
                "apple",
                "cooked_beef",
                "coal",
                "iron_ore",
                "iron_ingot",
                "wooden_pickaxe",
                "stone_pickaxe",
                "iron_pickaxe",
                "wooden_sword",
                "iron_sword",
                "oak_planks",
                "oak_log",
                "cobblestone",
                "torch",
            ],
        )
    }
}

impl NameCatalog for StaticCatalog {
    fn is_block(&self, name: &str) -> bool {
        self.blocks.iter().any(|b| b == name)
    }

    fn is_item(&self, name: &str) -> bool {
        self.items.iter().any(|i| i == name)
    }
}
