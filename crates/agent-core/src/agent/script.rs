//! Generated-action contract: the model answers a generation request with
//! exactly one `<steps>[ ... ]</steps>` JSON block, a plan of primitive
//! skills the engine then runs in order under its cancellation scope.

use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::coder::{ActionFuture, ExecSignals, Work};
use super::history::Turn;
use crate::llm::ChatModel;
use crate::world::{Position, WorldApi};

pub const STEPS_START: &str = "<steps>";
pub const STEPS_END: &str = "</steps>";

const GENERATION_REQUEST: &str = "Plan the requested behavior as primitive skills. Return exactly one <steps>[...]</steps> block and nothing else. Each element is an object with a \"skill\" tag: go_to_player {player, closeness}, go_to_position {x, y, z}, move_away {distance}, collect_block {block, count}, craft_recipe {recipe, count}, place_block {block}, equip {item}, consume {item}, attack {entity}, chat {message}, wait {seconds}.";

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "skill", rename_all = "snake_case")]
pub enum SkillStep {
    GoToPlayer {
        player: String,
        #[serde(default = "default_closeness")]
        closeness: f64,
    },
    GoToPosition {
        x: f64,
        y: f64,
        z: f64,
    },
    MoveAway {
        distance: f64,
    },
    CollectBlock {
        block: String,
        #[serde(default = "default_count")]
        count: u32,
    },
    CraftRecipe {
        recipe: String,
        #[serde(default = "default_count")]
        count: u32,
    },
    PlaceBlock {
        block: String,
    },
    Equip {
        item: String,
    },
    Consume {
        item: String,
    },
    Attack {
        entity: String,
    },
    Chat {
        message: String,
    },
    Wait {
        seconds: f64,
    },
}

fn default_closeness() -> f64 {
    1.0
}

fn default_count() -> u32 {
    1
}

/// Extracts the JSON inside the first `<steps>...</steps>` block.
///
/// If there are multiple blocks, returns `None` so the caller can treat the
/// response as invalid.
pub fn extract_steps_json(script: &str) -> Option<String> {
    let start = script.find(STEPS_START)? + STEPS_START.len();
    let rest = &script[start..];
    let end_rel = rest.find(STEPS_END)?;
    let end = start + end_rel;

    let after_end = &script[end + STEPS_END.len()..];
    if after_end.contains(STEPS_START) {
        return None;
    }

    Some(script[start..end].trim().to_string())
}

/// Parses a full model response into a validated step plan.
pub fn parse_steps(script: &str) -> anyhow::Result<Vec<SkillStep>> {
    let json = extract_steps_json(script)
        .ok_or_else(|| anyhow::anyhow!("missing or ambiguous <steps> block"))?;
    let steps: Vec<SkillStep> = serde_json::from_str(&json).context("invalid steps json")?;
    if steps.is_empty() {
        anyhow::bail!("steps block is empty");
    }
    for step in &steps {
        validate_step(step)?;
    }
    Ok(steps)
}

fn validate_step(step: &SkillStep) -> anyhow::Result<()> {
    match step {
        SkillStep::GoToPlayer { player, .. } if player.trim().is_empty() => {
            anyhow::bail!("go_to_player: player must be non-empty")
        }
        SkillStep::CollectBlock { count, .. } | SkillStep::CraftRecipe { count, .. }
            if *count == 0 =>
        {
            anyhow::bail!("count must be at least 1")
        }
        SkillStep::Wait { seconds } if !(0.0..=300.0).contains(seconds) => {
            anyhow::bail!("wait: seconds must be within 0..=300")
        }
        _ => Ok(()),
    }
}

/// Asks the model for a step plan given the conversation. One repair
/// re-prompt on an invalid response, then gives up.
pub async fn generate_steps(
    model: &dyn ChatModel,
    mut history: Vec<Turn>,
) -> anyhow::Result<Vec<SkillStep>> {
    history.push(Turn::system(GENERATION_REQUEST));
    let raw = model.prompt_conversation(history.clone()).await?;
    match parse_steps(&raw) {
        Ok(steps) => Ok(steps),
        Err(err) => {
            history.push(Turn::system(format!(
                "Your previous response was invalid: {err:#}. Return exactly one <steps>[...]</steps> block and nothing else."
            )));
            let repaired = model.prompt_conversation(history).await?;
            parse_steps(&repaired).context("repair response still invalid")
        }
    }
}

/// Wraps a step plan as engine work: runs each step in order with a
/// cancellation/pause checkpoint in between.
pub fn steps_into_work(steps: Vec<SkillStep>, world: Arc<dyn WorldApi>) -> Work {
    Arc::new(move |signals| {
        let steps = steps.clone();
        let world = world.clone();
        run_steps(steps, world, signals)
    })
}

fn run_steps(steps: Vec<SkillStep>, world: Arc<dyn WorldApi>, mut sig: ExecSignals) -> ActionFuture {
    Box::pin(async move {
        let mut log: Vec<String> = Vec::new();
        for step in steps {
            sig.checkpoint().await?;
            let line = match run_step(&step, world.as_ref(), &sig).await? {
                Some(line) => line,
                // Cancelled mid-primitive; report what was done so far.
                None => break,
            };
            if !line.is_empty() {
                log.push(line);
            }
        }
        if log.is_empty() {
            Ok(None)
        } else {
            Ok(Some(log.join("\n")))
        }
    })
}

async fn run_step(
    step: &SkillStep,
    world: &dyn WorldApi,
    sig: &ExecSignals,
) -> anyhow::Result<Option<String>> {
    match step {
        SkillStep::GoToPlayer { player, closeness } => {
            sig.race(world.go_to_player(player, *closeness)).await
        }
        SkillStep::GoToPosition { x, y, z } => {
            let pos = Position {
                x: *x,
                y: *y,
                z: *z,
            };
            sig.race(world.go_to_position(pos, 1.0)).await
        }
        SkillStep::MoveAway { distance } => sig.race(world.move_away(distance.abs())).await,
        SkillStep::CollectBlock { block, count } => {
            let collected = sig.race(world.collect_block(block, *count)).await?;
            Ok(collected.map(|found| {
                if found {
                    format!("Collected {count} {block}.")
                } else {
                    format!("No reachable {block} found.")
                }
            }))
        }
        SkillStep::CraftRecipe { recipe, count } => {
            sig.race(world.craft_recipe(recipe, *count)).await
        }
        SkillStep::PlaceBlock { block } => {
            let pos = sig.race(world.position()).await?;
            match pos {
                Some(pos) => sig.race(world.place_block(block, pos)).await,
                None => Ok(None),
            }
        }
        SkillStep::Equip { item } => sig.race(world.equip(item)).await,
        SkillStep::Consume { item } => sig.race(world.consume(item)).await,
        SkillStep::Attack { entity } => sig.race(world.attack_nearest(entity)).await,
        SkillStep::Chat { message } => {
            world.chat(message).await?;
            Ok(Some(String::new()))
        }
        SkillStep::Wait { seconds } => {
            let wait = std::time::Duration::from_secs_f64(*seconds);
            let out = sig
                .race(async {
                    tokio::time::sleep(wait).await;
                    Ok(String::new())
                })
                .await?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::history::Speaker;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeModel {
        responses: Mutex<VecDeque<String>>,
        prompts: Mutex<Vec<Vec<Turn>>>,
    }

    impl FakeModel {
        fn push_response(&self, raw: impl Into<String>) {
            self.responses.lock().unwrap().push_back(raw.into());
        }
    }

    impl ChatModel for FakeModel {
        fn prompt_conversation<'a>(
            &'a self,
            history: Vec<Turn>,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<String>> + Send + 'a>> {
            Box::pin(async move {
                self.prompts.lock().unwrap().push(history);
                self.responses
                    .lock()
                    .unwrap()
                    .pop_front()
                    .ok_or_else(|| anyhow::anyhow!("no response queued"))
            })
        }
    }

    #[test]
    fn extract_ok() {
        let s = "plan:\n<steps>\n[{\"skill\":\"move_away\",\"distance\":5.0}]\n</steps>\n";
        let got = extract_steps_json(s).unwrap();
        assert_eq!(got, "[{\"skill\":\"move_away\",\"distance\":5.0}]");
    }

    #[test]
    fn extract_rejects_multiple_blocks() {
        let s = "<steps>[]</steps><steps>[]</steps>";
        assert!(extract_steps_json(s).is_none());
    }

    #[test]
    fn parse_validates_steps() {
        let s = "<steps>[{\"skill\":\"collect_block\",\"block\":\"oak_log\",\"count\":0}]</steps>";
        let err = parse_steps(s).unwrap_err();
        assert!(format!("{err:#}").contains("at least 1"));

        let s = "<steps>[{\"skill\":\"wait\",\"seconds\":9999}]</steps>";
        assert!(parse_steps(s).is_err());

        let s = "<steps>[{\"skill\":\"teleport\"}]</steps>";
        assert!(parse_steps(s).is_err());

        let s = "<steps>[{\"skill\":\"collect_block\",\"block\":\"oak_log\",\"count\":3},{\"skill\":\"chat\",\"message\":\"done\"}]</steps>";
        let steps = parse_steps(s).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(
            steps[0],
            SkillStep::CollectBlock {
                block: "oak_log".to_string(),
                count: 3
            }
        );
    }

    #[tokio::test]
    async fn generation_repairs_once_then_succeeds() {
        let model = FakeModel::default();
        model.push_response("no block here");
        model.push_response("<steps>[{\"skill\":\"move_away\",\"distance\":2.0}]</steps>");

        let history = vec![Turn::new(Speaker::Player("steve".into()), "back up a bit")];
        let steps = generate_steps(&model, history).await.unwrap();
        assert_eq!(steps, vec![SkillStep::MoveAway { distance: 2.0 }]);

        let prompts = model.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        let repair = prompts[1].last().unwrap();
        assert!(repair.content.contains("previous response was invalid"));
    }

    #[tokio::test]
    async fn generation_gives_up_after_failed_repair() {
        let model = FakeModel::default();
        model.push_response("still not a plan");
        model.push_response("also not a plan");

        let err = generate_steps(&model, vec![]).await.unwrap_err();
        assert!(format!("{err:#}").contains("repair response still invalid"));
    }
}
